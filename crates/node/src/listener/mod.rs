//! Listener half of the pipeline.
//!
//! Each active listener is a task polling one contract for one event. A poll
//! reads the chain head, scans `[watermark, head]`, enqueues a worker job per
//! decoded event and only then moves the watermark to `head + 1`. A failed
//! poll leaves the watermark untouched, so the range is scanned again on the
//! next tick and the worker queue's job ids absorb the duplicates.

use alloy::primitives::B256;
use parking_lot::Mutex as SyncMutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    api::{ApiError, Catalog, ListenerConfig},
    chain::{ChainClient, ChainError},
    error::{ErrorKind, HasKind},
    jobs::WorkerJob,
    metrics::Metrics,
    queue::{JobOptions, Queue, QueueError},
    service::Service,
    store::{self, KvStore, StoreError},
};

mod events;
mod watermark;

pub use events::{aggregator_job_id, EventProcessor, ProcessedEvent};
pub use watermark::{watermark_key, ApiWatermarks, KvWatermarks, WatermarkSource, Watermarks};

/// Listener errors
#[derive(thiserror::Error, Debug)]
pub enum ListenerError {
    /// listener is already active
    #[error("listener {0} is already active")]
    ListenerAlreadyActive(String),
    /// listener is not in the catalog for this service and chain
    #[error("listener {0} not added")]
    ListenerNotAdded(String),
    /// listener is not active
    #[error("listener {0} not found")]
    ListenerNotFound(String),
    /// listener watches an event this service does not handle
    #[error("listener {id} watches {found}, expected {expected}")]
    EventMismatch {
        /// Listener id.
        id: String,
        /// Event of the service.
        expected: &'static str,
        /// Event of the listener.
        found: String,
    },
    /// log or stored value could not be decoded
    #[error("decode: {0}")]
    Decode(String),
    /// catalog error
    #[error(transparent)]
    Api(#[from] ApiError),
    /// store error
    #[error(transparent)]
    Store(#[from] StoreError),
    /// chain error
    #[error(transparent)]
    Chain(#[from] ChainError),
    /// queue error
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl HasKind for ListenerError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::ListenerAlreadyActive(_) |
            Self::ListenerNotAdded(_) |
            Self::ListenerNotFound(_) |
            Self::EventMismatch { .. } |
            Self::Decode(_) => ErrorKind::Configuration,
            Self::Api(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Chain(e) => e.kind(),
            Self::Queue(e) => e.kind(),
        }
    }
}

/// Scans block ranges of one service's listeners into the worker queue.
#[derive(Debug)]
pub struct Scanner {
    service: Service,
    event_signature: B256,
    chain: Arc<dyn ChainClient>,
    watermarks: Arc<dyn Watermarks>,
    processor: EventProcessor,
    queue: Queue<WorkerJob>,
    metrics: Arc<Metrics>,
}

impl Scanner {
    /// Create a new [Self].
    pub fn new(
        service: Service,
        chain: Arc<dyn ChainClient>,
        watermarks: Arc<dyn Watermarks>,
        processor: EventProcessor,
        queue: Queue<WorkerJob>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            service,
            event_signature: service.settings().event_signature,
            chain,
            watermarks,
            processor,
            queue,
            metrics,
        }
    }

    /// Run one poll. Returns the scanned range, or [None] when the head has
    /// not reached the watermark yet.
    pub async fn poll(&self, listener: &ListenerConfig) -> Result<Option<(u64, u64)>, ListenerError> {
        let latest = self.chain.block_number().await?;
        let from = self.seed(listener, latest).await?;
        if latest < from {
            return Ok(None);
        }

        self.scan(listener, from, latest).await?;
        self.watermarks.set(listener.address, latest + 1).await?;
        Ok(Some((from, latest)))
    }

    /// Stored watermark, or `latest` after storing it when there is none.
    async fn seed(&self, listener: &ListenerConfig, latest: u64) -> Result<u64, ListenerError> {
        match self.watermarks.get(listener.address).await? {
            Some(block) => Ok(block),
            None => {
                self.watermarks.set(listener.address, latest).await?;
                Ok(latest)
            }
        }
    }

    /// Enqueue jobs for events in `[from, to]`. Returns the number enqueued.
    pub async fn scan(
        &self,
        listener: &ListenerConfig,
        from: u64,
        to: u64,
    ) -> Result<usize, ListenerError> {
        let logs = self.chain.logs(listener.address, self.event_signature, from, to).await?;

        let mut enqueued = 0;
        for log in &logs {
            let event = match self.processor.process(listener, log).await {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(error) if error.kind() == ErrorKind::Configuration => {
                    warn!(service = %self.service, id = listener.id, %error, "skipping log");
                    continue;
                }
                Err(error) => return Err(error),
            };

            let options = JobOptions { remove_on_fail: true, ..JobOptions::with_id(&event.job_id) };
            if self.queue.add(event.job, options)?.is_some() {
                enqueued += 1;
            }
        }

        if enqueued > 0 {
            self.metrics.incr_listener_events(self.service, enqueued as u64);
            info!(service = %self.service, id = listener.id, from, to, enqueued, "events enqueued");
        }
        Ok(enqueued)
    }
}

/// Active listeners of one service.
#[derive(Debug)]
pub struct ListenerState {
    service: Service,
    chain_name: String,
    state_key: String,
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn KvStore>,
    chain: Arc<dyn ChainClient>,
    scanner: Arc<Scanner>,
    delay: Duration,
    backfill_blocks: u64,
    tasks: SyncMutex<HashMap<String, (CancellationToken, JoinHandle<()>)>>,
    write_lock: Mutex<()>,
    shutdown: CancellationToken,
}

/// Listener loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerSettings {
    /// Poll interval.
    pub delay: Duration,
    /// Blocks before the head scanned once on activation.
    pub backfill_blocks: u64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self { delay: Duration::from_millis(500), backfill_blocks: 10 }
    }
}

impl ListenerState {
    /// Create a new [Self]. Poll tasks are children of `shutdown`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_name: impl Into<String>,
        deployment: &str,
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn KvStore>,
        chain: Arc<dyn ChainClient>,
        scanner: Scanner,
        settings: ListenerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let service = scanner.service;
        Self {
            service,
            chain_name: chain_name.into(),
            state_key: service.state_key(deployment, "listener"),
            catalog,
            store,
            chain,
            scanner: Arc::new(scanner),
            delay: settings.delay,
            backfill_blocks: settings.backfill_blocks,
            tasks: SyncMutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
            shutdown,
        }
    }

    /// Service this state belongs to.
    pub const fn service(&self) -> Service {
        self.service
    }

    /// Listeners registered in the catalog.
    pub async fn all(&self) -> Result<Vec<ListenerConfig>, ListenerError> {
        Ok(self.catalog.listeners(self.service, &self.chain_name).await?)
    }

    /// Persisted active set.
    pub async fn active(&self) -> Result<Vec<ListenerConfig>, ListenerError> {
        Ok(store::get_json(self.store.as_ref(), &self.state_key).await?.unwrap_or_default())
    }

    /// Ids with a running poll task.
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.tasks.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Restore the persisted active set. When nothing is persisted every
    /// catalog entry is activated.
    pub async fn start(&self) -> Result<Vec<ListenerConfig>, ListenerError> {
        let _guard = self.write_lock.lock().await;
        let stored = self.active().await?;
        if stored.is_empty() {
            return self.replace_all().await;
        }

        for listener in &stored {
            self.launch(listener).await?;
        }
        info!(service = %self.service, count = stored.len(), "listeners restored");
        Ok(stored)
    }

    /// Activate listener `id`.
    pub async fn activate(&self, id: &str) -> Result<ListenerConfig, ListenerError> {
        let _guard = self.write_lock.lock().await;

        let mut active = self.active().await?;
        if active.iter().any(|l| l.id == id) {
            return Err(ListenerError::ListenerAlreadyActive(id.to_string()));
        }

        let listener = self
            .all()
            .await?
            .into_iter()
            .find(|l| l.id == id)
            .ok_or_else(|| ListenerError::ListenerNotAdded(id.to_string()))?;
        self.check_event(&listener)?;

        self.scanner.seed(&listener, self.chain.block_number().await?).await?;
        active.push(listener.clone());
        self.persist(&active).await?;
        self.launch(&listener).await?;

        info!(service = %self.service, id, address = %listener.address, "listener activated");
        Ok(listener)
    }

    /// Deactivate listener `id`.
    pub async fn deactivate(&self, id: &str) -> Result<ListenerConfig, ListenerError> {
        let _guard = self.write_lock.lock().await;

        let mut active = self.active().await?;
        let position = active
            .iter()
            .position(|l| l.id == id)
            .ok_or_else(|| ListenerError::ListenerNotFound(id.to_string()))?;
        let listener = active.remove(position);
        self.persist(&active).await?;
        self.stop(id).await;

        info!(service = %self.service, id, "listener deactivated");
        Ok(listener)
    }

    /// Empty the active set and stop every poll task.
    pub async fn clear(&self) -> Result<(), ListenerError> {
        let _guard = self.write_lock.lock().await;
        self.persist(&[]).await?;
        self.stop_all().await;
        Ok(())
    }

    /// Stop every poll task and activate every catalog entry.
    pub async fn refresh(&self) -> Result<Vec<ListenerConfig>, ListenerError> {
        let _guard = self.write_lock.lock().await;
        self.replace_all().await
    }

    /// Cancel the poll task of `id` without touching the active set.
    /// Returns false when no task was running.
    pub async fn stop(&self, id: &str) -> bool {
        let task = self.tasks.lock().remove(id);
        match task {
            Some((cancel, handle)) => {
                cancel.cancel();
                let _ = handle.await;
                true
            }
            None => false,
        }
    }

    /// Cancel and wait for every poll task.
    pub async fn stop_all(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain().collect();
        for (_, (cancel, handle)) in tasks {
            cancel.cancel();
            let _ = handle.await;
        }
    }

    async fn replace_all(&self) -> Result<Vec<ListenerConfig>, ListenerError> {
        self.stop_all().await;

        let latest = self.chain.block_number().await?;
        let mut active = Vec::new();
        for listener in self.all().await? {
            if let Err(error) = self.check_event(&listener) {
                warn!(service = %self.service, %error, "skipping listener");
                continue;
            }
            if active.iter().any(|l: &ListenerConfig| l.id == listener.id) {
                continue;
            }
            self.scanner.seed(&listener, latest).await?;
            active.push(listener);
        }

        self.persist(&active).await?;
        for listener in &active {
            self.launch(listener).await?;
        }

        info!(service = %self.service, count = active.len(), "listeners refreshed");
        Ok(active)
    }

    fn check_event(&self, listener: &ListenerConfig) -> Result<(), ListenerError> {
        let expected = self.service.settings().event_name;
        if listener.event_name != expected {
            return Err(ListenerError::EventMismatch {
                id: listener.id.clone(),
                expected,
                found: listener.event_name.clone(),
            });
        }
        Ok(())
    }

    /// Spawn the poll task and run the activation backfill.
    async fn launch(&self, listener: &ListenerConfig) -> Result<(), ListenerError> {
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.scanner),
            listener.clone(),
            self.delay,
            cancel.clone(),
        ));

        let previous = self.tasks.lock().insert(listener.id.clone(), (cancel, handle));
        if let Some((cancel, _)) = previous {
            cancel.cancel();
        }

        self.backfill(listener).await;
        Ok(())
    }

    async fn backfill(&self, listener: &ListenerConfig) {
        if self.backfill_blocks == 0 {
            return;
        }

        if let Err(error) = self.backfill_range(listener).await {
            warn!(service = %self.service, id = listener.id, %error, "backfill failed");
        }
    }

    /// Scan `[latest - k, latest - 1]`.
    async fn backfill_range(&self, listener: &ListenerConfig) -> Result<usize, ListenerError> {
        let latest = self.chain.block_number().await?;
        if latest == 0 {
            return Ok(0);
        }
        let from = latest.saturating_sub(self.backfill_blocks);
        self.scanner.scan(listener, from, latest - 1).await
    }

    async fn persist(&self, active: &[ListenerConfig]) -> Result<(), StoreError> {
        store::set_json(self.store.as_ref(), &self.state_key, &active).await
    }
}

async fn poll_loop(
    scanner: Arc<Scanner>,
    listener: ListenerConfig,
    delay: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(delay);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match scanner.poll(&listener).await {
            Ok(Some((from, to))) => debug!(id = listener.id, from, to, "scanned"),
            Ok(None) => {}
            Err(error) => {
                warn!(service = %scanner.service, id = listener.id, %error, "poll failed")
            }
        }
    }

    debug!(id = listener.id, "listener stopped");
}
