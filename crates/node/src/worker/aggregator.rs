//! Data feed worker: decides whether this node submits to a round and builds
//! the `submit` call.

use alloy::{
    primitives::{Address, I256, U256},
    sol_types::SolCall,
};
use chrono::{DateTime, Utc};
use orakl_contracts::aggregator::IAggregator;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{
    heartbeat::{current_round_started_at, oracle_round_state, synchronized_delay, Heartbeats},
    round::RoundTracker,
    WorkerError,
};
use crate::{
    api::{Aggregator, Catalog},
    chain::ChainClient,
    jobs::{
        AggregatorJob, AggregatorSubmission, DeviationRequest, ReporterJob, WorkerJob,
        WorkerSource,
    },
    listener::aggregator_job_id,
    queue::{JobOptions, Queue},
    reporter::ReporterState,
    service::Service,
    store::{self, KvStore},
};

/// Default max age of the latest aggregate.
pub const MAX_DATA_STALENESS: Duration = Duration::from_millis(5_000);

/// Aggregators this node submits to, persisted under the worker state key.
#[derive(Debug)]
pub struct Aggregators {
    chain_name: String,
    state_key: String,
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn KvStore>,
    active: RwLock<HashMap<Address, Aggregator>>,
}

impl Aggregators {
    /// Create a new [Self] with no active aggregators.
    pub fn new(
        chain_name: impl Into<String>,
        deployment: &str,
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            chain_name: chain_name.into(),
            state_key: Service::DataFeed.state_key(deployment, "worker"),
            catalog,
            store,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Active aggregator at `address`.
    pub fn get(&self, address: Address) -> Option<Aggregator> {
        self.active.read().get(&address).cloned()
    }

    /// Active aggregators, ordered by address.
    pub fn active(&self) -> Vec<Aggregator> {
        sorted(&self.active.read())
    }

    async fn replace(&self, aggregators: Vec<Aggregator>) -> Result<(), WorkerError> {
        self.commit(aggregators.into_iter().map(|a| (a.address, a)).collect()).await
    }

    async fn insert(&self, aggregator: Aggregator) -> Result<(), WorkerError> {
        let mut active = self.active.read().clone();
        active.insert(aggregator.address, aggregator);
        self.commit(active).await
    }

    async fn remove(&self, address: Address) -> Result<Option<Aggregator>, WorkerError> {
        let mut active = self.active.read().clone();
        let removed = active.remove(&address);
        if removed.is_some() {
            self.commit(active).await?;
        }
        Ok(removed)
    }

    /// Persist `active`, then swap it in.
    async fn commit(&self, active: HashMap<Address, Aggregator>) -> Result<(), WorkerError> {
        store::set_json(self.store.as_ref(), &self.state_key, &sorted(&active)).await?;
        *self.active.write() = active;
        Ok(())
    }
}

fn sorted(active: &HashMap<Address, Aggregator>) -> Vec<Aggregator> {
    let mut aggregators: Vec<_> = active.values().cloned().collect();
    aggregators.sort_by_key(|a| a.address);
    aggregators
}

/// Settings of the data feed worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFeedSettings {
    /// Gas limit of `submit` transactions.
    pub gas_minimum: u64,
    /// Max age of the latest aggregate.
    pub max_staleness: Duration,
}

impl Default for DataFeedSettings {
    fn default() -> Self {
        Self {
            gas_minimum: Service::DataFeed.settings().fulfill_gas_minimum,
            max_staleness: MAX_DATA_STALENESS,
        }
    }
}

/// Turns [`AggregatorJob`]s into `submit` reporter jobs.
#[derive(Debug)]
pub struct DataFeedWorker {
    chain_name: String,
    deployment: String,
    catalog: Arc<dyn Catalog>,
    chain: Arc<dyn ChainClient>,
    reporters: Arc<ReporterState>,
    aggregators: Aggregators,
    tracker: RoundTracker,
    heartbeats: Heartbeats,
    reporter_queue: Queue<ReporterJob>,
    settings: DataFeedSettings,
    write_lock: Mutex<()>,
}

impl DataFeedWorker {
    /// Create a new [Self].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_name: impl Into<String>,
        deployment: impl Into<String>,
        catalog: Arc<dyn Catalog>,
        chain: Arc<dyn ChainClient>,
        reporters: Arc<ReporterState>,
        aggregators: Aggregators,
        heartbeats: Heartbeats,
        reporter_queue: Queue<ReporterJob>,
        settings: DataFeedSettings,
    ) -> Self {
        Self {
            chain_name: chain_name.into(),
            deployment: deployment.into(),
            catalog,
            chain,
            reporters,
            aggregators,
            tracker: RoundTracker::new(),
            heartbeats,
            reporter_queue,
            settings,
            write_lock: Mutex::new(()),
        }
    }

    /// Active aggregators.
    pub fn active(&self) -> Vec<Aggregator> {
        self.aggregators.active()
    }

    /// Aggregators registered in the catalog.
    pub async fn all(&self) -> Result<Vec<Aggregator>, WorkerError> {
        Ok(self.catalog.aggregators(&self.chain_name).await?)
    }

    /// Restore the persisted aggregators, or every catalog aggregator when none
    /// are persisted, and start their heartbeats.
    pub async fn start(&self) -> Result<Vec<Aggregator>, WorkerError> {
        let stored: Option<Vec<Aggregator>> =
            store::get_json(self.aggregators.store.as_ref(), &self.aggregators.state_key).await?;
        match stored.filter(|s| !s.is_empty()) {
            Some(stored) => {
                let _guard = self.write_lock.lock().await;
                self.aggregators.replace(stored).await?;
                for aggregator in self.aggregators.active() {
                    self.start_heartbeat(&aggregator).await;
                }
                Ok(self.aggregators.active())
            }
            None => self.refresh().await,
        }
    }

    /// Replace the active aggregators with the catalog's.
    pub async fn refresh(&self) -> Result<Vec<Aggregator>, WorkerError> {
        let _guard = self.write_lock.lock().await;
        let aggregators = self.all().await?;

        for previous in self.aggregators.active() {
            self.heartbeats.stop(previous.address);
        }
        self.aggregators.replace(aggregators).await?;
        for aggregator in self.aggregators.active() {
            self.start_heartbeat(&aggregator).await;
        }

        Ok(self.aggregators.active())
    }

    /// Start submitting to the aggregator at `address`.
    pub async fn activate(&self, address: Address) -> Result<Aggregator, WorkerError> {
        let _guard = self.write_lock.lock().await;
        if self.aggregators.get(address).is_some() {
            return Err(WorkerError::AggregatorAlreadyActive(address));
        }
        let aggregator = self
            .catalog
            .aggregator_by_address(&self.chain_name, address)
            .await?
            .ok_or(WorkerError::AggregatorNotFound(address))?;

        self.aggregators.insert(aggregator.clone()).await?;
        self.start_heartbeat(&aggregator).await;
        Ok(aggregator)
    }

    /// Stop submitting to the aggregator at `address`.
    pub async fn deactivate(&self, address: Address) -> Result<Aggregator, WorkerError> {
        let _guard = self.write_lock.lock().await;
        let removed =
            self.aggregators.remove(address).await?.ok_or(WorkerError::AggregatorNotActive(address))?;
        self.heartbeats.stop(address);
        self.tracker.remove(address);
        Ok(removed)
    }

    /// Whether the heartbeat of `address` is running.
    pub fn heartbeat_running(&self, address: Address) -> bool {
        self.heartbeats.is_running(address)
    }

    async fn start_heartbeat(&self, aggregator: &Aggregator) {
        let heartbeat = Duration::from_millis(aggregator.heartbeat);
        let first_delay = match self.first_delay(aggregator).await {
            Ok(delay) => delay,
            Err(error) => {
                warn!(oracle = %aggregator.address, %error, "using unsynchronized heartbeat");
                heartbeat
            }
        };
        self.heartbeats.start(aggregator.address, heartbeat, first_delay);
    }

    async fn first_delay(&self, aggregator: &Aggregator) -> Result<Duration, WorkerError> {
        let started_at = current_round_started_at(self.chain.as_ref(), aggregator.address).await?;
        let block_timestamp = self.chain.latest_block_timestamp().await?;
        Ok(synchronized_delay(aggregator.heartbeat, block_timestamp, started_at))
    }

    /// Build and enqueue a submission for `job`. [None] when this node should
    /// not submit.
    #[instrument(skip_all, fields(oracle = %job.oracle_address, round = job.round_id, source = job.source.as_ref()))]
    pub async fn process(
        &self,
        job: &AggregatorJob,
    ) -> Result<Option<AggregatorSubmission>, WorkerError> {
        let oracle = job.oracle_address;
        if self.aggregators.get(oracle).is_none() {
            debug!("aggregator not active");
            return Ok(None);
        }

        let aggregator = self
            .catalog
            .aggregator_by_address(&self.chain_name, oracle)
            .await?
            .ok_or(WorkerError::AggregatorNotFound(oracle))?;
        let aggregate = self
            .catalog
            .latest_aggregate(&aggregator.aggregator_hash)
            .await?
            .ok_or_else(|| WorkerError::MissingAggregate(aggregator.aggregator_hash.clone()))?;
        let submission = aggregate.submission().ok_or_else(|| {
            WorkerError::InvalidAggregate(format!(
                "{} has non numeric value {}",
                aggregator.aggregator_hash, aggregate.value
            ))
        })?;

        if self.is_stale(aggregate.timestamp) {
            return Ok(None);
        }

        let operator = self.operator(oracle)?;
        let state = oracle_round_state(self.chain.as_ref(), oracle, operator, job.round_id).await?;
        if !state._eligibleToSubmit {
            debug!("not eligible on chain");
            return Ok(None);
        }

        self.hand_off(oracle, job.round_id, job.source, submission)
    }

    /// Submit a deviating aggregate to the round currently open for this
    /// node's operator.
    #[instrument(skip_all, fields(oracle = %request.oracle_address, source = "deviation"))]
    pub async fn deviation(
        &self,
        request: &DeviationRequest,
    ) -> Result<Option<AggregatorSubmission>, WorkerError> {
        let oracle = request.oracle_address;
        if self.aggregators.get(oracle).is_none() {
            debug!("aggregator not active");
            return Ok(None);
        }
        if self.is_stale(request.timestamp) {
            return Ok(None);
        }

        let operator = self.operator(oracle)?;
        let state = oracle_round_state(self.chain.as_ref(), oracle, operator, 0).await?;
        if !state._eligibleToSubmit {
            debug!(round = state._roundId, "not eligible on chain");
            return Ok(None);
        }

        self.hand_off(oracle, state._roundId, WorkerSource::Deviation, request.submission)
    }

    /// Queue a deviation job on the data feed worker queue.
    pub fn enqueue_deviation(
        &self,
        request: DeviationRequest,
    ) -> Result<Option<String>, WorkerError> {
        let options = JobOptions { remove_on_fail: true, ..Default::default() };
        Ok(self.heartbeats.worker_queue().add(WorkerJob::Deviation(request), options)?)
    }

    fn is_stale(&self, timestamp: DateTime<Utc>) -> bool {
        let age = Utc::now().signed_duration_since(timestamp);
        let stale = age.to_std().is_ok_and(|age| age > self.settings.max_staleness);
        if stale {
            warn!(age_ms = age.num_milliseconds(), "aggregate is stale");
        }
        stale
    }

    fn operator(&self, oracle: Address) -> Result<Address, WorkerError> {
        Ok(self.reporters.wallet(oracle).ok_or(WorkerError::OperatorUnknown(oracle))?.address())
    }

    /// Claim `round` for `source` and hand the `submit` call to the reporter.
    fn hand_off(
        &self,
        oracle: Address,
        round_id: u32,
        source: WorkerSource,
        submission: I256,
    ) -> Result<Option<AggregatorSubmission>, WorkerError> {
        let job_id = aggregator_job_id(round_id, oracle, &self.deployment);

        // The chain still accepts this round, yet the reporter forgot its job:
        // the earlier submission failed for good.
        if !self.reporter_queue.contains(&job_id) && self.tracker.release(oracle, round_id) {
            warn!(round = round_id, "earlier submission was dropped, round released");
        }
        if !self.tracker.claim(oracle, round_id, source) {
            debug!(round = round_id, "round claimed or already submitted");
            return Ok(None);
        }

        let call =
            IAggregator::submitCall { _roundId: U256::from(round_id), _submission: submission };
        let report = ReporterJob::new(oracle, call.abi_encode().into(), self.settings.gas_minimum);
        let options =
            JobOptions { remove_on_fail: true, remove_on_complete: false, ..JobOptions::with_id(job_id) };
        self.reporter_queue.add(report.clone(), options)?;
        self.tracker.mark_submitted(oracle, round_id);
        self.heartbeats.reset(oracle);

        info!(round = round_id, %submission, "submission enqueued");
        Ok(Some(AggregatorSubmission {
            report,
            callback_address: oracle,
            worker_source: source,
            round_id,
            submission,
        }))
    }
}
