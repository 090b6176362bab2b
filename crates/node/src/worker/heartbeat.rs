//! Heartbeat submissions for data feeds whose rounds would otherwise time out.

use alloy::{
    primitives::{Address, U256},
    sol_types::SolCall,
};
use dashmap::DashMap;
use orakl_contracts::aggregator::IAggregator;
use std::{sync::Arc, time::Duration};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::WorkerError;
use crate::{
    chain::ChainClient,
    jobs::{AggregatorJob, WorkerJob, WorkerSource},
    listener::aggregator_job_id,
    queue::{JobOptions, Queue},
    reporter::ReporterState,
};

/// Delay until the next heartbeat aligned with the current round start.
///
/// `heartbeat` is in milliseconds, timestamps in seconds. A zero `started_at`
/// means no round was started yet, and the full heartbeat is used.
pub fn synchronized_delay(heartbeat: u64, block_timestamp: u64, started_at: u64) -> Duration {
    if heartbeat == 0 || started_at == 0 {
        return Duration::from_millis(heartbeat);
    }
    let elapsed = block_timestamp.saturating_sub(started_at).saturating_mul(1000);
    Duration::from_millis(heartbeat - elapsed % heartbeat)
}

/// `oracleRoundState(operator, round)` of aggregator `oracle`.
pub async fn oracle_round_state(
    chain: &dyn ChainClient,
    oracle: Address,
    operator: Address,
    round: u32,
) -> Result<IAggregator::oracleRoundStateReturn, WorkerError> {
    let call = IAggregator::oracleRoundStateCall { _oracle: operator, _queriedRoundId: round };
    let output = chain.call(oracle, call.abi_encode().into()).await?;
    Ok(IAggregator::oracleRoundStateCall::abi_decode_returns(&output, true)?)
}

/// `currentRoundStartedAt()` of aggregator `oracle`, in seconds.
pub async fn current_round_started_at(
    chain: &dyn ChainClient,
    oracle: Address,
) -> Result<u64, WorkerError> {
    let call = IAggregator::currentRoundStartedAtCall {};
    let output = chain.call(oracle, call.abi_encode().into()).await?;
    let started_at: U256 =
        IAggregator::currentRoundStartedAtCall::abi_decode_returns(&output, true)?._0;
    Ok(started_at.saturating_to())
}

#[derive(Debug)]
struct HeartbeatTask {
    reset: Arc<Notify>,
    cancel: CancellationToken,
}

/// One heartbeat task per active aggregator.
#[derive(Debug)]
pub struct Heartbeats {
    chain: Arc<dyn ChainClient>,
    reporters: Arc<ReporterState>,
    worker_queue: Queue<WorkerJob>,
    deployment: String,
    tasks: DashMap<Address, HeartbeatTask>,
    shutdown: CancellationToken,
}

impl Heartbeats {
    /// Create a new [Self]. Tasks are children of `shutdown`.
    pub fn new(
        chain: Arc<dyn ChainClient>,
        reporters: Arc<ReporterState>,
        worker_queue: Queue<WorkerJob>,
        deployment: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            chain,
            reporters,
            worker_queue,
            deployment: deployment.into(),
            tasks: DashMap::new(),
            shutdown,
        }
    }

    /// Start the heartbeat of `oracle`, replacing any running one.
    pub fn start(&self, oracle: Address, heartbeat: Duration, first_delay: Duration) {
        let reset = Arc::new(Notify::new());
        let cancel = self.shutdown.child_token();
        let beat = Beat {
            chain: Arc::clone(&self.chain),
            reporters: Arc::clone(&self.reporters),
            worker_queue: self.worker_queue.clone(),
            deployment: self.deployment.clone(),
            oracle,
        };

        tokio::spawn(beat.run(heartbeat, first_delay, Arc::clone(&reset), cancel.clone()));

        if let Some(previous) = self.tasks.insert(oracle, HeartbeatTask { reset, cancel }) {
            previous.cancel.cancel();
        }
        info!(%oracle, ?heartbeat, ?first_delay, "heartbeat started");
    }

    /// Push the next heartbeat of `oracle` a full period away.
    pub fn reset(&self, oracle: Address) {
        if let Some(task) = self.tasks.get(&oracle) {
            task.reset.notify_one();
        }
    }

    /// Stop the heartbeat of `oracle`.
    pub fn stop(&self, oracle: Address) {
        if let Some((_, task)) = self.tasks.remove(&oracle) {
            task.cancel.cancel();
        }
    }

    /// Queue the heartbeats feed into.
    pub fn worker_queue(&self) -> &Queue<WorkerJob> {
        &self.worker_queue
    }

    /// Whether `oracle` has a running heartbeat.
    pub fn is_running(&self, oracle: Address) -> bool {
        self.tasks.contains_key(&oracle)
    }
}

struct Beat {
    chain: Arc<dyn ChainClient>,
    reporters: Arc<ReporterState>,
    worker_queue: Queue<WorkerJob>,
    deployment: String,
    oracle: Address,
}

impl Beat {
    async fn run(
        self,
        heartbeat: Duration,
        first_delay: Duration,
        reset: Arc<Notify>,
        cancel: CancellationToken,
    ) {
        let mut delay = first_delay;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = reset.notified() => {
                    delay = heartbeat;
                    continue;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = heartbeat;

            if let Err(error) = self.fire().await {
                warn!(oracle = %self.oracle, %error, "heartbeat failed");
            }
        }
        debug!(oracle = %self.oracle, "heartbeat stopped");
    }

    async fn fire(&self) -> Result<(), WorkerError> {
        let operator = self
            .reporters
            .wallet(self.oracle)
            .ok_or(WorkerError::OperatorUnknown(self.oracle))?
            .address();
        let state = oracle_round_state(self.chain.as_ref(), self.oracle, operator, 0).await?;
        if !state._eligibleToSubmit {
            debug!(oracle = %self.oracle, round = state._roundId, "heartbeat not eligible");
            return Ok(());
        }

        let job = WorkerJob::Aggregator(AggregatorJob {
            oracle_address: self.oracle,
            round_id: state._roundId,
            source: WorkerSource::Heartbeat,
        });
        let job_id = aggregator_job_id(state._roundId, self.oracle, &self.deployment);
        let options = JobOptions { remove_on_fail: true, ..JobOptions::with_id(job_id) };
        if self.worker_queue.add(job, options)?.is_some() {
            info!(oracle = %self.oracle, round = state._roundId, "heartbeat job enqueued");
        }
        Ok(())
    }
}
