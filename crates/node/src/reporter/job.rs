//! Queue processors for the nonce-manager and reporter stages.

use async_trait::async_trait;
use std::{sync::Arc, time::Instant};
use tracing::{debug, info, instrument, warn};

use super::{
    submit::{SubmitError, Submitter, TxStrategy},
    ReporterError, ReporterState,
};
use crate::{
    chain::{ChainClient, ChainError, ChainErrorKind},
    jobs::ReporterJob,
    metrics::Metrics,
    queue::{Job, JobOptions, Processor, Queue},
};

/// Submission trials per reporter job.
pub const MAX_TRIALS: usize = 3;

/// Signs and submits [`ReporterJob`]s, retrying per trial outcome.
#[derive(Debug)]
pub struct ReporterProcessor {
    state: Arc<ReporterState>,
    chain: Arc<dyn ChainClient>,
    submitter: Submitter,
    strategy: TxStrategy,
    metrics: Arc<Metrics>,
}

impl ReporterProcessor {
    /// Create a new [Self].
    pub const fn new(
        state: Arc<ReporterState>,
        chain: Arc<dyn ChainClient>,
        submitter: Submitter,
        strategy: TxStrategy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { state, chain, submitter, strategy, metrics }
    }
}

#[async_trait]
impl Processor<ReporterJob> for ReporterProcessor {
    type Error = ReporterError;

    #[instrument(skip_all, fields(service = %self.state.service(), id = job.id), err(Display))]
    async fn process(&self, job: &Job<ReporterJob>) -> Result<(), ReporterError> {
        let report = &job.payload;
        let service = self.state.service();
        let wallet =
            self.state.wallet(report.to).ok_or(ReporterError::WalletNotActive(report.to))?;

        let mut nonce = match report.nonce {
            Some(nonce) => nonce,
            None => wallet.next_nonce(self.chain.as_ref()).await,
        };
        let mut strategy = self.strategy;
        let started = Instant::now();
        let mut last = None;

        for trial in 1..=MAX_TRIALS {
            debug!(trial, nonce, strategy = strategy.as_ref(), "submitting");

            let error = match self.submitter.submit(strategy, &wallet, report, nonce).await {
                Ok(outcome) => {
                    self.metrics.observe_submission(service, started.elapsed().as_secs_f64());
                    info!(
                        tx_hash = %outcome.hash,
                        block_number = ?outcome.block_number,
                        nonce,
                        to = %report.to,
                        "transaction included"
                    );
                    return Ok(());
                }
                Err(SubmitError::Signing(reason)) => return Err(ReporterError::Signing(reason)),
                Err(SubmitError::NoDelegator) => return Err(ReporterError::NoDelegator),
                Err(SubmitError::Delegator(error)) => {
                    self.metrics.incr_reporter_err(service, "delegator");
                    warn!(trial, %error, "fee delegator failed, falling back to legacy");
                    strategy = TxStrategy::Legacy;
                    last = Some(ChainError::new(ChainErrorKind::Rpc, error.to_string()));
                    continue;
                }
                Err(SubmitError::Chain(error)) => error,
            };

            self.metrics.incr_reporter_err(service, error.kind.as_ref());
            match error.kind {
                ChainErrorKind::NonceExpired => {
                    nonce = wallet.next_nonce(self.chain.as_ref()).await;
                    warn!(trial, %error, nonce, "nonce expired, retrying with a fresh nonce");
                }
                kind if kind.retry_same_nonce() => {
                    warn!(trial, %error, nonce, "retrying with the same nonce");
                }
                _ => return Err(error.into()),
            }
            last = Some(error);
        }

        Err(ReporterError::TrialsExhausted {
            to: report.to,
            trials: MAX_TRIALS,
            last: last.unwrap_or_else(|| ChainError::new(ChainErrorKind::Rpc, "no trial ran")),
        })
    }
}

/// Assigns a nonce to reporter jobs ahead of the reporter queue.
#[derive(Debug)]
pub struct NonceManagerProcessor {
    state: Arc<ReporterState>,
    chain: Arc<dyn ChainClient>,
    reporter_queue: Queue<ReporterJob>,
}

impl NonceManagerProcessor {
    /// Create a new [Self].
    pub const fn new(
        state: Arc<ReporterState>,
        chain: Arc<dyn ChainClient>,
        reporter_queue: Queue<ReporterJob>,
    ) -> Self {
        Self { state, chain, reporter_queue }
    }
}

#[async_trait]
impl Processor<ReporterJob> for NonceManagerProcessor {
    type Error = ReporterError;

    async fn process(&self, job: &Job<ReporterJob>) -> Result<(), ReporterError> {
        // A nonce allocated for an id the reporter already knows would leave a gap.
        if self.reporter_queue.contains(&job.id) {
            debug!(id = job.id, "already handed to reporter");
            return Ok(());
        }

        let nonce = self.state.get_and_increment_nonce(self.chain.as_ref(), job.payload.to).await?;
        let report = ReporterJob { nonce: Some(nonce), ..job.payload.clone() };
        let options = JobOptions {
            job_id: Some(job.id.clone()),
            remove_on_complete: false,
            ..job.options.clone()
        };
        self.reporter_queue.add(report, options)?;

        debug!(id = job.id, nonce, "nonce assigned");
        Ok(())
    }
}
