//! Decoding of watched contract events into worker jobs.

use alloy::{
    primitives::{Address, B256},
    rpc::types::Log,
    sol_types::SolEvent,
};
use dashmap::DashMap;
use orakl_contracts::{
    aggregator::IAggregator, request_response_coordinator::IRequestResponseCoordinator,
    vrf_coordinator::IVRFCoordinator,
};
use std::sync::Arc;
use tracing::debug;

use super::ListenerError;
use crate::{
    api::{Catalog, ListenerConfig},
    jobs::{AggregatorJob, DataRequest, VrfRequest, WorkerJob, WorkerSource},
    service::Service,
};

/// `<roundId>-<oracle>-<deployment>`
pub fn aggregator_job_id(round_id: u32, oracle: Address, deployment: &str) -> String {
    format!("{round_id}-{oracle}-{deployment}")
}

/// A worker job and the id it is queued under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEvent {
    pub job_id: String,
    pub job: WorkerJob,
}

/// Turns logs of one service's event into worker jobs.
#[derive(Debug)]
pub struct EventProcessor {
    service: Service,
    chain: String,
    deployment: String,
    catalog: Arc<dyn Catalog>,
    vrf_key_hash: Option<B256>,
    /// Operator address per oracle. Misses are not cached so that reporters
    /// registered later are picked up.
    operators: DashMap<Address, Address>,
}

impl EventProcessor {
    /// Create a new [Self].
    pub fn new(
        service: Service,
        chain: impl Into<String>,
        deployment: impl Into<String>,
        catalog: Arc<dyn Catalog>,
        vrf_key_hash: Option<B256>,
    ) -> Self {
        Self {
            service,
            chain: chain.into(),
            deployment: deployment.into(),
            catalog,
            vrf_key_hash,
            operators: DashMap::new(),
        }
    }

    /// Decode `log`. [None] when the event is not meant for this node.
    pub async fn process(
        &self,
        listener: &ListenerConfig,
        log: &Log,
    ) -> Result<Option<ProcessedEvent>, ListenerError> {
        match self.service {
            Service::DataFeed => self.new_round(listener, log).await,
            Service::Vrf => self.random_words_requested(listener, log),
            Service::RequestResponse => self.data_requested(listener, log),
        }
    }

    async fn new_round(
        &self,
        listener: &ListenerConfig,
        log: &Log,
    ) -> Result<Option<ProcessedEvent>, ListenerError> {
        let event = decode::<IAggregator::NewRound>(log)?;
        let oracle = listener.address;

        if self.operator(oracle).await? == Some(event.startedBy) {
            debug!(%oracle, round = %event.roundId, "round started by this node");
            return Ok(None);
        }

        let round_id = u32::try_from(event.roundId)
            .map_err(|_| ListenerError::Decode(format!("round id {} overflows", event.roundId)))?;

        Ok(Some(ProcessedEvent {
            job_id: aggregator_job_id(round_id, oracle, &self.deployment),
            job: WorkerJob::Aggregator(AggregatorJob {
                oracle_address: oracle,
                round_id,
                source: WorkerSource::Event,
            }),
        }))
    }

    fn random_words_requested(
        &self,
        listener: &ListenerConfig,
        log: &Log,
    ) -> Result<Option<ProcessedEvent>, ListenerError> {
        let event = decode::<IVRFCoordinator::RandomWordsRequested>(log)?;

        if self.vrf_key_hash.is_some_and(|key_hash| key_hash != event.keyHash) {
            debug!(key_hash = %event.keyHash, "request for another key");
            return Ok(None);
        }

        let (block_num, block_hash) = block_of(log)?;
        Ok(Some(ProcessedEvent {
            job_id: event.requestId.to_string(),
            job: WorkerJob::Vrf(VrfRequest {
                callback_address: listener.address,
                block_num,
                block_hash,
                request_id: event.requestId,
                seed: event.preSeed,
                acc_id: event.accId,
                callback_gas_limit: event.callbackGasLimit,
                num_words: event.numWords,
                sender: event.sender,
                is_direct_payment: event.isDirectPayment,
            }),
        }))
    }

    fn data_requested(
        &self,
        listener: &ListenerConfig,
        log: &Log,
    ) -> Result<Option<ProcessedEvent>, ListenerError> {
        let event = decode::<IRequestResponseCoordinator::DataRequested>(log)?;
        let (block_num, _) = block_of(log)?;

        Ok(Some(ProcessedEvent {
            job_id: event.requestId.to_string(),
            job: WorkerJob::RequestResponse(DataRequest {
                callback_address: listener.address,
                block_num,
                request_id: event.requestId,
                job_id: event.jobId,
                acc_id: event.accId,
                callback_gas_limit: event.callbackGasLimit,
                sender: event.sender,
                is_direct_payment: event.isDirectPayment,
                num_submission: event.numSubmission,
                data: event.data,
            }),
        }))
    }

    async fn operator(&self, oracle: Address) -> Result<Option<Address>, ListenerError> {
        if let Some(operator) = self.operators.get(&oracle) {
            return Ok(Some(*operator));
        }

        let operator: Option<Address> = self
            .catalog
            .reporter_by_oracle(self.service, &self.chain, oracle)
            .await?
            .and_then(|reporter| reporter.address.trim().parse().ok());
        if let Some(operator) = operator {
            self.operators.insert(oracle, operator);
        }
        Ok(operator)
    }
}

fn decode<E: SolEvent>(log: &Log) -> Result<E, ListenerError> {
    E::decode_log_data(log.data(), true)
        .map_err(|e| ListenerError::Decode(format!("{}: {e}", E::SIGNATURE)))
}

fn block_of(log: &Log) -> Result<(u64, B256), ListenerError> {
    match (log.block_number, log.block_hash) {
        (Some(number), Some(hash)) => Ok((number, hash)),
        _ => Err(ListenerError::Decode("log is missing its block".to_string())),
    }
}
