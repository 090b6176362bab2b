//! Worker stage: turns listener output into reporter jobs.

use alloy::primitives::Address;
use async_trait::async_trait;
use std::sync::Arc;

use crate::{
    api::ApiError,
    chain::ChainError,
    error::{ErrorKind, HasKind},
    jobs::WorkerJob,
    queue::{Job, Processor, QueueError},
    service::Service,
    store::StoreError,
};

mod aggregator;
mod heartbeat;
mod request_response;
mod round;
mod vrf;

pub use aggregator::{Aggregators, DataFeedSettings, DataFeedWorker, MAX_DATA_STALENESS};
pub use heartbeat::{oracle_round_state, synchronized_delay, Heartbeats};
pub use request_response::{
    decode_cbor_pairs, DataRequestSpec, Reducer, RequestResponseWorker, ResponseType,
};
pub use round::RoundTracker;
pub use vrf::{vrf_alpha, HttpVrfProver, VrfProof, VrfProver, VrfWorker};

/// Worker errors
#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    /// job was routed to the worker of another service
    #[error("{service} worker received a {job} job")]
    UnexpectedJob {
        /// Service of the worker.
        service: Service,
        /// Kind of job received.
        job: &'static str,
    },
    /// aggregator is not in the catalog
    #[error("aggregator {0} not found")]
    AggregatorNotFound(Address),
    /// aggregator is already active
    #[error("aggregator {0} is already active")]
    AggregatorAlreadyActive(Address),
    /// aggregator is not active
    #[error("aggregator {0} is not active")]
    AggregatorNotActive(Address),
    /// no reporter wallet is active for the oracle
    #[error("no operator for oracle {0}")]
    OperatorUnknown(Address),
    /// no aggregate is available
    #[error("no aggregate for {0}")]
    MissingAggregate(String),
    /// aggregate value is unusable
    #[error("invalid aggregate: {0}")]
    InvalidAggregate(String),
    /// VRF prover failed
    #[error("vrf prover: {0}")]
    Prover(String),
    /// request definition is malformed
    #[error("invalid request: {0}")]
    Request(String),
    /// fetching request data failed
    #[error("fetch: {0}")]
    Fetch(#[from] reqwest::Error),
    /// fetched data did not reduce to a value
    #[error("reduce: {0}")]
    Reduce(String),
    /// contract call returned data that does not decode
    #[error("abi: {0}")]
    Abi(#[from] alloy::sol_types::Error),
    /// catalog error
    #[error(transparent)]
    Api(#[from] ApiError),
    /// chain error
    #[error(transparent)]
    Chain(#[from] ChainError),
    /// queue error
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// store error
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HasKind for WorkerError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::UnexpectedJob { .. } |
            Self::AggregatorNotFound(_) |
            Self::AggregatorAlreadyActive(_) |
            Self::AggregatorNotActive(_) |
            Self::Request(_) => ErrorKind::Configuration,
            Self::OperatorUnknown(_) => ErrorKind::WalletAbsent,
            Self::MissingAggregate(_) |
            Self::InvalidAggregate(_) |
            Self::Prover(_) |
            Self::Fetch(_) |
            Self::Reduce(_) |
            Self::Abi(_) => ErrorKind::DataSource,
            Self::Api(e) => e.kind(),
            Self::Chain(e) => e.kind(),
            Self::Queue(e) => e.kind(),
            Self::Store(e) => e.kind(),
        }
    }
}

/// The worker of one service.
#[derive(Debug)]
pub enum ServiceWorker {
    DataFeed(Arc<DataFeedWorker>),
    Vrf(VrfWorker),
    RequestResponse(RequestResponseWorker),
}

impl ServiceWorker {
    /// Service handled by this worker.
    pub const fn service(&self) -> Service {
        match self {
            Self::DataFeed(_) => Service::DataFeed,
            Self::Vrf(_) => Service::Vrf,
            Self::RequestResponse(_) => Service::RequestResponse,
        }
    }

    /// The data feed worker, if this is one.
    pub const fn data_feed(&self) -> Option<&Arc<DataFeedWorker>> {
        match self {
            Self::DataFeed(worker) => Some(worker),
            Self::Vrf(_) | Self::RequestResponse(_) => None,
        }
    }
}

const fn job_name(job: &WorkerJob) -> &'static str {
    match job {
        WorkerJob::Aggregator(_) => "aggregator",
        WorkerJob::Deviation(_) => "deviation",
        WorkerJob::Vrf(_) => "vrf",
        WorkerJob::RequestResponse(_) => "request-response",
    }
}

#[async_trait]
impl Processor<WorkerJob> for ServiceWorker {
    type Error = WorkerError;

    async fn process(&self, job: &Job<WorkerJob>) -> Result<(), WorkerError> {
        match (self, &job.payload) {
            (Self::DataFeed(worker), WorkerJob::Aggregator(round)) => {
                worker.process(round).await.map(drop)
            }
            (Self::DataFeed(worker), WorkerJob::Deviation(request)) => {
                worker.deviation(request).await.map(drop)
            }
            (Self::Vrf(worker), WorkerJob::Vrf(request)) => {
                worker.process(&job.id, request).await.map(drop)
            }
            (Self::RequestResponse(worker), WorkerJob::RequestResponse(request)) => {
                worker.process(&job.id, request).await.map(drop)
            }
            (worker, payload) => Err(WorkerError::UnexpectedJob {
                service: worker.service(),
                job: job_name(payload),
            }),
        }
    }
}
