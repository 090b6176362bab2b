//! VRF worker: proves the request's seed and builds `fulfillRandomWords`.

use alloy::{
    primitives::{keccak256, B256, U256},
    sol_types::SolCall,
};
use async_trait::async_trait;
use orakl_contracts::vrf_coordinator::IVRFCoordinator;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::info;
use url::Url;

use super::WorkerError;
use crate::{
    jobs::{ReporterJob, VrfRequest},
    queue::{JobOptions, Queue},
    service::Service,
};

/// VRF proof components in the layout the coordinator expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VrfProof {
    pub pk: [U256; 2],
    pub proof: [U256; 4],
    pub u_point: [U256; 2],
    pub v_components: [U256; 4],
}

/// Produces VRF proofs for an input.
#[async_trait]
pub trait VrfProver: fmt::Debug + Send + Sync {
    async fn prove(&self, alpha: B256) -> Result<VrfProof, WorkerError>;
}

/// [`VrfProver`] calling an external prover over HTTP.
#[derive(Debug, Clone)]
pub struct HttpVrfProver {
    client: reqwest::Client,
    url: Url,
}

impl HttpVrfProver {
    /// Create a new [Self] for the prover at `base`.
    pub fn new(base: Url) -> Result<Self, WorkerError> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| WorkerError::Request(format!("prover url cannot be a base: {base}")))?
            .pop_if_empty()
            .push("prove");
        Ok(Self { client: reqwest::Client::new(), url })
    }
}

#[derive(Serialize)]
struct ProveRequest {
    alpha: B256,
}

#[async_trait]
impl VrfProver for HttpVrfProver {
    async fn prove(&self, alpha: B256) -> Result<VrfProof, WorkerError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&ProveRequest { alpha })
            .send()
            .await
            .map_err(|e| WorkerError::Prover(e.to_string()))?;
        if !response.status().is_success() {
            return Err(WorkerError::Prover(format!("prover returned {}", response.status())));
        }
        response.json().await.map_err(|e| WorkerError::Prover(e.to_string()))
    }
}

/// `keccak256(abi.encodePacked(seed, blockHash))`
pub fn vrf_alpha(seed: U256, block_hash: B256) -> B256 {
    let mut packed = [0u8; 64];
    packed[..32].copy_from_slice(&seed.to_be_bytes::<32>());
    packed[32..].copy_from_slice(block_hash.as_slice());
    keccak256(packed)
}

/// Turns [`VrfRequest`]s into `fulfillRandomWords` jobs for the nonce manager.
#[derive(Debug)]
pub struct VrfWorker {
    prover: Arc<dyn VrfProver>,
    nonce_queue: Queue<ReporterJob>,
    gas_minimum: u64,
}

impl VrfWorker {
    /// Create a new [Self].
    pub const fn new(
        prover: Arc<dyn VrfProver>,
        nonce_queue: Queue<ReporterJob>,
        gas_minimum: u64,
    ) -> Self {
        Self { prover, nonce_queue, gas_minimum }
    }

    /// Default gas added to the callback gas limit.
    pub const fn default_gas_minimum() -> u64 {
        Service::Vrf.settings().fulfill_gas_minimum
    }

    /// Prove `request` and enqueue the fulfillment under `job_id`.
    pub async fn process(&self, job_id: &str, request: &VrfRequest) -> Result<ReporterJob, WorkerError> {
        let alpha = vrf_alpha(request.seed, request.block_hash);
        let proof = self.prover.prove(alpha).await?;

        let call = IVRFCoordinator::fulfillRandomWordsCall {
            proof: IVRFCoordinator::Proof {
                pk: proof.pk,
                proof: proof.proof,
                seed: request.seed,
                uPoint: proof.u_point,
                vComponents: proof.v_components,
            },
            rc: IVRFCoordinator::RequestCommitment {
                blockNum: request.block_num,
                accId: request.acc_id,
                callbackGasLimit: request.callback_gas_limit,
                numWords: request.num_words,
                sender: request.sender,
            },
            isDirectPayment: request.is_direct_payment,
        };

        let gas_limit = u64::from(request.callback_gas_limit) + self.gas_minimum;
        let report = ReporterJob::new(request.callback_address, call.abi_encode().into(), gas_limit);
        self.nonce_queue.add(report.clone(), JobOptions::with_id(job_id))?;

        info!(request_id = %request.request_id, gas_limit, "fulfillment enqueued");
        Ok(report)
    }
}
