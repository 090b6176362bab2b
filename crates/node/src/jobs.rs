//! Job payloads that travel between pipeline stages.

use alloy::primitives::{Address, Bytes, B256, I256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What triggered an aggregator submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::AsRefStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "lowercase")]
pub enum WorkerSource {
    /// A `NewRound` event started by another oracle.
    Event,
    /// The heartbeat timer fired without a new round being observed.
    Heartbeat,
    /// A fresh aggregate moved past the deviation threshold.
    Deviation,
}

/// Request for the data feed worker to submit to `round_id` of an aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorJob {
    /// Aggregator contract address.
    pub oracle_address: Address,
    /// Round to submit to.
    pub round_id: u32,
    /// Trigger of this attempt.
    pub source: WorkerSource,
}

/// Aggregate pushed by the fetcher because it deviates from the last
/// submission. The round is read from chain when the job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviationRequest {
    /// Aggregator contract address.
    pub oracle_address: Address,
    /// Value to submit.
    pub submission: I256,
    /// When the value was aggregated.
    pub timestamp: DateTime<Utc>,
}

/// Decoded `RandomWordsRequested` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VrfRequest {
    /// Coordinator contract that emitted the request.
    pub callback_address: Address,
    /// Block the request was included in.
    pub block_num: u64,
    /// Hash of that block. Mixed into the proof input.
    pub block_hash: B256,
    pub request_id: U256,
    /// Pre-seed from the event.
    pub seed: U256,
    pub acc_id: u64,
    pub callback_gas_limit: u32,
    pub num_words: u32,
    pub sender: Address,
    pub is_direct_payment: bool,
}

/// Decoded `DataRequested` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
    /// Coordinator contract that emitted the request.
    pub callback_address: Address,
    pub block_num: u64,
    pub request_id: U256,
    /// Hash of the requested response type name.
    pub job_id: B256,
    pub acc_id: u64,
    pub callback_gas_limit: u32,
    pub sender: Address,
    pub is_direct_payment: bool,
    pub num_submission: u8,
    /// CBOR encoded request definition.
    pub data: Bytes,
}

/// Payload of a worker queue job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerJob {
    /// Data feed round.
    Aggregator(AggregatorJob),
    /// Data feed submission of a deviating aggregate.
    Deviation(DeviationRequest),
    /// VRF request.
    Vrf(VrfRequest),
    /// Request-response request.
    RequestResponse(DataRequest),
}

/// Signed transaction input ready for submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReporterJob {
    /// ABI encoded call data.
    pub payload: Bytes,
    pub gas_limit: u64,
    /// Contract receiving the transaction. Also the key of the wallet used.
    pub to: Address,
    /// Set by the nonce-manager stage. When absent the reporter allocates one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
}

impl ReporterJob {
    /// A job with no preassigned nonce.
    pub const fn new(to: Address, payload: Bytes, gas_limit: u64) -> Self {
        Self { payload, gas_limit, to, nonce: None }
    }
}

/// Record of a data feed submission, kept for the heartbeat and metrics paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorSubmission {
    pub report: ReporterJob,
    pub callback_address: Address,
    pub worker_source: WorkerSource,
    pub round_id: u32,
    pub submission: I256,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_job_is_tagged() {
        let job = WorkerJob::Aggregator(AggregatorJob {
            oracle_address: Address::repeat_byte(1),
            round_id: 3,
            source: WorkerSource::Heartbeat,
        });
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "aggregator");
        assert_eq!(value["roundId"], 3);
        assert_eq!(value["source"], "heartbeat");

        let back: WorkerJob = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn reporter_job_omits_absent_nonce() {
        let job = ReporterJob::new(Address::ZERO, Bytes::from_static(&[1, 2]), 21_000);
        let value = serde_json::to_value(&job).unwrap();
        assert!(value.get("nonce").is_none());
        assert_eq!(value["gasLimit"], 21_000);
    }
}
