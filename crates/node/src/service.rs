//! The closed set of oracle services the node can run, and the per-service
//! settings that would otherwise be looked up by string key.

use alloy::{primitives::B256, sol_types::SolEvent};
use orakl_contracts::{
    aggregator::IAggregator, request_response_coordinator::IRequestResponseCoordinator,
    vrf_coordinator::IVRFCoordinator,
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Oracle service.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Service {
    /// Aggregator rounds for price feeds.
    DataFeed,
    /// Verifiable random words.
    Vrf,
    /// Arbitrary HTTP sourced data.
    RequestResponse,
}

/// Pipeline stage a queue belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    /// Listener output, worker input.
    Worker,
    /// Nonce allocation ahead of submission.
    NonceManager,
    /// Transaction submission.
    Reporter,
}

/// Static settings for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    /// Name of the contract event listeners of this service watch.
    pub event_name: &'static str,
    /// Topic0 of that event.
    pub event_signature: B256,
    /// Default worker pool size.
    pub worker_concurrency: usize,
    /// Default reporter pool size.
    pub reporter_concurrency: usize,
    /// Route reporter jobs through the nonce-manager stage.
    pub uses_nonce_manager: bool,
    /// Default gas added on top of the request's callback gas limit.
    pub fulfill_gas_minimum: u64,
}

impl Service {
    /// Every service, in a stable order.
    pub const ALL: [Self; 3] = [Self::DataFeed, Self::Vrf, Self::RequestResponse];

    /// Settings for this service.
    pub const fn settings(self) -> ServiceSettings {
        match self {
            Self::DataFeed => ServiceSettings {
                event_name: "NewRound",
                event_signature: IAggregator::NewRound::SIGNATURE_HASH,
                worker_concurrency: 5,
                reporter_concurrency: 5,
                uses_nonce_manager: false,
                fulfill_gas_minimum: 400_000,
            },
            Self::Vrf => ServiceSettings {
                event_name: "RandomWordsRequested",
                event_signature: IVRFCoordinator::RandomWordsRequested::SIGNATURE_HASH,
                worker_concurrency: 1,
                reporter_concurrency: 1,
                uses_nonce_manager: true,
                fulfill_gas_minimum: 1_000_000,
            },
            Self::RequestResponse => ServiceSettings {
                event_name: "DataRequested",
                event_signature: IRequestResponseCoordinator::DataRequested::SIGNATURE_HASH,
                worker_concurrency: 1,
                reporter_concurrency: 1,
                uses_nonce_manager: false,
                fulfill_gas_minimum: 400_000,
            },
        }
    }

    /// Name used by the catalog API.
    pub const fn api_name(self) -> &'static str {
        match self {
            Self::DataFeed => "DATA_FEED",
            Self::Vrf => "VRF",
            Self::RequestResponse => "REQUEST_RESPONSE",
        }
    }

    /// Name used in queue names, state keys and control plane routes.
    pub const fn slug(self) -> &'static str {
        match self {
            Self::DataFeed => "data-feed",
            Self::Vrf => "vrf",
            Self::RequestResponse => "request-response",
        }
    }

    /// `<deployment>-<stage>-<service>`
    pub fn queue_name(self, deployment: &str, stage: Stage) -> String {
        format!("{deployment}-{}-{}", stage.as_ref(), self.slug())
    }

    /// `<deployment>-<half>-<service>-state`, where `half` is `listener`,
    /// `worker` or `reporter`.
    pub fn state_key(self, deployment: &str, half: &str) -> String {
        format!("{deployment}-{half}-{}-state", self.slug())
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Error parsing a [`Service`].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown service: {0}")]
pub struct UnknownService(pub String);

impl FromStr for Service {
    type Err = UnknownService;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|service| service.slug() == s || service.api_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownService(s.to_string()))
    }
}
