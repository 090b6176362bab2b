//! Client for the Orakl Network catalog API.
//!
//! The catalog is the source of truth for which listeners, reporters and
//! aggregators exist on a chain. The node only reads from it, apart from the
//! optional observed-block watermarks.

use alloy::primitives::{Address, I256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use std::fmt;
use url::Url;

use crate::{
    error::{ErrorKind, HasKind},
    service::Service,
};

/// Catalog API errors
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    /// request failed before a response was received, or the body was malformed
    #[error("catalog request: {0}")]
    Http(#[from] reqwest::Error),
    /// non success status
    #[error("catalog returned {status} for {url}")]
    Status {
        /// Requested url.
        url: Url,
        /// Returned status.
        status: StatusCode,
    },
    /// base url cannot carry path segments
    #[error("catalog base url cannot be a base: {0}")]
    BaseUrl(Url),
}

impl HasKind for ApiError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::BaseUrl(_) => ErrorKind::Configuration,
            Self::Http(_) | Self::Status { .. } => ErrorKind::DataSource,
        }
    }
}

/// Accept ids sent either as JSON strings or numbers.
pub(crate) fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Str(String),
        Num(u64),
    }

    Ok(match Id::deserialize(d)? {
        Id::Str(s) => s,
        Id::Num(n) => n.to_string(),
    })
}

/// A contract address watched for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub address: Address,
    pub event_name: String,
    pub chain: String,
    pub service: Service,
}

/// A reporter entry as stored in the catalog. Addresses are validated when a
/// wallet is built from it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReporterConfig {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub address: String,
    #[serde(skip_serializing, default)]
    pub private_key: String,
    pub oracle_address: String,
    pub chain: String,
    pub service: Service,
}

impl fmt::Debug for ReporterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReporterConfig")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("oracle_address", &self.oracle_address)
            .field("chain", &self.chain)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

/// Data feed aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregator {
    pub aggregator_hash: String,
    pub address: Address,
    /// Milliseconds between heartbeat submissions.
    pub heartbeat: u64,
    #[serde(default)]
    pub name: String,
}

/// Latest aggregated off-chain value for an aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub timestamp: DateTime<Utc>,
    pub value: serde_json::Value,
}

impl Aggregate {
    /// The value as a signed integer. [None] when it is not an integer.
    pub fn submission(&self) -> Option<I256> {
        match &self.value {
            serde_json::Value::Number(n) => {
                n.as_i64().map(I256::try_from).and_then(Result::ok).or_else(|| {
                    n.as_u64().and_then(|u| I256::try_from(u).ok())
                })
            }
            serde_json::Value::String(s) => s.trim().parse::<I256>().ok(),
            _ => None,
        }
    }
}

/// Read access to the catalog.
#[async_trait]
pub trait Catalog: fmt::Debug + Send + Sync {
    /// Listeners registered for `service` on `chain`.
    async fn listeners(&self, service: Service, chain: &str)
        -> Result<Vec<ListenerConfig>, ApiError>;

    /// Reporters registered for `service` on `chain`.
    async fn reporters(&self, service: Service, chain: &str)
        -> Result<Vec<ReporterConfig>, ApiError>;

    async fn reporter(&self, id: &str) -> Result<Option<ReporterConfig>, ApiError>;

    /// Reporter assigned to `oracle`.
    async fn reporter_by_oracle(
        &self,
        service: Service,
        chain: &str,
        oracle: Address,
    ) -> Result<Option<ReporterConfig>, ApiError>;

    async fn observed_block(&self, block_key: &str) -> Result<Option<u64>, ApiError>;

    async fn upsert_observed_block(&self, block_key: &str, block: u64) -> Result<(), ApiError>;

    /// Active aggregators on `chain`.
    async fn aggregators(&self, chain: &str) -> Result<Vec<Aggregator>, ApiError>;

    async fn aggregator_by_address(
        &self,
        chain: &str,
        address: Address,
    ) -> Result<Option<Aggregator>, ApiError>;

    async fn latest_aggregate(&self, aggregator_hash: &str)
        -> Result<Option<Aggregate>, ApiError>;
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObservedBlock {
    block_key: String,
    block_number: u64,
}

/// HTTP [`Catalog`].
#[derive(Debug, Clone)]
pub struct OraklApi {
    client: reqwest::Client,
    base: Url,
}

impl OraklApi {
    /// Create a new [Self].
    pub fn new(base: Url) -> Self {
        Self { client: reqwest::Client::new(), base }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::BaseUrl(self.base.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<Option<T>, ApiError> {
        let url = self.endpoint(segments)?;
        let response = self.client.get(url.clone()).query(query).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(response.json::<Option<T>>().await?),
            status => Err(ApiError::Status { url, status }),
        }
    }
}

#[async_trait]
impl Catalog for OraklApi {
    async fn listeners(
        &self,
        service: Service,
        chain: &str,
    ) -> Result<Vec<ListenerConfig>, ApiError> {
        let query = [("service", service.api_name()), ("chain", chain)];
        Ok(self.get(&["listener"], &query).await?.unwrap_or_default())
    }

    async fn reporters(
        &self,
        service: Service,
        chain: &str,
    ) -> Result<Vec<ReporterConfig>, ApiError> {
        let query = [("service", service.api_name()), ("chain", chain)];
        Ok(self.get(&["reporter"], &query).await?.unwrap_or_default())
    }

    async fn reporter(&self, id: &str) -> Result<Option<ReporterConfig>, ApiError> {
        self.get(&["reporter", id], &[]).await
    }

    async fn reporter_by_oracle(
        &self,
        service: Service,
        chain: &str,
        oracle: Address,
    ) -> Result<Option<ReporterConfig>, ApiError> {
        let oracle = oracle.to_string();
        let query = [("service", service.api_name()), ("chain", chain)];
        self.get(&["reporter", "oracle-address", &oracle], &query).await
    }

    async fn observed_block(&self, block_key: &str) -> Result<Option<u64>, ApiError> {
        let block: Option<ObservedBlock> =
            self.get(&["listener", "observed-block"], &[("blockKey", block_key)]).await?;
        Ok(block.map(|b| b.block_number))
    }

    async fn upsert_observed_block(&self, block_key: &str, block: u64) -> Result<(), ApiError> {
        let url = self.endpoint(&["listener", "observed-block"])?;
        let body = ObservedBlock { block_key: block_key.to_string(), block_number: block };
        let response = self.client.post(url.clone()).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::Status { url, status: response.status() });
        }
        Ok(())
    }

    async fn aggregators(&self, chain: &str) -> Result<Vec<Aggregator>, ApiError> {
        let query = [("chain", chain), ("active", "true")];
        Ok(self.get(&["aggregator"], &query).await?.unwrap_or_default())
    }

    async fn aggregator_by_address(
        &self,
        chain: &str,
        address: Address,
    ) -> Result<Option<Aggregator>, ApiError> {
        let address = address.to_string();
        self.get(&["aggregator", "address", &address], &[("chain", chain)]).await
    }

    async fn latest_aggregate(
        &self,
        aggregator_hash: &str,
    ) -> Result<Option<Aggregate>, ApiError> {
        self.get(&["aggregate", "hash", aggregator_hash, "latest"], &[]).await
    }
}
