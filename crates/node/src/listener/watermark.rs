//! Per-listener scan progress.

use alloy::primitives::Address;
use async_trait::async_trait;
use std::{fmt, sync::Arc};

use super::ListenerError;
use crate::{api::Catalog, store::KvStore};

/// Where watermarks are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum WatermarkSource {
    /// The node's key value store.
    #[default]
    Kv,
    /// The catalog's observed-block endpoints.
    Api,
}

/// `listener:<lowercase address>`
pub fn watermark_key(address: Address) -> String {
    format!("listener:{}", address.to_string().to_lowercase())
}

/// Next block to scan, per listener address.
#[async_trait]
pub trait Watermarks: fmt::Debug + Send + Sync {
    async fn get(&self, address: Address) -> Result<Option<u64>, ListenerError>;

    async fn set(&self, address: Address, block: u64) -> Result<(), ListenerError>;
}

/// [`Watermarks`] in the key value store.
#[derive(Debug, Clone)]
pub struct KvWatermarks {
    store: Arc<dyn KvStore>,
}

impl KvWatermarks {
    /// Create a new [Self].
    pub const fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Watermarks for KvWatermarks {
    async fn get(&self, address: Address) -> Result<Option<u64>, ListenerError> {
        let key = watermark_key(address);
        let Some(raw) = self.store.get(&key).await? else { return Ok(None) };
        raw.trim()
            .parse()
            .map(Some)
            .map_err(|_| ListenerError::Decode(format!("watermark under {key} is {raw:?}")))
    }

    async fn set(&self, address: Address, block: u64) -> Result<(), ListenerError> {
        Ok(self.store.set(&watermark_key(address), block.to_string()).await?)
    }
}

/// [`Watermarks`] kept by the catalog.
#[derive(Debug, Clone)]
pub struct ApiWatermarks {
    catalog: Arc<dyn Catalog>,
}

impl ApiWatermarks {
    /// Create a new [Self].
    pub const fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Watermarks for ApiWatermarks {
    async fn get(&self, address: Address) -> Result<Option<u64>, ListenerError> {
        Ok(self.catalog.observed_block(&watermark_key(address)).await?)
    }

    async fn set(&self, address: Address, block: u64) -> Result<(), ListenerError> {
        Ok(self.catalog.upsert_observed_block(&watermark_key(address), block).await?)
    }
}
