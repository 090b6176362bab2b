//! Reporter half of the pipeline: active wallets, nonce allocation and the
//! transaction submission stages.

use alloy::primitives::Address;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    api::{ApiError, Catalog, ReporterConfig},
    chain::{ChainClient, ChainError},
    error::{ErrorKind, HasKind},
    queue::QueueError,
    service::Service,
    store::{self, KvStore, StoreError},
};

mod job;
mod nonce;
mod submit;
mod wallet;

pub use job::{NonceManagerProcessor, ReporterProcessor, MAX_TRIALS};
pub use nonce::{NonceLock, NONCE_RETRY_INTERVAL};
pub use submit::{
    Delegator, DelegatorError, DelegatorRequest, HttpDelegator, SubmitError, Submitter,
    TxStrategy,
};
pub use wallet::{Wallet, WalletError};

/// Reporter errors
#[derive(thiserror::Error, Debug)]
pub enum ReporterError {
    /// reporter is already active
    #[error("reporter {0} is already active")]
    ReporterAlreadyActive(String),
    /// reporter could not be activated
    #[error("reporter {id} not added: {reason}")]
    ReporterNotAdded {
        /// Requested reporter id.
        id: String,
        /// Why it was refused.
        reason: String,
    },
    /// reporter is not active
    #[error("reporter {0} not found")]
    ReporterNotFound(String),
    /// no wallet is active for the oracle
    #[error("no active wallet for oracle {0}")]
    WalletNotActive(Address),
    /// catalog error
    #[error(transparent)]
    Api(#[from] ApiError),
    /// store error
    #[error(transparent)]
    Store(#[from] StoreError),
    /// chain error
    #[error(transparent)]
    Chain(#[from] ChainError),
    /// queue error
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// transaction could not be signed
    #[error("signing: {0}")]
    Signing(String),
    /// fee delegation is configured without a fee delegator
    #[error("fee delegated transaction without a fee delegator")]
    NoDelegator,
    /// every trial failed with a retryable error
    #[error("gave up on transaction to {to} after {trials} trials: {last}")]
    TrialsExhausted {
        /// Transaction target.
        to: Address,
        /// Trials attempted.
        trials: usize,
        /// Error of the last trial.
        last: ChainError,
    },
}

impl HasKind for ReporterError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::ReporterAlreadyActive(_) |
            Self::ReporterNotAdded { .. } |
            Self::ReporterNotFound(_) |
            Self::Signing(_) |
            Self::NoDelegator => ErrorKind::Configuration,
            Self::WalletNotActive(_) => ErrorKind::WalletAbsent,
            Self::Api(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Chain(e) => e.kind(),
            Self::TrialsExhausted { last, .. } => last.kind(),
            Self::Queue(e) => e.kind(),
        }
    }
}

/// Active reporters of one service, keyed by the oracle they report into.
///
/// Every mutation builds a new wallet map under `write_lock`, persists it and
/// only then swaps it in, so memory never runs ahead of the snapshot.
#[derive(Debug)]
pub struct ReporterState {
    service: Service,
    chain: String,
    state_key: String,
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn KvStore>,
    wallets: RwLock<HashMap<Address, Arc<Wallet>>>,
    write_lock: Mutex<()>,
    nonce_retry: Duration,
}

impl ReporterState {
    /// Create a new [Self] with no active reporters.
    pub fn new(
        service: Service,
        chain: impl Into<String>,
        deployment: &str,
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            service,
            chain: chain.into(),
            state_key: service.state_key(deployment, "reporter"),
            catalog,
            store,
            wallets: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
            nonce_retry: NONCE_RETRY_INTERVAL,
        }
    }

    /// Override the delay between remote nonce reads.
    pub const fn with_nonce_retry(mut self, nonce_retry: Duration) -> Self {
        self.nonce_retry = nonce_retry;
        self
    }

    /// Service this state belongs to.
    pub const fn service(&self) -> Service {
        self.service
    }

    /// Reporters registered in the catalog.
    pub async fn all(&self) -> Result<Vec<ReporterConfig>, ReporterError> {
        Ok(self.catalog.reporters(self.service, &self.chain).await?)
    }

    /// Active reporters, ordered by id.
    pub fn active(&self) -> Vec<ReporterConfig> {
        snapshot(&self.wallets.read())
    }

    /// Wallet reporting into `oracle`.
    pub fn wallet(&self, oracle: Address) -> Option<Arc<Wallet>> {
        self.wallets.read().get(&oracle).cloned()
    }

    /// Restore the reporters recorded in the store. When nothing is recorded
    /// every catalog entry is activated.
    pub async fn start(&self) -> Result<Vec<ReporterConfig>, ReporterError> {
        let stored: Option<Vec<ReporterConfig>> =
            store::get_json(self.store.as_ref(), &self.state_key).await?;

        let Some(stored) = stored.filter(|s| !s.is_empty()) else {
            return self.refresh().await;
        };

        for config in stored {
            match self.add(&config.id).await {
                Ok(_) | Err(ReporterError::ReporterAlreadyActive(_)) => {}
                Err(error) => {
                    warn!(service = %self.service, id = config.id, %error, "stored reporter not restored")
                }
            }
        }
        Ok(self.active())
    }

    /// Replace the active set with every valid catalog entry.
    pub async fn refresh(&self) -> Result<Vec<ReporterConfig>, ReporterError> {
        let _guard = self.write_lock.lock().await;
        let configs = self.all().await?;

        let current = self.wallets.read().clone();
        let mut wallets = HashMap::with_capacity(configs.len());
        for config in configs {
            let wallet = match self.build_wallet(config, &current) {
                Ok(wallet) => wallet,
                Err(error) => {
                    warn!(service = %self.service, %error, "skipping reporter");
                    continue;
                }
            };
            if wallets.contains_key(&wallet.oracle_address()) {
                warn!(
                    service = %self.service,
                    id = wallet.config().id,
                    oracle = %wallet.oracle_address(),
                    "skipping reporter, oracle already has one"
                );
                continue;
            }
            wallets.insert(wallet.oracle_address(), wallet);
        }

        self.commit(wallets).await?;

        let active = self.active();
        info!(service = %self.service, count = active.len(), "reporters refreshed");
        Ok(active)
    }

    /// Activate reporter `id`.
    pub async fn add(&self, id: &str) -> Result<ReporterConfig, ReporterError> {
        let _guard = self.write_lock.lock().await;

        if self.wallets.read().values().any(|w| w.config().id == id) {
            return Err(ReporterError::ReporterAlreadyActive(id.to_string()));
        }

        let not_added =
            |reason: String| ReporterError::ReporterNotAdded { id: id.to_string(), reason };

        let config = self
            .catalog
            .reporter(id)
            .await?
            .filter(|c| c.service == self.service && c.chain == self.chain)
            .ok_or_else(|| {
                not_added(format!("not registered for {} on {}", self.service, self.chain))
            })?;

        let wallet = Wallet::from_config(config, self.nonce_retry)
            .map_err(|e| not_added(e.to_string()))?;
        let oracle = wallet.oracle_address();

        let mut wallets = self.wallets.read().clone();
        if wallets.contains_key(&oracle) {
            return Err(not_added(format!("oracle {oracle} already has an active reporter")));
        }
        let config = wallet.config().clone();
        wallets.insert(oracle, Arc::new(wallet));
        self.commit(wallets).await?;

        info!(service = %self.service, id, %oracle, "reporter activated");
        Ok(config)
    }

    /// Deactivate reporter `id`.
    pub async fn remove(&self, id: &str) -> Result<ReporterConfig, ReporterError> {
        let _guard = self.write_lock.lock().await;

        let mut wallets = self.wallets.read().clone();
        let oracle = wallets
            .iter()
            .find(|(_, w)| w.config().id == id)
            .map(|(oracle, _)| *oracle)
            .ok_or_else(|| ReporterError::ReporterNotFound(id.to_string()))?;
        let removed = wallets
            .remove(&oracle)
            .ok_or_else(|| ReporterError::ReporterNotFound(id.to_string()))?;
        self.commit(wallets).await?;

        info!(service = %self.service, id, "reporter deactivated");
        Ok(removed.config().clone())
    }

    /// Reserve the next nonce of the wallet reporting into `oracle`.
    pub async fn get_and_increment_nonce(
        &self,
        chain: &dyn ChainClient,
        oracle: Address,
    ) -> Result<u64, ReporterError> {
        let wallet = self.wallet(oracle).ok_or(ReporterError::WalletNotActive(oracle))?;
        Ok(wallet.next_nonce(chain).await)
    }

    /// Reuse the current wallet when the entry is unchanged so that its
    /// cached nonce survives the refresh.
    fn build_wallet(
        &self,
        config: ReporterConfig,
        current: &HashMap<Address, Arc<Wallet>>,
    ) -> Result<Arc<Wallet>, WalletError> {
        let wallet = Wallet::from_config(config, self.nonce_retry)?;
        match current.get(&wallet.oracle_address()) {
            Some(existing)
                if existing.address() == wallet.address() &&
                    existing.config().id == wallet.config().id =>
            {
                Ok(Arc::clone(existing))
            }
            _ => Ok(Arc::new(wallet)),
        }
    }

    /// Persist `wallets`, then make them the active set. Memory is left
    /// untouched when the write fails.
    async fn commit(&self, wallets: HashMap<Address, Arc<Wallet>>) -> Result<(), StoreError> {
        store::set_json(self.store.as_ref(), &self.state_key, &snapshot(&wallets)).await?;
        *self.wallets.write() = wallets;
        Ok(())
    }
}

fn snapshot(wallets: &HashMap<Address, Arc<Wallet>>) -> Vec<ReporterConfig> {
    let mut configs: Vec<_> = wallets.values().map(|w| w.config().clone()).collect();
    configs.sort_by(|a, b| a.id.cmp(&b.id));
    configs
}
