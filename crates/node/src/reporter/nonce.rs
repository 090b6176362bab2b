//! Per-wallet nonce allocation.

use alloy::primitives::Address;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use crate::chain::ChainClient;

/// Delay between attempts to read the remote transaction count.
pub const NONCE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Cached next nonce of one wallet.
///
/// [`Self::allocate`] holds the lock across the remote read, so concurrent
/// callers for the same wallet are serialized and receive distinct nonces.
/// Callers for different wallets use different locks.
#[derive(Debug)]
pub struct NonceLock {
    next: Mutex<Option<u64>>,
    retry_interval: Duration,
}

impl Default for NonceLock {
    fn default() -> Self {
        Self::new(NONCE_RETRY_INTERVAL)
    }
}

impl NonceLock {
    /// Create a new [Self].
    pub fn new(retry_interval: Duration) -> Self {
        Self { next: Mutex::new(None), retry_interval }
    }

    /// Reserve the next nonce for `address`.
    ///
    /// The remote count wins when it is ahead of the cache, which heals the
    /// cache after transactions sent outside this process. Remote read
    /// failures are retried until one succeeds.
    pub async fn allocate(&self, chain: &dyn ChainClient, address: Address) -> u64 {
        let mut next = self.next.lock().await;

        let remote = loop {
            match chain.transaction_count(address).await {
                Ok(count) => break count,
                Err(error) => {
                    warn!(?error, %address, "failed to read transaction count, retrying");
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        };

        let nonce = match *next {
            Some(cached) if cached >= remote => cached,
            _ => remote,
        };
        *next = Some(nonce + 1);
        nonce
    }
}
