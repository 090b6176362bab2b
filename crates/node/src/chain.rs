//! JSON-RPC access to the chain the oracles live on.

use alloy::{
    network::{ReceiptResponse, TransactionBuilder},
    primitives::{Address, Bytes, B256, U64},
    providers::{PendingTransactionError, Provider, ProviderBuilder},
    rpc::types::{Filter, Log, TransactionRequest},
    transports::{RpcError, TransportErrorKind},
};
use async_trait::async_trait;
use serde::Deserialize;
use std::{fmt, sync::Arc, time::Duration};
use url::Url;

use crate::error::{ErrorKind, HasKind};

/// Classification of a chain interaction failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ChainErrorKind {
    /// The nonce was already used or is otherwise stale.
    NonceExpired,
    InsufficientFunds,
    Reverted,
    CannotEstimateGas,
    InvalidAddress,
    /// The node rejected the request for a reason not listed above.
    Rejected,
    /// No response, or the transport failed before a response arrived.
    MissingResponse,
    /// A response arrived but could not be decoded.
    ProcessingResponse,
    /// The transaction was broadcast but no receipt was observed in time.
    NotMined,
    /// Failed to sign a transaction locally.
    Signing,
    /// Other RPC failure.
    Rpc,
}

impl ChainErrorKind {
    /// Failures after which the same transaction, with the same nonce, may be sent again.
    pub const fn retry_same_nonce(self) -> bool {
        matches!(self, Self::NotMined | Self::MissingResponse | Self::ProcessingResponse)
    }

    /// Classify a node error message.
    pub fn from_message(message: &str) -> Self {
        let message = message.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

        if has(&[
            "nonce too low",
            "nonce is too low",
            "nonce has already been used",
            "nonce expired",
            "known transaction",
            "already known",
            "replacement transaction underpriced",
        ]) {
            Self::NonceExpired
        } else if has(&["insufficient funds"]) {
            Self::InsufficientFunds
        } else if has(&["gas required exceeds", "cannot estimate gas"]) {
            Self::CannotEstimateGas
        } else if has(&["reverted"]) {
            Self::Reverted
        } else if has(&["invalid address"]) {
            Self::InvalidAddress
        } else {
            Self::Rejected
        }
    }
}

/// Chain interaction error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("chain {}: {message}", kind.as_ref())]
pub struct ChainError {
    /// Failure class.
    pub kind: ChainErrorKind,
    /// Message from the node or transport.
    pub message: String,
}

impl ChainError {
    /// Create a new [Self].
    pub fn new(kind: ChainErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Classify an RPC error.
    pub fn from_rpc(error: RpcError<TransportErrorKind>) -> Self {
        let kind = match &error {
            RpcError::ErrorResp(payload) => ChainErrorKind::from_message(&payload.message),
            RpcError::NullResp | RpcError::Transport(_) => ChainErrorKind::MissingResponse,
            RpcError::DeserError { .. } => ChainErrorKind::ProcessingResponse,
            _ => ChainErrorKind::Rpc,
        };
        Self::new(kind, error.to_string())
    }

    /// Classify an error raised while waiting for a receipt.
    pub fn from_pending(error: PendingTransactionError) -> Self {
        match error {
            PendingTransactionError::TransportError(error) => Self::from_rpc(error),
            other => Self::new(ChainErrorKind::NotMined, other.to_string()),
        }
    }
}

impl HasKind for ChainError {
    fn kind(&self) -> ErrorKind {
        match self.kind {
            ChainErrorKind::InvalidAddress | ChainErrorKind::Signing => ErrorKind::Configuration,
            ChainErrorKind::InsufficientFunds |
            ChainErrorKind::Reverted |
            ChainErrorKind::CannotEstimateGas |
            ChainErrorKind::Rejected => ErrorKind::PermanentChain,
            ChainErrorKind::NonceExpired |
            ChainErrorKind::MissingResponse |
            ChainErrorKind::ProcessingResponse |
            ChainErrorKind::NotMined |
            ChainErrorKind::Rpc => ErrorKind::TransientChain,
        }
    }
}

/// Minimal view of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOutcome {
    pub hash: B256,
    pub block_number: Option<u64>,
}

/// Chain operations used by listeners, workers and reporters.
#[async_trait]
pub trait ChainClient: fmt::Debug + Send + Sync {
    /// Latest block number.
    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Timestamp (seconds) of the latest block.
    async fn latest_block_timestamp(&self) -> Result<u64, ChainError>;

    /// Logs emitted by `address` with topic0 `event_signature` in the inclusive block range.
    async fn logs(
        &self,
        address: Address,
        event_signature: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, ChainError>;

    /// `eth_call` against the latest block.
    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes, ChainError>;

    /// Count of transactions sent from `address`, which is the next usable nonce.
    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError>;

    async fn chain_id(&self) -> Result<u64, ChainError>;

    async fn gas_price(&self) -> Result<u128, ChainError>;

    async fn max_priority_fee_per_gas(&self) -> Result<u128, ChainError>;

    /// Broadcast a signed transaction and wait for its receipt. A receipt with
    /// failed status is reported as [`ChainErrorKind::Reverted`].
    async fn send_raw_transaction(
        &self,
        raw: Bytes,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<TxOutcome, ChainError>;
}

#[derive(Deserialize)]
struct BlockTimestamp {
    timestamp: U64,
}

/// [`ChainClient`] backed by an alloy provider.
pub struct RpcChainClient<P> {
    provider: P,
}

impl<P> fmt::Debug for RpcChainClient<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcChainClient").finish_non_exhaustive()
    }
}

impl<P: Provider> RpcChainClient<P> {
    /// Create a new [Self].
    pub const fn new(provider: P) -> Self {
        Self { provider }
    }
}

/// Connect a [`ChainClient`] to an HTTP JSON-RPC endpoint.
pub fn http_chain_client(url: Url) -> Arc<dyn ChainClient> {
    Arc::new(RpcChainClient::new(ProviderBuilder::new().on_http(url)))
}

#[async_trait]
impl<P: Provider + 'static> ChainClient for RpcChainClient<P> {
    async fn block_number(&self) -> Result<u64, ChainError> {
        self.provider.get_block_number().await.map_err(ChainError::from_rpc)
    }

    async fn latest_block_timestamp(&self) -> Result<u64, ChainError> {
        let block: Option<BlockTimestamp> = self
            .provider
            .raw_request("eth_getBlockByNumber".into(), ("latest", false))
            .await
            .map_err(ChainError::from_rpc)?;
        let block = block
            .ok_or_else(|| ChainError::new(ChainErrorKind::MissingResponse, "no latest block"))?;
        Ok(block.timestamp.to::<u64>())
    }

    async fn logs(
        &self,
        address: Address,
        event_signature: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, ChainError> {
        let filter = Filter::new()
            .address(address)
            .event_signature(event_signature)
            .from_block(from_block)
            .to_block(to_block);
        self.provider.get_logs(&filter).await.map_err(ChainError::from_rpc)
    }

    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes, ChainError> {
        let tx = TransactionRequest::default().with_to(to).with_input(input);
        self.provider
            .raw_request("eth_call".into(), (tx, "latest"))
            .await
            .map_err(ChainError::from_rpc)
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        self.provider.get_transaction_count(address).await.map_err(ChainError::from_rpc)
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.provider.get_chain_id().await.map_err(ChainError::from_rpc)
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        self.provider.get_gas_price().await.map_err(ChainError::from_rpc)
    }

    async fn max_priority_fee_per_gas(&self) -> Result<u128, ChainError> {
        self.provider.get_max_priority_fee_per_gas().await.map_err(ChainError::from_rpc)
    }

    async fn send_raw_transaction(
        &self,
        raw: Bytes,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<TxOutcome, ChainError> {
        let pending =
            self.provider.send_raw_transaction(&raw).await.map_err(ChainError::from_rpc)?;
        let receipt = pending
            .with_required_confirmations(confirmations)
            .with_timeout(Some(timeout))
            .get_receipt()
            .await
            .map_err(ChainError::from_pending)?;

        if !receipt.status() {
            return Err(ChainError::new(
                ChainErrorKind::Reverted,
                format!("transaction {} reverted", receipt.transaction_hash),
            ));
        }

        Ok(TxOutcome { hash: receipt.transaction_hash, block_number: receipt.block_number })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::rpc::json_rpc::ErrorPayload;

    #[test]
    fn messages_are_classified() {
        let cases = [
            ("nonce too low: next nonce 5, tx nonce 4", ChainErrorKind::NonceExpired),
            ("Known transaction: 0xabc", ChainErrorKind::NonceExpired),
            ("replacement transaction underpriced", ChainErrorKind::NonceExpired),
            ("insufficient funds for gas * price + value", ChainErrorKind::InsufficientFunds),
            ("execution reverted: round not accepting submissions", ChainErrorKind::Reverted),
            ("gas required exceeds allowance (30000000)", ChainErrorKind::CannotEstimateGas),
            ("invalid address", ChainErrorKind::InvalidAddress),
            ("transaction type not supported", ChainErrorKind::Rejected),
        ];

        for (message, kind) in cases {
            assert_eq!(ChainErrorKind::from_message(message), kind, "{message}");
        }
    }

    #[test]
    fn rpc_errors_are_classified() {
        let resp = RpcError::ErrorResp(ErrorPayload {
            code: -32000,
            message: "nonce too low".into(),
            data: None,
        });
        let err = ChainError::from_rpc(resp);
        assert_eq!(err.kind, ChainErrorKind::NonceExpired);
        assert_eq!(err.kind(), ErrorKind::TransientChain);

        let null = ChainError::from_rpc(RpcError::NullResp);
        assert_eq!(null.kind, ChainErrorKind::MissingResponse);
        assert!(null.kind.retry_same_nonce());

        let rejected = ChainError::new(ChainErrorKind::Reverted, "reverted");
        assert_eq!(rejected.kind(), ErrorKind::PermanentChain);
        assert!(!rejected.kind.retry_same_nonce());
    }
}
