//! Signing wallet bound to one oracle contract.

use alloy::{network::EthereumWallet, primitives::Address, signers::local::PrivateKeySigner};
use std::{fmt, time::Duration};

use super::nonce::NonceLock;
use crate::{api::ReporterConfig, chain::ChainClient};

/// Reasons a [`ReporterConfig`] cannot back a wallet.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// reporter address is not a valid address
    #[error("invalid reporter address {0:?}")]
    InvalidAddress(String),
    /// oracle address is not a valid address
    #[error("invalid oracle address {0:?}")]
    InvalidOracleAddress(String),
    /// private key could not be parsed
    #[error("invalid private key")]
    InvalidPrivateKey,
    /// private key derives a different address
    #[error("private key derives {derived}, expected {expected}")]
    KeyMismatch {
        /// Address from the config.
        expected: Address,
        /// Address derived from the key.
        derived: Address,
    },
}

/// Wallet used to report into `oracle_address`.
pub struct Wallet {
    signer: EthereumWallet,
    address: Address,
    oracle_address: Address,
    nonce: NonceLock,
    config: ReporterConfig,
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("id", &self.config.id)
            .field("address", &self.address)
            .field("oracle_address", &self.oracle_address)
            .finish_non_exhaustive()
    }
}

impl Wallet {
    /// Validate `config` and build a wallet from it.
    pub fn from_config(config: ReporterConfig, nonce_retry: Duration) -> Result<Self, WalletError> {
        let address: Address = config
            .address
            .trim()
            .parse()
            .map_err(|_| WalletError::InvalidAddress(config.address.clone()))?;
        let oracle_address: Address = config
            .oracle_address
            .trim()
            .parse()
            .map_err(|_| WalletError::InvalidOracleAddress(config.oracle_address.clone()))?;
        let signer: PrivateKeySigner =
            config.private_key.trim().parse().map_err(|_| WalletError::InvalidPrivateKey)?;

        if signer.address() != address {
            return Err(WalletError::KeyMismatch { expected: address, derived: signer.address() });
        }

        Ok(Self {
            signer: EthereumWallet::from(signer),
            address,
            oracle_address,
            nonce: NonceLock::new(nonce_retry),
            config,
        })
    }

    /// Sender address.
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Contract this wallet reports into.
    pub const fn oracle_address(&self) -> Address {
        self.oracle_address
    }

    /// Config this wallet was built from.
    pub const fn config(&self) -> &ReporterConfig {
        &self.config
    }

    pub(crate) const fn signer(&self) -> &EthereumWallet {
        &self.signer
    }

    /// Reserve the next nonce.
    pub async fn next_nonce(&self, chain: &dyn ChainClient) -> u64 {
        self.nonce.allocate(chain, self.address).await
    }
}
