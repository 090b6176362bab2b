//! Error classification shared by every pipeline stage.
//!
//! Each module owns its own error enum. They all map onto an [`ErrorKind`], and
//! retry decisions (queue attempts, reporter trials, control plane responses)
//! are made on the kind rather than on the concrete variant.

/// Coarse failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid address, key/address mismatch, entry missing from the catalog.
    Configuration,
    /// RPC timeout or network failure, transaction not mined, nonce expired.
    TransientChain,
    /// Reverted or rejected transaction.
    PermanentChain,
    /// No wallet is active for the oracle a job targets.
    WalletAbsent,
    /// External data source failure or malformed data.
    DataSource,
    /// Key value store failure.
    Store,
    /// Queue broker failure.
    Queue,
}

impl ErrorKind {
    /// Jobs failing with these kinds are dropped without using up queue attempts.
    pub const fn is_unrecoverable(self) -> bool {
        matches!(self, Self::Configuration | Self::WalletAbsent)
    }
}

/// Implemented by every error that can surface from a pipeline stage.
pub trait HasKind {
    /// The failure class of this error.
    fn kind(&self) -> ErrorKind;
}
