use thiserror::Error;

use crate::{
    db::WalletDbError,
    models::{OutputId, UtxoKey},
};

/// Failures of selection, reservation and chain construction.
///
/// Errors raised by the keeper reach the caller unchanged: the chain builder rolls back
/// its reservations and returns the same variant.
#[derive(Debug, Error)]
pub enum KeeperError {
    /// Free plus reserved funds for the key do not cover the request. Not retryable
    /// without new funds.
    #[error("Insufficient funds for {key}. Available: {available}, required: {required}")]
    Insufficient { key: UtxoKey, available: u64, required: u64 },

    /// Enough funds exist but too many are locked by other attempts. Retryable once
    /// those reservations are released or expire.
    #[error("Funds for {key} are reserved. Free: {free}, reserved: {reserved}, required: {required}")]
    Reserved {
        key: UtxoKey,
        free: u64,
        reserved: u64,
        required: u64,
    },

    #[error("UTXO {0} not found")]
    NotFound(OutputId),

    /// Batch partitioning produced a transaction above the input cap.
    #[error("Chain limit exceeded: {inputs} inputs, limit {limit}")]
    ChainLimitExceeded { inputs: usize, limit: usize },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Store error: {0}")]
    Store(#[from] WalletDbError),
}

impl KeeperError {
    /// `true` for conditions that may clear without new funds arriving.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KeeperError::Reserved { .. })
    }

    /// Stable snake_case name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            KeeperError::Insufficient { .. } => "insufficient",
            KeeperError::Reserved { .. } => "reserved",
            KeeperError::NotFound(_) => "not_found",
            KeeperError::ChainLimitExceeded { .. } => "chain_limit_exceeded",
            KeeperError::InvalidAmount(_) => "invalid_amount",
            KeeperError::Store(_) => "store",
        }
    }
}
