use herald_core::ProviderId;
use thiserror::Error;

/// Error text a ledger node returns when the signer cannot cover fees.
pub const INSUFFICIENT_FEES_MARKER: &str = "Inability to pay some fees";

/// Errors returned by [`crate::Ledger`] implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// The provider cannot pay for the call with its remaining capacity.
    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),
    #[error("unknown provider {0}")]
    UnknownProvider(ProviderId),
    #[error("rpc error: {0}")]
    Rpc(String),
}

impl ChainError {
    /// Classifies raw RPC error text, recognising the fee-payment failure.
    pub fn from_rpc_text(text: impl Into<String>) -> Self {
        let text = text.into();
        if text.contains(INSUFFICIENT_FEES_MARKER) {
            ChainError::InsufficientCapacity(text)
        } else {
            ChainError::Rpc(text)
        }
    }

    pub fn is_insufficient_capacity(&self) -> bool {
        matches!(self, ChainError::InsufficientCapacity(_))
    }
}
