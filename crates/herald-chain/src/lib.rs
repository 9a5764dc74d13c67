//! Ledger abstractions for herald.
//!
//! The pipeline only depends on the [`Ledger`] trait defined here; the RPC
//! client for a live network sits outside this workspace. [`sim::SimLedger`]
//! is the in-process implementation used by tests and the worker binary.

pub mod error;
pub mod sim;

use async_trait::async_trait;
use herald_core::{BlockHash, BlockNumber, CapacityInfo, ProviderId, SchemaId, TxHash};
use serde::{Deserialize, Serialize};

pub use error::ChainError;
pub use sim::{SimLedger, SimLedgerConfig};

/// The extrinsic submitted for one batch: store a payload reference on-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCall {
    pub provider_id: ProviderId,
    pub schema_id: SchemaId,
    pub cid: String,
    pub payload_length: u64,
}

/// Events emitted by an included transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    CapacityWithdrawn { provider_id: ProviderId, amount: u128 },
    MessagesStored { schema_id: SchemaId, block_number: BlockNumber },
}

impl LedgerEvent {
    pub fn capacity_withdrawn(&self) -> Option<u128> {
        match self {
            LedgerEvent::CapacityWithdrawn { amount, .. } => Some(*amount),
            LedgerEvent::MessagesStored { .. } => None,
        }
    }
}

/// Sums every `CapacityWithdrawn` amount in `events`.
pub fn total_capacity_withdrawn(events: &[LedgerEvent]) -> u128 {
    events
        .iter()
        .filter_map(LedgerEvent::capacity_withdrawn)
        .fold(0u128, u128::saturating_add)
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub tx_hash: TxHash,
    pub events: Vec<LedgerEvent>,
}

/// A transaction as recorded in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncludedTx {
    pub hash: TxHash,
    pub events: Vec<LedgerEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: BlockNumber,
    pub hash: BlockHash,
    pub parent: BlockHash,
    pub extrinsics: Vec<IncludedTx>,
}

impl Block {
    pub fn find_tx(&self, tx_hash: &TxHash) -> Option<&IncludedTx> {
        self.extrinsics.iter().find(|tx| &tx.hash == tx_hash)
    }
}

/// Ledger collaborator consumed by the publish and confirmation stages.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn block_hash(&self, number: BlockNumber) -> Result<Option<BlockHash>, ChainError>;

    async fn block(&self, hash: &BlockHash) -> Result<Option<Block>, ChainError>;

    async fn latest_finalized_block_hash(&self) -> Result<BlockHash, ChainError>;

    async fn latest_finalized_block_number(&self) -> Result<BlockNumber, ChainError>;

    /// Signs and submits `call`, resolving once the transaction is accepted
    /// into a block candidate. Returned events include the capacity charge.
    async fn submit(&self, call: LedgerCall) -> Result<Submission, ChainError>;

    async fn capacity_info(&self, provider_id: ProviderId) -> Result<CapacityInfo, ChainError>;
}

#[cfg(test)]
mod tests {
    use herald_core::{ProviderId, SchemaId};

    use super::{total_capacity_withdrawn, LedgerEvent};

    #[test]
    fn withdrawn_capacity_is_summed() {
        let events = vec![
            LedgerEvent::CapacityWithdrawn {
                provider_id: ProviderId(1),
                amount: 40,
            },
            LedgerEvent::MessagesStored {
                schema_id: SchemaId(2),
                block_number: 9,
            },
            LedgerEvent::CapacityWithdrawn {
                provider_id: ProviderId(1),
                amount: 2,
            },
        ];
        assert_eq!(total_capacity_withdrawn(&events), 42);
        assert_eq!(total_capacity_withdrawn(&[]), 0);
    }
}
