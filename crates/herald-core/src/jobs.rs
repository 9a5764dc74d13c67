use serde::{Deserialize, Serialize};

use crate::announcement::Announcement;
use crate::types::{BatchId, BlockNumber, SchemaId, TxHash};

/// Store-resident record describing the open batch of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
    pub batch_id: BatchId,
    /// Unix milliseconds at which the batch was opened.
    pub start_timestamp: u64,
    pub row_count: u64,
}

impl BatchMetadata {
    /// Metadata for a batch opened at `now_ms` with its first row.
    pub fn open(batch_id: BatchId, now_ms: u64) -> Self {
        Self {
            batch_id,
            start_timestamp: now_ms,
            row_count: 1,
        }
    }

    /// How long the batch has been open at `now_ms`.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.start_timestamp)
    }
}

/// A closed batch handed to the announce stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAnnouncerJob {
    pub batch_id: BatchId,
    pub schema_id: SchemaId,
    pub announcements: Vec<Announcement>,
}

/// Content-addressed reference to a batch payload stored off-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadRef {
    pub cid: String,
    pub payload_length: u64,
}

/// One batch = one ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherJob {
    pub id: String,
    pub schema_id: SchemaId,
    pub data: PayloadRef,
}

/// Tracks one submitted transaction until it is found in a finalized block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxMonitorJob {
    pub id: String,
    pub tx_hash: TxHash,
    /// Last finalized block known when the transaction was submitted.
    pub last_finalized_block_number: BlockNumber,
    pub reference_publish_job: PublisherJob,
}

impl TxMonitorJob {
    pub fn new(
        tx_hash: TxHash,
        last_finalized_block_number: BlockNumber,
        reference_publish_job: PublisherJob,
    ) -> Self {
        Self {
            id: tx_hash.to_hex(),
            tx_hash,
            last_finalized_block_number,
            reference_publish_job,
        }
    }
}
