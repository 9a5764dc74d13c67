//! Confirmation tracking for submitted batch transactions.
//!
//! Each attempt scans a bounded window of finalized blocks for the
//! transaction hash. Misses are retried by the queue's backoff; once the
//! attempt budget is spent the original publish job is queued again.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use herald_chain::{total_capacity_withdrawn, ChainError, Ledger};
use herald_core::{BlockHash, BlockNumber, PublisherJob, TxHash, TxMonitorJob};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::queue::{Job, JobOptions, JobOutcome, JobSink, Processor, QueueError};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("transaction {0} not found in finalized blocks")]
    NotFound(TxHash),
}

/// Where a transaction landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub tx_hash: TxHash,
    pub block_number: BlockNumber,
    pub block_hash: BlockHash,
    /// Capacity charged according to the inclusion block's events.
    pub capacity_withdrawn: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    Found(Confirmation),
    /// Attempts ran out; the publish job was queued again.
    Exhausted,
}

/// Block numbers to search: from the last finalized block known at
/// submission, up to and including the current finalized block, capped at
/// `max_blocks`.
pub fn scan_window(
    from: BlockNumber,
    finalized: BlockNumber,
    max_blocks: u64,
) -> Range<BlockNumber> {
    let end = finalized
        .saturating_add(1)
        .min(from.saturating_add(max_blocks.max(1)));
    from..end.max(from)
}

pub struct TxMonitor {
    ledger: Arc<dyn Ledger>,
    publish: Arc<dyn JobSink<PublisherJob>>,
    blocks_per_scan: u64,
    max_attempts: u32,
    resubmit_delay: Duration,
}

impl TxMonitor {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        publish: Arc<dyn JobSink<PublisherJob>>,
        blocks_per_scan: u64,
        max_attempts: u32,
        resubmit_delay: Duration,
    ) -> Self {
        Self {
            ledger,
            publish,
            blocks_per_scan,
            max_attempts: max_attempts.max(1),
            resubmit_delay,
        }
    }

    async fn lookup(
        &self,
        number: BlockNumber,
        tx_hash: &TxHash,
    ) -> Result<Option<Confirmation>, ChainError> {
        let Some(hash) = self.ledger.block_hash(number).await? else {
            return Ok(None);
        };
        let Some(block) = self.ledger.block(&hash).await? else {
            return Ok(None);
        };
        Ok(block.find_tx(tx_hash).map(|tx| Confirmation {
            tx_hash: *tx_hash,
            block_number: block.number,
            block_hash: block.hash,
            capacity_withdrawn: total_capacity_withdrawn(&tx.events),
        }))
    }

    /// Searches the current window for `tx_hash`.
    ///
    /// Blocks are fetched concurrently. A match wins over read errors in
    /// other blocks; without a match the first error is returned.
    pub async fn find_inclusion(
        &self,
        tx_hash: &TxHash,
        last_finalized: BlockNumber,
    ) -> Result<Option<Confirmation>, ChainError> {
        let finalized = self.ledger.latest_finalized_block_number().await?;
        let window = scan_window(last_finalized, finalized, self.blocks_per_scan);
        debug!(
            tx_hash = %tx_hash,
            from = window.start,
            to = window.end,
            "scanning finalized blocks"
        );
        let results = join_all(window.map(|number| self.lookup(number, tx_hash))).await;

        let mut first_err = None;
        for result in results {
            match result {
                Ok(Some(found)) => return Ok(Some(found)),
                Ok(None) => {}
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }

    /// One confirmation attempt for `job`.
    pub async fn check(&self, job: &Job<TxMonitorJob>) -> Result<MonitorOutcome, MonitorError> {
        let data = &job.data;
        if let Some(found) = self
            .find_inclusion(&data.tx_hash, data.last_finalized_block_number)
            .await?
        {
            info!(
                tx_hash = %found.tx_hash,
                block_number = found.block_number,
                capacity_withdrawn = %found.capacity_withdrawn,
                publish_job = %data.reference_publish_job.id,
                "batch transaction finalized"
            );
            return Ok(MonitorOutcome::Found(found));
        }

        if job.attempts_made.saturating_add(1) < self.max_attempts {
            debug!(
                tx_hash = %data.tx_hash,
                attempt = job.attempts_made + 1,
                "transaction not found yet"
            );
            return Err(MonitorError::NotFound(data.tx_hash));
        }

        let publish = data.reference_publish_job.clone();
        let publish_id = publish.id.clone();
        error!(
            tx_hash = %data.tx_hash,
            attempts = job.attempts_made + 1,
            publish_job = %publish_id,
            "transaction never finalized; resubmitting batch"
        );
        self.publish.remove(&publish_id).await?;
        self.publish
            .enqueue(&publish_id, publish, JobOptions::delayed(self.resubmit_delay))
            .await?;
        Ok(MonitorOutcome::Exhausted)
    }
}

#[async_trait]
impl Processor<TxMonitorJob> for TxMonitor {
    type Error = MonitorError;

    async fn process(&self, job: &Job<TxMonitorJob>) -> Result<JobOutcome, MonitorError> {
        match self.check(job).await? {
            MonitorOutcome::Found(_) => Ok(JobOutcome::Completed),
            MonitorOutcome::Exhausted => Ok(JobOutcome::Failed),
        }
    }
}
