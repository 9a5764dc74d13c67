use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use herald_chain::{total_capacity_withdrawn, ChainError, Ledger, LedgerCall};
use herald_core::{BlockNumber, ProviderId, PublisherJob, TxHash, TxMonitorJob};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::capacity::CapacityController;
use crate::queue::{Job, JobOptions, JobOutcome, JobSink, Processor, QueueError};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// A submitted batch transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub tx_hash: TxHash,
    pub last_finalized_block_number: BlockNumber,
    pub capacity_withdrawn: u128,
}

/// Submits one ledger transaction per publish job and hands it to the
/// confirmation monitor.
pub struct PublishScheduler {
    ledger: Arc<dyn Ledger>,
    capacity: Arc<CapacityController>,
    monitor: Arc<dyn JobSink<TxMonitorJob>>,
    provider_id: ProviderId,
    monitor_initial_delay: Duration,
}

impl PublishScheduler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        capacity: Arc<CapacityController>,
        monitor: Arc<dyn JobSink<TxMonitorJob>>,
        provider_id: ProviderId,
        monitor_initial_delay: Duration,
    ) -> Self {
        Self {
            ledger,
            capacity,
            monitor,
            provider_id,
            monitor_initial_delay,
        }
    }

    pub async fn publish(&self, job: &PublisherJob) -> Result<Published, PublishError> {
        let last_finalized = self.ledger.latest_finalized_block_number().await?;
        // Usage is charged to the epoch the submission was made in.
        let at_submit = self.ledger.capacity_info(self.provider_id).await?;
        let call = LedgerCall {
            provider_id: self.provider_id,
            schema_id: job.schema_id,
            cid: job.data.cid.clone(),
            payload_length: job.data.payload_length,
        };
        let submission = match self.ledger.submit(call).await {
            Ok(submission) => submission,
            Err(err) => {
                if err.is_insufficient_capacity() {
                    warn!(job_id = %job.id, "ledger refused fees; capacity exhausted");
                    if let Err(signal_err) = self.capacity.signal_exhausted().await {
                        warn!(error = %signal_err, "failed to pause publication");
                    }
                }
                return Err(err.into());
            }
        };

        let withdrawn = total_capacity_withdrawn(&submission.events);
        // The transaction is out; a bookkeeping failure must not trigger a resubmit.
        if let Err(err) = self.capacity.record_usage(&at_submit, withdrawn).await {
            error!(job_id = %job.id, error = %err, "failed to record capacity usage");
        }

        let monitor_job = TxMonitorJob::new(submission.tx_hash, last_finalized, job.clone());
        let monitor_id = monitor_job.id.clone();
        self.monitor
            .enqueue(
                &monitor_id,
                monitor_job,
                JobOptions::delayed(self.monitor_initial_delay),
            )
            .await?;
        info!(
            job_id = %job.id,
            tx_hash = %submission.tx_hash,
            capacity_withdrawn = %withdrawn,
            "batch transaction submitted"
        );
        Ok(Published {
            tx_hash: submission.tx_hash,
            last_finalized_block_number: last_finalized,
            capacity_withdrawn: withdrawn,
        })
    }
}

#[async_trait]
impl Processor<PublisherJob> for PublishScheduler {
    type Error = PublishError;

    async fn process(&self, job: &Job<PublisherJob>) -> Result<JobOutcome, PublishError> {
        let result = self.publish(&job.data).await;
        if let Err(err) = &result {
            error!(job_id = %job.id, attempts = job.attempts_made, error = %err, "publish failed");
        }
        if let Err(err) = self.capacity.check_capacity().await {
            warn!(error = %err, "capacity check after publish failed");
        }
        result.map(|_| JobOutcome::Completed)
    }
}
