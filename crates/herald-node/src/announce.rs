use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use herald_core::hash::blake3_hex;
use herald_core::{BatchAnnouncerJob, BatchId, PayloadRef, PublisherJob};
use thiserror::Error;
use tracing::{debug, info};

use crate::queue::{Job, JobOptions, JobOutcome, JobSink, Processor, QueueError};

#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error("failed to encode batch {0}: {1}")]
    Encode(BatchId, serde_json::Error),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Turns a closed batch into a stored payload and its publish job.
///
/// Implementations must return the same job when the same batch id is
/// announced again.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, job: &BatchAnnouncerJob) -> Result<PublisherJob, AnnounceError>;
}

/// Announcer that derives the payload reference from a BLAKE3 digest of the
/// batch encoded as JSON lines.
#[derive(Debug, Default)]
pub struct DigestAnnouncer {
    announced: Mutex<HashMap<BatchId, PublisherJob>>,
}

impl DigestAnnouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// JSON-lines payload for a batch, one announcement per line.
    pub fn encode_payload(job: &BatchAnnouncerJob) -> Result<Vec<u8>, AnnounceError> {
        let mut out = Vec::new();
        for announcement in &job.announcements {
            serde_json::to_writer(&mut out, announcement)
                .map_err(|e| AnnounceError::Encode(job.batch_id.clone(), e))?;
            out.push(b'\n');
        }
        Ok(out)
    }
}

#[async_trait]
impl Announcer for DigestAnnouncer {
    async fn announce(&self, job: &BatchAnnouncerJob) -> Result<PublisherJob, AnnounceError> {
        let mut announced = self
            .announced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = announced.get(&job.batch_id) {
            debug!(batch_id = %job.batch_id, "batch already announced");
            return Ok(existing.clone());
        }
        let payload = Self::encode_payload(job)?;
        let publish = PublisherJob {
            id: job.batch_id.to_string(),
            schema_id: job.schema_id,
            data: PayloadRef {
                cid: blake3_hex(&payload),
                payload_length: payload.len() as u64,
            },
        };
        announced.insert(job.batch_id.clone(), publish.clone());
        Ok(publish)
    }
}

/// Batch-queue processor: announce, then queue the publish job under the
/// batch id.
pub struct AnnounceStage {
    announcer: Arc<dyn Announcer>,
    publish: Arc<dyn JobSink<PublisherJob>>,
}

impl AnnounceStage {
    pub fn new(announcer: Arc<dyn Announcer>, publish: Arc<dyn JobSink<PublisherJob>>) -> Self {
        Self { announcer, publish }
    }
}

#[async_trait]
impl Processor<BatchAnnouncerJob> for AnnounceStage {
    type Error = AnnounceError;

    async fn process(&self, job: &Job<BatchAnnouncerJob>) -> Result<JobOutcome, AnnounceError> {
        let publish = self.announcer.announce(&job.data).await?;
        let id = publish.id.clone();
        let cid = publish.data.cid.clone();
        if self
            .publish
            .enqueue(&id, publish, JobOptions::default())
            .await?
        {
            info!(batch_id = %job.data.batch_id, cid = %cid, "batch announced");
        } else {
            debug!(batch_id = %job.data.batch_id, "publish job already queued");
        }
        Ok(JobOutcome::Completed)
    }
}
