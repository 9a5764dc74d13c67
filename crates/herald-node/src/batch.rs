//! Store-backed batch accumulation and lock-protected batch closing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use herald_core::time::now_ms;
use herald_core::{
    Announcement, AnnouncementType, BatchAnnouncerJob, BatchId, BatchMetadata, SchemaRegistry,
};
use herald_store::{LockResponse, LockStatus, Store, StoreError, APPEND_INCONSISTENT};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::keys::BatchKeys;
use crate::queue::{Job, JobOptions, JobOutcome, JobSink, Processor, QueueError};
use crate::timeout::TimeoutScheduler;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("failed to encode announcement {0}: {1}")]
    Encode(String, serde_json::Error),
    #[error("inconsistent batch state on {queue} while appending job {job_id}")]
    Inconsistent { queue: &'static str, job_id: String },
    #[error("unreadable locked batch on {queue}: {reason}")]
    Corrupt { queue: &'static str, reason: String },
}

/// Timer key: one deferred close per `(queue, batch)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchTimerKey {
    pub kind: AnnouncementType,
    pub batch_id: BatchId,
}

pub type BatchTimeoutScheduler = TimeoutScheduler<BatchTimerKey>;

/// What asked for a close; only affects logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseTrigger {
    MaxCount,
    Timeout,
    Startup,
    /// A previous attempt found the batch locked by another closer.
    LockRetry,
}

impl fmt::Display for CloseTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseTrigger::MaxCount => "max-count",
            CloseTrigger::Timeout => "timeout",
            CloseTrigger::Startup => "startup",
            CloseTrigger::LockRetry => "lock-retry",
        })
    }
}

/// Appends announcements to the open batch of a queue.
#[derive(Clone)]
pub struct BatchAccumulator {
    store: Arc<dyn Store>,
}

impl BatchAccumulator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Atomically appends one announcement and returns the batch row count.
    ///
    /// `opening` is the metadata stored if this append opens a new batch.
    pub async fn append(
        &self,
        kind: AnnouncementType,
        job_id: &str,
        announcement: &Announcement,
        opening: &BatchMetadata,
    ) -> Result<u64, BatchError> {
        let keys = BatchKeys::for_type(kind);
        let initial_meta = serde_json::to_string(opening)
            .map_err(|e| BatchError::Encode(job_id.to_string(), e))?;
        let entry = serde_json::to_string(announcement)
            .map_err(|e| BatchError::Encode(job_id.to_string(), e))?;
        let count = self
            .store
            .append_and_count(&keys.metadata, &keys.data, &initial_meta, job_id, &entry)
            .await?;
        if count == APPEND_INCONSISTENT || count < 1 {
            return Err(BatchError::Inconsistent {
                queue: kind.queue_name(),
                job_id: job_id.to_string(),
            });
        }
        Ok(count as u64)
    }
}

/// Closes batches under the store lock and hands them downstream.
pub struct BatchCloser {
    store: Arc<dyn Store>,
    sink: Arc<dyn JobSink<BatchAnnouncerJob>>,
    schemas: SchemaRegistry,
    timers: BatchTimeoutScheduler,
    lock_expiry: Duration,
    max_rounds: u32,
}

impl BatchCloser {
    pub fn new(
        store: Arc<dyn Store>,
        sink: Arc<dyn JobSink<BatchAnnouncerJob>>,
        schemas: SchemaRegistry,
        timers: BatchTimeoutScheduler,
        lock_expiry: Duration,
        max_rounds: u32,
    ) -> Self {
        Self {
            store,
            sink,
            schemas,
            timers,
            lock_expiry,
            max_rounds: max_rounds.max(1),
        }
    }

    /// Metadata of the open batch of `kind`, if any.
    pub async fn open_batch(
        &self,
        kind: AnnouncementType,
    ) -> Result<Option<BatchMetadata>, BatchError> {
        let keys = BatchKeys::for_type(kind);
        let Some(raw) = self.store.get(&keys.metadata).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| BatchError::Corrupt {
                queue: kind.queue_name(),
                reason: format!("metadata: {e}"),
            })
    }

    /// Closes the open batch of `kind`, returning ids of batches emitted.
    ///
    /// If an expired lock is found, the batch it guarded is emitted first and
    /// the close is repeated for the current batch. If a live lock blocks the
    /// close, a retry for `batch_id` is armed one lock lifetime later.
    pub async fn close(
        self: &Arc<Self>,
        kind: AnnouncementType,
        batch_id: &BatchId,
        trigger: CloseTrigger,
    ) -> Result<Vec<BatchId>, BatchError> {
        let queue = kind.queue_name();
        let keys = BatchKeys::for_type(kind);
        let mut emitted = Vec::new();
        info!(queue, batch_id = %batch_id, %trigger, "closing batch");

        for _ in 0..self.max_rounds {
            let response = self
                .store
                .compare_and_lock(
                    &keys.metadata,
                    &keys.data,
                    &keys.locked_metadata,
                    &keys.locked_data,
                    now_ms(),
                    self.lock_expiry.as_millis() as u64,
                )
                .await?;
            match response.status {
                LockStatus::NoBatch => {
                    debug!(queue, batch_id = %batch_id, "no open batch to close");
                    return Ok(emitted);
                }
                LockStatus::LockedByOther => {
                    self.retry_later(kind, batch_id);
                    return Ok(emitted);
                }
                LockStatus::StaleLockRecovered => {
                    warn!(queue, "taking over expired batch lock");
                }
                LockStatus::Acquired => {}
            }

            let closed = self.emit(kind, &response).await?;
            self.cleanup(kind, &keys, batch_id, &closed.batch_id).await;
            if closed.emitted {
                emitted.push(closed.batch_id);
            }

            if response.status != LockStatus::StaleLockRecovered {
                return Ok(emitted);
            }
            info!(queue, "recovered stale batch; closing current batch");
        }

        warn!(
            queue,
            rounds = self.max_rounds,
            "stale lock recovery limit reached"
        );
        Ok(emitted)
    }

    fn retry_later(self: &Arc<Self>, kind: AnnouncementType, batch_id: &BatchId) {
        let key = BatchTimerKey {
            kind,
            batch_id: batch_id.clone(),
        };
        // An armed timeout for the same batch retries on its own.
        let armed = self.timers.arm_if_absent(
            key,
            self.lock_expiry,
            retry_close(Arc::clone(self), kind, batch_id.clone()),
        );
        debug!(
            queue = kind.queue_name(),
            batch_id = %batch_id,
            armed,
            "batch locked by another closer"
        );
    }

    async fn emit(
        &self,
        kind: AnnouncementType,
        response: &LockResponse,
    ) -> Result<ClosedBatch, BatchError> {
        let queue = kind.queue_name();
        let raw_meta = response
            .metadata
            .as_deref()
            .ok_or_else(|| BatchError::Corrupt {
                queue,
                reason: "locked metadata missing".into(),
            })?;
        let metadata: BatchMetadata =
            serde_json::from_str(raw_meta).map_err(|e| BatchError::Corrupt {
                queue,
                reason: format!("metadata: {e}"),
            })?;
        let announcements = response
            .entries
            .iter()
            .map(|(entry_id, raw)| {
                serde_json::from_str::<Announcement>(raw).map_err(|e| BatchError::Corrupt {
                    queue,
                    reason: format!("entry {entry_id}: {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if announcements.is_empty() {
            debug!(queue, batch_id = %metadata.batch_id, "locked batch is empty");
            return Ok(ClosedBatch {
                batch_id: metadata.batch_id,
                emitted: false,
            });
        }

        let rows = announcements.len();
        let job = BatchAnnouncerJob {
            batch_id: metadata.batch_id.clone(),
            schema_id: self.schemas.schema_id(kind),
            announcements,
        };
        let added = self
            .sink
            .enqueue(metadata.batch_id.as_str(), job, JobOptions::default())
            .await?;
        if added {
            info!(queue, batch_id = %metadata.batch_id, rows, "batch closed");
        } else {
            debug!(queue, batch_id = %metadata.batch_id, "batch already handed downstream");
        }
        Ok(ClosedBatch {
            batch_id: metadata.batch_id,
            emitted: true,
        })
    }

    async fn cleanup(
        &self,
        kind: AnnouncementType,
        keys: &BatchKeys,
        requested: &BatchId,
        closed: &BatchId,
    ) {
        if let Err(err) = self
            .store
            .delete_many(&[keys.locked_metadata.as_str(), keys.locked_data.as_str()])
            .await
        {
            warn!(queue = kind.queue_name(), error = %err, "failed to release batch lock");
        }
        for batch_id in [requested, closed] {
            self.timers.cancel(&BatchTimerKey {
                kind,
                batch_id: batch_id.clone(),
            });
        }
    }
}

struct ClosedBatch {
    batch_id: BatchId,
    emitted: bool,
}

fn retry_close(
    closer: Arc<BatchCloser>,
    kind: AnnouncementType,
    batch_id: BatchId,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let queue = kind.queue_name();
        match closer.open_batch(kind).await {
            Ok(Some(open)) if open.batch_id == batch_id => {
                if let Err(err) = closer.close(kind, &batch_id, CloseTrigger::LockRetry).await {
                    error!(queue, batch_id = %batch_id, error = %err, "batch close retry failed");
                }
            }
            Ok(_) => debug!(queue, batch_id = %batch_id, "batch no longer open"),
            Err(err) => error!(queue, batch_id = %batch_id, error = %err, "batch close retry failed"),
        }
    })
}

/// Accumulation plus count/time-triggered closing for all intake queues.
pub struct BatchingService {
    accumulator: BatchAccumulator,
    closer: Arc<BatchCloser>,
    timers: BatchTimeoutScheduler,
    batch_interval: Duration,
    batch_max_count: u64,
}

impl BatchingService {
    pub fn new(
        store: Arc<dyn Store>,
        closer: Arc<BatchCloser>,
        timers: BatchTimeoutScheduler,
        batch_interval: Duration,
        batch_max_count: u64,
    ) -> Self {
        Self {
            accumulator: BatchAccumulator::new(store),
            closer,
            timers,
            batch_interval,
            batch_max_count: batch_max_count.max(1),
        }
    }

    pub fn closer(&self) -> &Arc<BatchCloser> {
        &self.closer
    }

    pub fn timers(&self) -> &BatchTimeoutScheduler {
        &self.timers
    }

    /// Adds one intake job to its queue's batch, arming or closing as needed.
    pub async fn process(
        &self,
        kind: AnnouncementType,
        job: &Job<Announcement>,
    ) -> Result<u64, BatchError> {
        let queue = kind.queue_name();
        let opening = BatchMetadata::open(BatchId::fresh(), now_ms());
        let row_count = self
            .accumulator
            .append(kind, &job.id, &job.data, &opening)
            .await?;
        debug!(queue, job_id = %job.id, row_count, "announcement appended");

        if row_count == 1 {
            info!(queue, batch_id = %opening.batch_id, "batch opened");
            self.arm_timeout(kind, opening.batch_id.clone(), self.batch_interval);
        }
        if row_count >= self.batch_max_count {
            match self.closer.open_batch(kind).await? {
                Some(open) => {
                    self.closer
                        .close(kind, &open.batch_id, CloseTrigger::MaxCount)
                        .await?;
                }
                None => debug!(queue, "full batch already closed"),
            }
        }
        Ok(row_count)
    }

    /// Re-arms the timeout of an open batch after a restart, or closes it
    /// right away if its interval has already elapsed.
    pub async fn setup_active_batch_timeout(
        &self,
        kind: AnnouncementType,
    ) -> Result<(), BatchError> {
        let queue = kind.queue_name();
        let Some(metadata) = self.closer.open_batch(kind).await? else {
            return Ok(());
        };
        let age = Duration::from_millis(metadata.age_ms(now_ms()));
        if age >= self.batch_interval {
            info!(queue, batch_id = %metadata.batch_id, "open batch overdue; closing");
            self.closer
                .close(kind, &metadata.batch_id, CloseTrigger::Startup)
                .await?;
        } else {
            let remaining = self.batch_interval - age;
            debug!(queue, batch_id = %metadata.batch_id, ?remaining, "re-arming batch timeout");
            self.arm_timeout(kind, metadata.batch_id, remaining);
        }
        Ok(())
    }

    fn arm_timeout(&self, kind: AnnouncementType, batch_id: BatchId, delay: Duration) {
        let closer = Arc::clone(&self.closer);
        let key = BatchTimerKey {
            kind,
            batch_id: batch_id.clone(),
        };
        self.timers.arm(key, delay, async move {
            if let Err(err) = closer.close(kind, &batch_id, CloseTrigger::Timeout).await {
                error!(
                    queue = kind.queue_name(),
                    batch_id = %batch_id,
                    error = %err,
                    "timed batch close failed"
                );
            }
        });
    }
}

/// Intake-queue processor for one announcement type.
pub struct IntakeProcessor {
    kind: AnnouncementType,
    service: Arc<BatchingService>,
}

impl IntakeProcessor {
    pub fn new(kind: AnnouncementType, service: Arc<BatchingService>) -> Self {
        Self { kind, service }
    }
}

#[async_trait]
impl Processor<Announcement> for IntakeProcessor {
    type Error = BatchError;

    async fn process(&self, job: &Job<Announcement>) -> Result<JobOutcome, BatchError> {
        self.service.process(self.kind, job).await?;
        Ok(JobOutcome::Completed)
    }
}
