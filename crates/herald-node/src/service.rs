//! Pipeline wiring: queues, stages, and their worker pools.

use std::collections::BTreeMap;
use std::sync::Arc;

use herald_chain::Ledger;
use herald_core::{
    Announcement, AnnouncementType, BatchAnnouncerJob, HeraldError, PublisherJob, SchemaRegistry,
    TxMonitorJob,
};
use herald_store::Store;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::announce::{AnnounceStage, Announcer};
use crate::batch::{BatchCloser, BatchError, BatchTimeoutScheduler, BatchingService, IntakeProcessor};
use crate::capacity::{CapacityController, CapacityError, CapacityState};
use crate::config::PipelineConfig;
use crate::monitor::TxMonitor;
use crate::publish::PublishScheduler;
use crate::queue::{spawn_workers, JobOptions, JobQueue, QueueError};

pub const BATCH_QUEUE: &str = "batchQueue";
pub const PUBLISH_QUEUE: &str = "publishQueue";
pub const TX_RECEIPT_QUEUE: &str = "txReceiptQueue";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] HeraldError),
    #[error("batch error: {0}")]
    Batch(#[from] BatchError),
    #[error("capacity error: {0}")]
    Capacity(#[from] CapacityError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("no intake queue for {0}")]
    UnknownType(AnnouncementType),
}

/// Every queue and stage of one worker process.
pub struct Pipeline {
    config: PipelineConfig,
    intake: BTreeMap<AnnouncementType, Arc<JobQueue<Announcement>>>,
    batch_queue: Arc<JobQueue<BatchAnnouncerJob>>,
    publish_queue: Arc<JobQueue<PublisherJob>>,
    monitor_queue: Arc<JobQueue<TxMonitorJob>>,
    timers: BatchTimeoutScheduler,
    batching: Arc<BatchingService>,
    announce: Arc<AnnounceStage>,
    capacity: Arc<CapacityController>,
    publisher: Arc<PublishScheduler>,
    monitor: Arc<TxMonitor>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn Store>,
        ledger: Arc<dyn Ledger>,
        announcer: Arc<dyn Announcer>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let intake: BTreeMap<_, _> = AnnouncementType::ALL
            .into_iter()
            .map(|kind| (kind, Arc::new(JobQueue::new(kind.queue_name()))))
            .collect();
        let batch_queue = Arc::new(JobQueue::new(BATCH_QUEUE));
        let publish_queue = Arc::new(JobQueue::new(PUBLISH_QUEUE));
        let monitor_queue = Arc::new(JobQueue::new(TX_RECEIPT_QUEUE));

        let timers = BatchTimeoutScheduler::new();
        let closer = Arc::new(BatchCloser::new(
            Arc::clone(&store),
            batch_queue.clone(),
            SchemaRegistry::for_environment(config.environment),
            timers.clone(),
            config.lock_expiry,
            config.stale_lock_max_rounds,
        ));
        let batching = Arc::new(BatchingService::new(
            Arc::clone(&store),
            closer,
            timers.clone(),
            config.batch_interval,
            config.batch_max_count,
        ));
        let announce = Arc::new(AnnounceStage::new(announcer, publish_queue.clone()));
        let capacity = Arc::new(CapacityController::new(
            Arc::clone(&ledger),
            store,
            Arc::clone(&publish_queue),
            config.provider_id,
            config.capacity_limit,
            config.seconds_per_block,
        ));
        let publisher = Arc::new(PublishScheduler::new(
            Arc::clone(&ledger),
            Arc::clone(&capacity),
            monitor_queue.clone(),
            config.provider_id,
            config.monitor_initial_delay,
        ));
        let monitor = Arc::new(TxMonitor::new(
            ledger,
            publish_queue.clone(),
            config.blocks_per_scan,
            config.tx_max_attempts,
            config.blocks_to_duration(1),
        ));

        Ok(Self {
            config,
            intake,
            batch_queue,
            publish_queue,
            monitor_queue,
            timers,
            batching,
            announce,
            capacity,
            publisher,
            monitor,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn intake_queue(&self, kind: AnnouncementType) -> Option<&Arc<JobQueue<Announcement>>> {
        self.intake.get(&kind)
    }

    pub fn batch_queue(&self) -> &Arc<JobQueue<BatchAnnouncerJob>> {
        &self.batch_queue
    }

    pub fn publish_queue(&self) -> &Arc<JobQueue<PublisherJob>> {
        &self.publish_queue
    }

    pub fn monitor_queue(&self) -> &Arc<JobQueue<TxMonitorJob>> {
        &self.monitor_queue
    }

    pub fn batching(&self) -> &Arc<BatchingService> {
        &self.batching
    }

    pub fn announce_stage(&self) -> &Arc<AnnounceStage> {
        &self.announce
    }

    pub fn capacity(&self) -> &Arc<CapacityController> {
        &self.capacity
    }

    pub fn publisher(&self) -> &Arc<PublishScheduler> {
        &self.publisher
    }

    pub fn monitor(&self) -> &Arc<TxMonitor> {
        &self.monitor
    }

    pub fn timers(&self) -> &BatchTimeoutScheduler {
        &self.timers
    }

    /// Queues one announcement on its type's intake queue, keyed by its id.
    pub fn submit(
        &self,
        kind: AnnouncementType,
        announcement: Announcement,
    ) -> Result<bool, PipelineError> {
        let queue = self
            .intake_queue(kind)
            .ok_or(PipelineError::UnknownType(kind))?;
        let id = announcement.id.clone();
        Ok(queue.add(id, announcement, JobOptions::default())?)
    }

    /// Restores batch timers from the store and evaluates capacity once.
    pub async fn start(&self) -> Result<CapacityState, PipelineError> {
        for kind in AnnouncementType::ALL {
            self.batching.setup_active_batch_timeout(kind).await?;
        }
        let state = self.capacity.check_capacity().await?;
        info!(?state, environment = %self.config.environment, "pipeline started");
        Ok(state)
    }

    /// Starts one dispatcher per queue. Each exits once `shutdown` flips.
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let concurrency = self.config.queue_concurrency;
        let jobs = self.config.job_retry_policy();
        let mut handles = Vec::with_capacity(self.intake.len() + 3);
        for (kind, queue) in &self.intake {
            handles.push(spawn_workers(
                Arc::clone(queue),
                Arc::new(IntakeProcessor::new(*kind, Arc::clone(&self.batching))),
                concurrency,
                jobs,
                shutdown.clone(),
            ));
        }
        handles.push(spawn_workers(
            Arc::clone(&self.batch_queue),
            Arc::clone(&self.announce),
            concurrency,
            jobs,
            shutdown.clone(),
        ));
        handles.push(spawn_workers(
            Arc::clone(&self.publish_queue),
            Arc::clone(&self.publisher),
            concurrency,
            jobs,
            shutdown.clone(),
        ));
        handles.push(spawn_workers(
            Arc::clone(&self.monitor_queue),
            Arc::clone(&self.monitor),
            concurrency,
            self.config.monitor_retry_policy(),
            shutdown,
        ));
        handles
    }

    /// True when no job is pending anywhere and no batch timer is armed.
    pub fn is_idle(&self) -> bool {
        self.intake.values().all(|q| q.is_idle())
            && self.batch_queue.is_idle()
            && self.publish_queue.is_idle()
            && self.monitor_queue.is_idle()
            && self.timers.armed_count() == 0
    }

    /// Closes every queue and drops all pending timers.
    ///
    /// Open batches stay in the store and are picked up again by
    /// [`Pipeline::start`].
    pub fn shutdown(&self) {
        for queue in self.intake.values() {
            queue.close();
        }
        self.batch_queue.close();
        self.publish_queue.close();
        self.monitor_queue.close();
        self.capacity.cancel_recheck();
        self.timers.cancel_all();
        info!("pipeline stopped");
    }
}
