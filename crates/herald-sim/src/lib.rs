//! Deterministic harness for end-to-end pipeline scenarios.
//!
//! A [`Harness`] wires a [`Pipeline`] to a [`MemoryStore`] and a
//! [`SimLedger`]. Tests either step the queues by hand with
//! [`Harness::step`] or run the real worker pools next to a block producer.

use std::sync::Arc;
use std::time::Duration;

use herald_chain::{SimLedger, SimLedgerConfig};
use herald_core::{Announcement, AnnouncementType};
use herald_node::announce::DigestAnnouncer;
use herald_node::batch::IntakeProcessor;
use herald_node::config::PipelineConfig;
use herald_node::queue::{JobQueue, Processor, RetryPolicy};
use herald_node::service::{Pipeline, PipelineError};
use herald_store::MemoryStore;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Capacity issued to the sim provider each epoch.
pub const DEFAULT_PROVIDER_CAPACITY: u128 = 1_000;

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub ledger: SimLedger,
    pub pipeline: Pipeline,
}

impl Harness {
    pub fn new(
        config: PipelineConfig,
        ledger_config: SimLedgerConfig,
    ) -> Result<Self, PipelineError> {
        Self::with_capacity(config, ledger_config, DEFAULT_PROVIDER_CAPACITY)
    }

    pub fn with_capacity(
        config: PipelineConfig,
        ledger_config: SimLedgerConfig,
        provider_capacity: u128,
    ) -> Result<Self, PipelineError> {
        let store = Arc::new(MemoryStore::new());
        let ledger = SimLedger::new(ledger_config);
        ledger.add_provider(config.provider_id, provider_capacity);
        let pipeline = Pipeline::new(
            config,
            store.clone(),
            Arc::new(ledger.clone()),
            Arc::new(DigestAnnouncer::new()),
        )?;
        Ok(Self {
            store,
            ledger,
            pipeline,
        })
    }

    /// Queues an announcement whose payload echoes its id.
    pub fn submit(&self, kind: AnnouncementType, id: &str) -> Result<bool, PipelineError> {
        self.pipeline
            .submit(kind, Announcement::new(id, json!({ "id": id })))
    }

    /// Runs every ready job once, stage by stage, and returns how many ran.
    pub async fn step(&self) -> usize {
        let cfg = self.pipeline.config();
        let jobs = cfg.job_retry_policy();
        let mut ran = 0;
        for kind in AnnouncementType::ALL {
            let Some(queue) = self.pipeline.intake_queue(kind) else {
                continue;
            };
            let processor = IntakeProcessor::new(kind, Arc::clone(self.pipeline.batching()));
            ran += drain(queue, &processor, &jobs).await;
        }
        ran += drain(
            self.pipeline.batch_queue(),
            self.pipeline.announce_stage().as_ref(),
            &jobs,
        )
        .await;
        ran += drain(
            self.pipeline.publish_queue(),
            self.pipeline.publisher().as_ref(),
            &jobs,
        )
        .await;
        ran += drain(
            self.pipeline.monitor_queue(),
            self.pipeline.monitor().as_ref(),
            &cfg.monitor_retry_policy(),
        )
        .await;
        ran
    }

    /// Starts worker pools plus a task producing one block per block time.
    pub fn spawn_all(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = self.pipeline.spawn_workers(shutdown.clone());
        handles.push(spawn_block_producer(
            self.ledger.clone(),
            self.pipeline.config().block_time(),
            shutdown,
        ));
        handles
    }
}

async fn drain<T, P>(
    queue: &JobQueue<T>,
    processor: &P,
    policy: &RetryPolicy,
) -> usize
where
    T: Send + Sync + 'static,
    P: Processor<T> + ?Sized,
{
    let mut ran = 0;
    while queue.process_next(processor, policy).await.is_some() {
        ran += 1;
    }
    ran
}

/// Produces a block every `interval` until `shutdown` flips.
pub fn spawn_block_producer(
    ledger: SimLedger,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    ledger.produce_block();
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Seeded mix of announcements spread over every type.
pub fn random_announcements(seed: u64, count: usize) -> Vec<(AnnouncementType, Announcement)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let kind = AnnouncementType::ALL[rng.gen_range(0..AnnouncementType::ALL.len())];
            let size = rng.gen_range(1..64_usize);
            let id = format!("{}-{i}", kind.as_str());
            let body: String = (0..size).map(|_| rng.gen_range('a'..='z')).collect();
            (kind, Announcement::new(id, json!({ "body": body })))
        })
        .collect()
}
