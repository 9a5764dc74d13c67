use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use herald_chain::SimLedgerConfig;
use herald_core::time::now_ms;
use herald_core::{Announcement, AnnouncementType, BatchId, BatchMetadata};
use herald_node::batch::CloseTrigger;
use herald_node::config::PipelineConfig;
use herald_node::keys::BatchKeys;
use herald_node::queue::Job;
use herald_sim::Harness;
use herald_store::{LockStatus, Store};
use serde_json::json;

const REPLY: AnnouncementType = AnnouncementType::Reply;

fn harness() -> Harness {
    let config = PipelineConfig {
        batch_max_count: 1000,
        ..PipelineConfig::default()
    };
    Harness::new(config, SimLedgerConfig::default()).expect("harness")
}

async fn open_batch_id(h: &Harness, kind: AnnouncementType) -> BatchId {
    let raw = h
        .store
        .get(&BatchKeys::for_type(kind).metadata)
        .await
        .expect("get")
        .expect("open batch");
    serde_json::from_str::<BatchMetadata>(&raw)
        .expect("metadata")
        .batch_id
}

#[tokio::test(start_paused = true)]
async fn e2e_stale_lock_takeover_emits_both_batches() {
    let h = harness();
    h.submit(REPLY, "a1").expect("submit");
    h.submit(REPLY, "a2").expect("submit");
    h.step().await;
    let stale = open_batch_id(&h, REPLY).await;

    // A closer takes the lock and dies before emitting.
    let keys = BatchKeys::for_type(REPLY);
    let crashed = h
        .store
        .compare_and_lock(
            &keys.metadata,
            &keys.data,
            &keys.locked_metadata,
            &keys.locked_data,
            now_ms() - 60_000,
            30_000,
        )
        .await
        .expect("lock");
    assert_eq!(crashed.status, LockStatus::Acquired);

    h.submit(REPLY, "b1").expect("submit");
    h.step().await;
    let current = open_batch_id(&h, REPLY).await;
    assert_ne!(stale, current);

    let emitted = h
        .pipeline
        .batching()
        .closer()
        .close(REPLY, &current, CloseTrigger::Timeout)
        .await
        .expect("close");
    assert_eq!(emitted, vec![stale.clone(), current.clone()]);

    let first = h.pipeline.batch_queue().take_ready().expect("stale batch");
    let second = h.pipeline.batch_queue().take_ready().expect("current batch");
    assert_eq!(first.data.batch_id, stale);
    assert_eq!(first.data.announcements.len(), 2);
    assert_eq!(second.data.batch_id, current);
    assert_eq!(second.data.announcements.len(), 1);

    assert_eq!(h.pipeline.timers().armed_count(), 0);
    for key in [&keys.metadata, &keys.locked_metadata, &keys.locked_data] {
        assert!(h.store.get(key).await.expect("get").is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn e2e_timeout_blocked_by_live_lock_closes_after_the_lock_lapses() {
    let h = harness();
    h.submit(REPLY, "a1").expect("submit");
    h.step().await;
    let previous = open_batch_id(&h, REPLY).await;

    // Another closer holds the previous batch; its lock lapses in three seconds.
    let keys = BatchKeys::for_type(REPLY);
    let lock_expiry = h.pipeline.config().lock_expiry.as_millis() as u64;
    let held = h
        .store
        .compare_and_lock(
            &keys.metadata,
            &keys.data,
            &keys.locked_metadata,
            &keys.locked_data,
            now_ms() + 3_000 - lock_expiry,
            lock_expiry,
        )
        .await
        .expect("lock");
    assert_eq!(held.status, LockStatus::Acquired);
    h.pipeline.timers().cancel_all();

    h.submit(REPLY, "b1").expect("submit");
    h.step().await;
    let current = open_batch_id(&h, REPLY).await;
    assert_eq!(h.pipeline.timers().armed_count(), 1);

    tokio::time::sleep(h.pipeline.config().batch_interval + Duration::from_secs(1)).await;
    assert_eq!(h.pipeline.batch_queue().counts().waiting, 0);
    assert_eq!(open_batch_id(&h, REPLY).await, current);
    assert_eq!(h.pipeline.timers().armed_count(), 1, "close retry armed");

    std::thread::sleep(Duration::from_millis(3_100));
    tokio::time::sleep(h.pipeline.config().lock_expiry + Duration::from_secs(1)).await;

    let first = h.pipeline.batch_queue().take_ready().expect("previous batch");
    let second = h.pipeline.batch_queue().take_ready().expect("current batch");
    assert_eq!(first.data.batch_id, previous);
    assert_eq!(second.data.batch_id, current);
    assert_eq!(h.pipeline.timers().armed_count(), 0);
    assert!(h.store.get(&keys.metadata).await.expect("get").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn e2e_concurrent_appends_build_one_batch() {
    let h = harness();
    let batching = Arc::clone(h.pipeline.batching());
    let tasks = (0..64).map(|i| {
        let batching = Arc::clone(&batching);
        tokio::spawn(async move {
            let id = format!("row-{i}");
            let job = Job {
                id: id.clone(),
                data: Announcement::new(id, json!({ "i": i })),
                attempts_made: 0,
            };
            batching.process(REPLY, &job).await.expect("append")
        })
    });
    let mut counts: Vec<u64> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.expect("task"))
        .collect();
    counts.sort_unstable();
    assert_eq!(counts, (1..=64).collect::<Vec<u64>>());

    let raw = h
        .store
        .get(&BatchKeys::for_type(REPLY).metadata)
        .await
        .expect("get")
        .expect("metadata");
    let metadata: BatchMetadata = serde_json::from_str(&raw).expect("metadata");
    assert_eq!(metadata.row_count, 64);
    assert_eq!(h.pipeline.timers().armed_count(), 1);
    h.pipeline.timers().cancel_all();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn e2e_concurrent_closes_emit_the_batch_once() {
    let h = harness();
    for i in 0..5 {
        h.submit(REPLY, &format!("r{i}")).expect("submit");
    }
    h.step().await;
    let batch_id = open_batch_id(&h, REPLY).await;

    let closer = Arc::clone(h.pipeline.batching().closer());
    let closes = (0..8).map(|_| {
        let closer = Arc::clone(&closer);
        let batch_id = batch_id.clone();
        tokio::spawn(async move {
            closer
                .close(REPLY, &batch_id, CloseTrigger::Timeout)
                .await
                .expect("close")
        })
    });
    let emitted: Vec<BatchId> = join_all(closes)
        .await
        .into_iter()
        .flat_map(|r| r.expect("task"))
        .collect();
    assert_eq!(emitted, vec![batch_id]);
    assert_eq!(h.pipeline.batch_queue().counts().waiting, 1);
}
