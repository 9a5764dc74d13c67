use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::{LockResponse, LockStatus, Store, APPEND_INCONSISTENT};

/// Millisecond clock used for key expiry.
pub type StoreClock = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum StoredValue {
    Text(String),
    /// Field/value pairs in insertion order.
    Hash(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredEntry {
    pub(crate) value: StoredValue,
    pub(crate) expires_at_ms: Option<u64>,
}

/// Time-bounded claim recorded when a batch is moved under lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockClaim {
    pub acquired_at_ms: u64,
    pub expires_at_ms: u64,
}

/// Serializable store contents.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub(crate) entries: HashMap<String, StoredEntry>,
    /// Lock claims keyed by locked-metadata key.
    pub(crate) locks: HashMap<String, LockClaim>,
}

impl StoreSnapshot {
    fn purge_if_expired(&mut self, key: &str, now_ms: u64) {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at_ms)
            .is_some_and(|at| at <= now_ms);
        if expired {
            self.entries.remove(key);
        }
    }

    fn text(&mut self, key: &str, now_ms: u64) -> Result<Option<&String>, StoreError> {
        self.purge_if_expired(key, now_ms);
        match self.entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(StoredValue::Text(v)) => Ok(Some(v)),
            Some(StoredValue::Hash(_)) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn hash(
        &mut self,
        key: &str,
        now_ms: u64,
    ) -> Result<Option<&mut Vec<(String, String)>>, StoreError> {
        self.purge_if_expired(key, now_ms);
        match self.entries.get_mut(key).map(|e| &mut e.value) {
            None => Ok(None),
            Some(StoredValue::Hash(v)) => Ok(Some(v)),
            Some(StoredValue::Text(_)) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn put_text(&mut self, key: &str, value: String, expires_at_ms: Option<u64>) {
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value: StoredValue::Text(value),
                expires_at_ms,
            },
        );
    }

    fn rename(&mut self, from: &str, to: &str) {
        if let Some(entry) = self.entries.remove(from) {
            self.entries.insert(to.to_string(), entry);
        }
    }

    /// Keys currently present, expired ones excluded.
    pub fn keys(&self, now_ms: u64) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at_ms.map_or(true, |at| at > now_ms))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn locks(&self) -> &HashMap<String, LockClaim> {
        &self.locks
    }
}

/// In-process [`Store`] whose atomic operations run under one mutex.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreSnapshot>>,
    clock: StoreClock,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(herald_core::time::now_ms))
    }

    /// Creates a store driven by an explicit expiry clock.
    pub fn with_clock(clock: StoreClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreSnapshot::default())),
            clock,
        }
    }

    /// Creates a store pre-populated from a snapshot.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::new();
        *store.lock_state() = snapshot;
        store
    }

    /// Clones the current contents for persistence or inspection.
    pub fn snapshot(&self) -> StoreSnapshot {
        self.lock_state().clone()
    }

    pub fn now_ms(&self) -> u64 {
        (self.clock)()
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreSnapshot> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn bump_row_count(meta_json: &str, row_count: u64) -> Option<String> {
    let mut meta: serde_json::Value = serde_json::from_str(meta_json).ok()?;
    meta.as_object_mut()?
        .insert("rowCount".to_string(), serde_json::Value::from(row_count));
    serde_json::to_string(&meta).ok()
}

fn row_count_of(meta_json: &str) -> Option<u64> {
    let meta: serde_json::Value = serde_json::from_str(meta_json).ok()?;
    meta.get("rowCount")?.as_u64()
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.now_ms();
        let mut state = self.lock_state();
        Ok(state.text(key, now)?.cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = self.now_ms();
        let expires_at = ttl.map(|ttl| now.saturating_add(ttl.as_millis() as u64));
        self.lock_state().put_text(key, value.to_string(), expires_at);
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: u128) -> Result<u128, StoreError> {
        let now = self.now_ms();
        let mut state = self.lock_state();
        let current = match state.text(key, now)? {
            Some(raw) => raw
                .parse::<u128>()
                .map_err(|_| StoreError::NotAnInteger(key.to_string()))?,
            None => 0,
        };
        let next = current.saturating_add(delta);
        let expires_at = state.entries.get(key).and_then(|e| e.expires_at_ms);
        state.put_text(key, next.to_string(), expires_at);
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.now_ms();
        let mut state = self.lock_state();
        state.purge_if_expired(key, now);
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at_ms = Some(now.saturating_add(ttl.as_millis() as u64));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_many(&self, keys: &[&str]) -> Result<usize, StoreError> {
        let mut state = self.lock_state();
        let mut removed = 0usize;
        for key in keys {
            if state.entries.remove(*key).is_some() {
                removed += 1;
            }
            state.locks.remove(*key);
        }
        Ok(removed)
    }

    async fn append_and_count(
        &self,
        meta_key: &str,
        data_key: &str,
        initial_meta_json: &str,
        entry_id: &str,
        entry_json: &str,
    ) -> Result<i64, StoreError> {
        let now = self.now_ms();
        let mut state = self.lock_state();

        let meta = state.text(meta_key, now)?.cloned();
        let has_data = state.hash(data_key, now)?.is_some();

        let Some(meta) = meta else {
            if has_data {
                debug!(meta_key, data_key, "batch data present without metadata");
                return Ok(APPEND_INCONSISTENT);
            }
            state.put_text(meta_key, initial_meta_json.to_string(), None);
            state.entries.insert(
                data_key.to_string(),
                StoredEntry {
                    value: StoredValue::Hash(vec![(entry_id.to_string(), entry_json.to_string())]),
                    expires_at_ms: None,
                },
            );
            return Ok(1);
        };

        let Some(row_count) = row_count_of(&meta) else {
            return Ok(APPEND_INCONSISTENT);
        };
        let Some(rows) = state.hash(data_key, now)? else {
            debug!(meta_key, data_key, "batch metadata present without data");
            return Ok(APPEND_INCONSISTENT);
        };
        if rows.len() as u64 != row_count {
            return Ok(APPEND_INCONSISTENT);
        }

        if let Some(existing) = rows.iter_mut().find(|(id, _)| id == entry_id) {
            existing.1 = entry_json.to_string();
            return Ok(row_count as i64);
        }

        rows.push((entry_id.to_string(), entry_json.to_string()));
        let next = row_count + 1;
        let Some(updated) = bump_row_count(&meta, next) else {
            return Ok(APPEND_INCONSISTENT);
        };
        state.put_text(meta_key, updated, None);
        Ok(next as i64)
    }

    async fn compare_and_lock(
        &self,
        meta_key: &str,
        data_key: &str,
        locked_meta_key: &str,
        locked_data_key: &str,
        now_ms: u64,
        lock_expiry_ms: u64,
    ) -> Result<LockResponse, StoreError> {
        let clock_now = self.now_ms();
        let mut state = self.lock_state();
        let claim = LockClaim {
            acquired_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(lock_expiry_ms),
        };

        if let Some(locked_meta) = state.text(locked_meta_key, clock_now)?.cloned() {
            let live = state
                .locks
                .get(locked_meta_key)
                .is_some_and(|c| now_ms < c.expires_at_ms);
            if live {
                return Ok(LockResponse::empty(LockStatus::LockedByOther));
            }
            state.locks.insert(locked_meta_key.to_string(), claim);
            let entries = state
                .hash(locked_data_key, clock_now)?
                .cloned()
                .unwrap_or_default();
            return Ok(LockResponse {
                status: LockStatus::StaleLockRecovered,
                entries,
                metadata: Some(locked_meta),
            });
        }
        // A claim without its locked metadata is leftover from a partial cleanup.
        state.locks.remove(locked_meta_key);

        let Some(meta) = state.text(meta_key, clock_now)?.cloned() else {
            return Ok(LockResponse::empty(LockStatus::NoBatch));
        };
        let entries = state
            .hash(data_key, clock_now)?
            .cloned()
            .unwrap_or_default();

        state.rename(meta_key, locked_meta_key);
        state.rename(data_key, locked_data_key);
        state.locks.insert(locked_meta_key.to_string(), claim);

        Ok(LockResponse {
            status: LockStatus::Acquired,
            entries,
            metadata: Some(meta),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::MemoryStore;
    use crate::{LockStatus, Store, APPEND_INCONSISTENT};

    const META: &str = "batchMetadata:q";
    const DATA: &str = "batchData:q";
    const LOCKED_META: &str = "lock:batchMetadata:q";
    const LOCKED_DATA: &str = "lock:batchData:q";

    fn initial_meta(batch_id: &str) -> String {
        format!(r#"{{"batchId":"{batch_id}","startTimestamp":0,"rowCount":1}}"#)
    }

    fn manual_clock() -> (Arc<AtomicU64>, MemoryStore) {
        let now = Arc::new(AtomicU64::new(1_000));
        let handle = Arc::clone(&now);
        let store = MemoryStore::with_clock(Arc::new(move || handle.load(Ordering::SeqCst)));
        (now, store)
    }

    async fn append(store: &MemoryStore, batch_id: &str, id: &str) -> i64 {
        store
            .append_and_count(META, DATA, &initial_meta(batch_id), id, &format!(r#"{{"id":"{id}"}}"#))
            .await
            .expect("append")
    }

    #[tokio::test]
    async fn first_append_opens_batch_and_later_appends_count() {
        let store = MemoryStore::new();
        assert_eq!(append(&store, "b1", "a").await, 1);
        assert_eq!(append(&store, "b2", "b").await, 2);
        assert_eq!(append(&store, "b3", "c").await, 3);

        let meta = store.get(META).await.expect("get").expect("meta");
        let parsed: serde_json::Value = serde_json::from_str(&meta).expect("json");
        assert_eq!(parsed["batchId"], "b1");
        assert_eq!(parsed["rowCount"], 3);
    }

    #[tokio::test]
    async fn duplicate_entry_id_does_not_double_count() {
        let store = MemoryStore::new();
        assert_eq!(append(&store, "b1", "a").await, 1);
        assert_eq!(append(&store, "b1", "b").await, 2);
        assert_eq!(append(&store, "b1", "a").await, 2);
        assert_eq!(append(&store, "b1", "c").await, 3);
    }

    #[tokio::test]
    async fn metadata_without_data_is_reported_inconsistent() {
        let store = MemoryStore::new();
        store
            .set(META, &initial_meta("orphan"), None)
            .await
            .expect("set");
        assert_eq!(append(&store, "b1", "a").await, APPEND_INCONSISTENT);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_lose_no_updates() {
        let store = MemoryStore::new();
        let mut handles = Vec::new();
        for i in 0..64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                append(&store, &format!("batch-{i}"), &format!("job-{i}")).await
            }));
        }
        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.expect("join"));
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=64).collect::<Vec<i64>>());

        let meta = store.get(META).await.expect("get").expect("meta");
        let parsed: serde_json::Value = serde_json::from_str(&meta).expect("json");
        assert_eq!(parsed["rowCount"], 64);
    }

    #[tokio::test]
    async fn lock_reports_no_batch_when_queue_is_empty() {
        let store = MemoryStore::new();
        let resp = store
            .compare_and_lock(META, DATA, LOCKED_META, LOCKED_DATA, 1_000, 30_000)
            .await
            .expect("lock");
        assert_eq!(resp.status, LockStatus::NoBatch);
    }

    #[tokio::test]
    async fn lock_moves_batch_and_blocks_second_closer() {
        let store = MemoryStore::new();
        append(&store, "b1", "a").await;
        append(&store, "b1", "b").await;

        let first = store
            .compare_and_lock(META, DATA, LOCKED_META, LOCKED_DATA, 1_000, 30_000)
            .await
            .expect("lock");
        assert_eq!(first.status, LockStatus::Acquired);
        let ids: Vec<&str> = first.entries.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(store.get(META).await.expect("get").is_none());

        // A new batch opens while the old one is still locked.
        assert_eq!(append(&store, "b2", "c").await, 1);

        let second = store
            .compare_and_lock(META, DATA, LOCKED_META, LOCKED_DATA, 2_000, 30_000)
            .await
            .expect("lock");
        assert_eq!(second.status, LockStatus::LockedByOther);
        assert!(second.entries.is_empty());
    }

    #[tokio::test]
    async fn expired_lock_is_recovered_with_the_locked_batch() {
        let store = MemoryStore::new();
        append(&store, "old", "a").await;
        store
            .compare_and_lock(META, DATA, LOCKED_META, LOCKED_DATA, 1_000, 30_000)
            .await
            .expect("lock");
        append(&store, "new", "b").await;

        let resp = store
            .compare_and_lock(META, DATA, LOCKED_META, LOCKED_DATA, 31_000, 30_000)
            .await
            .expect("lock");
        assert_eq!(resp.status, LockStatus::StaleLockRecovered);
        assert_eq!(resp.entries.len(), 1);
        assert_eq!(resp.entries[0].0, "a");
        assert!(resp.metadata.expect("meta").contains("\"old\""));

        // The stale recovery refreshed the claim.
        let again = store
            .compare_and_lock(META, DATA, LOCKED_META, LOCKED_DATA, 32_000, 30_000)
            .await
            .expect("lock");
        assert_eq!(again.status, LockStatus::LockedByOther);
    }

    #[tokio::test]
    async fn delete_many_releases_lock_claim() {
        let store = MemoryStore::new();
        append(&store, "b1", "a").await;
        store
            .compare_and_lock(META, DATA, LOCKED_META, LOCKED_DATA, 1_000, 30_000)
            .await
            .expect("lock");
        let removed = store
            .delete_many(&[LOCKED_META, LOCKED_DATA])
            .await
            .expect("delete");
        assert_eq!(removed, 2);
        assert!(store.snapshot().locks().is_empty());

        let resp = store
            .compare_and_lock(META, DATA, LOCKED_META, LOCKED_DATA, 2_000, 30_000)
            .await
            .expect("lock");
        assert_eq!(resp.status, LockStatus::NoBatch);
    }

    #[tokio::test]
    async fn counters_expire_on_their_ttl() {
        let (now, store) = manual_clock();
        assert_eq!(store.incr_by("epochCapacity:7", 40).await.expect("incr"), 40);
        assert!(store
            .expire("epochCapacity:7", Duration::from_millis(500))
            .await
            .expect("expire"));
        assert_eq!(store.incr_by("epochCapacity:7", 2).await.expect("incr"), 42);

        now.fetch_add(500, Ordering::SeqCst);
        assert!(store.get("epochCapacity:7").await.expect("get").is_none());
        assert_eq!(store.incr_by("epochCapacity:7", 1).await.expect("incr"), 1);
    }

    #[tokio::test]
    async fn incr_rejects_non_integer_values() {
        let store = MemoryStore::new();
        store.set("k", "abc", None).await.expect("set");
        assert!(store.incr_by("k", 1).await.is_err());
    }
}
