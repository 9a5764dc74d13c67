//! Shared key-value store used for batch buffers, batch metadata, batch
//! locks, and per-epoch capacity counters.
//!
//! Callers never read-then-write batch keys themselves; all batch mutation
//! goes through the two atomic operations, [`Store::append_and_count`] and
//! [`Store::compare_and_lock`].

pub mod error;
pub mod memory;
pub mod persistence;

use std::time::Duration;

use async_trait::async_trait;

pub use error::StoreError;
pub use memory::{LockClaim, MemoryStore, StoreClock, StoreSnapshot};

/// Sentinel returned by [`Store::append_and_count`] when the batch buffer and
/// its metadata disagree.
pub const APPEND_INCONSISTENT: i64 = -1;

/// Outcome of a [`Store::compare_and_lock`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// No metadata for the queue; nothing to close.
    NoBatch,
    /// A live lock is held by another closer.
    LockedByOther,
    /// An expired lock was taken over; the response carries the batch that
    /// lock was guarding, not the currently open one.
    StaleLockRecovered,
    /// The open batch was moved under a fresh lock.
    Acquired,
}

impl LockStatus {
    /// Wire code used by script-based stores.
    pub fn code(self) -> i64 {
        match self {
            LockStatus::NoBatch => 0,
            LockStatus::LockedByOther => -2,
            LockStatus::StaleLockRecovered => -1,
            LockStatus::Acquired => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(LockStatus::NoBatch),
            -2 => Some(LockStatus::LockedByOther),
            -1 => Some(LockStatus::StaleLockRecovered),
            1 => Some(LockStatus::Acquired),
            _ => None,
        }
    }
}

/// Result of [`Store::compare_and_lock`]: status, locked entries in insertion
/// order as `(entry_id, entry_json)`, and the locked metadata JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockResponse {
    pub status: LockStatus,
    pub entries: Vec<(String, String)>,
    pub metadata: Option<String>,
}

impl LockResponse {
    pub fn empty(status: LockStatus) -> Self {
        Self {
            status,
            entries: Vec::new(),
            metadata: None,
        }
    }
}

/// Key-value store contract consumed by the pipeline.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Adds `delta` to the integer at `key` (missing counts as zero).
    async fn incr_by(&self, key: &str, delta: u128) -> Result<u128, StoreError>;

    /// Sets a time-to-live on an existing key. Returns false if absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Deletes all `keys` in one atomic step, returning how many existed.
    async fn delete_many(&self, keys: &[&str]) -> Result<usize, StoreError>;

    /// Atomically appends one entry to the batch under `data_key`.
    ///
    /// Creates the batch from `initial_meta_json` when no metadata exists,
    /// otherwise bumps `rowCount`. Re-adding an existing `entry_id` does not
    /// count twice. Returns the row count after the append, or
    /// [`APPEND_INCONSISTENT`] if metadata and data disagree.
    async fn append_and_count(
        &self,
        meta_key: &str,
        data_key: &str,
        initial_meta_json: &str,
        entry_id: &str,
        entry_json: &str,
    ) -> Result<i64, StoreError>;

    /// Atomically moves the open batch under a time-bounded lock.
    async fn compare_and_lock(
        &self,
        meta_key: &str,
        data_key: &str,
        locked_meta_key: &str,
        locked_data_key: &str,
        now_ms: u64,
        lock_expiry_ms: u64,
    ) -> Result<LockResponse, StoreError>;
}
