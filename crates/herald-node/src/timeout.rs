use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

type Registry<K> = Arc<Mutex<HashMap<K, ArmedTimer>>>;

/// Process-local registry of keyed deferred actions.
///
/// At most one timer is armed per key. A timer unregisters itself before its
/// action runs, so an action may freely cancel or re-arm its own key.
pub struct TimeoutScheduler<K> {
    timers: Registry<K>,
    next_generation: Arc<AtomicU64>,
}

impl<K> Clone for TimeoutScheduler<K> {
    fn clone(&self) -> Self {
        Self {
            timers: Arc::clone(&self.timers),
            next_generation: Arc::clone(&self.next_generation),
        }
    }
}

impl<K> Default for TimeoutScheduler<K> {
    fn default() -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<K> fmt::Debug for TimeoutScheduler<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutScheduler").finish_non_exhaustive()
    }
}

fn lock_registry<K>(timers: &Registry<K>) -> MutexGuard<'_, HashMap<K, ArmedTimer>> {
    timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<K> TimeoutScheduler<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `action` to run after `delay`, replacing any timer for `key`.
    pub fn arm<F>(&self, key: K, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut timers = lock_registry(&self.timers);
        let armed = self.spawn_timer(key.clone(), delay, action);
        if let Some(previous) = timers.insert(key, armed) {
            previous.handle.abort();
        }
    }

    /// Arms `action` only if no timer exists for `key`. Returns whether it armed.
    pub fn arm_if_absent<F>(&self, key: K, delay: Duration, action: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut timers = lock_registry(&self.timers);
        if timers.contains_key(&key) {
            debug!(?key, "timer already armed");
            return false;
        }
        let armed = self.spawn_timer(key.clone(), delay, action);
        timers.insert(key, armed);
        true
    }

    // Callers hold the registry lock, so the task cannot unregister itself
    // before its entry is inserted.
    fn spawn_timer<F>(&self, key: K, delay: Duration, action: F) -> ArmedTimer
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut registry = lock_registry(&timers);
                match registry.get(&key) {
                    Some(armed) if armed.generation == generation => {
                        registry.remove(&key);
                    }
                    _ => return,
                }
            }
            debug!(?key, "timer fired");
            action.await;
        });
        ArmedTimer { generation, handle }
    }

    /// Cancels the timer for `key`. Absence is not an error.
    pub fn cancel(&self, key: &K) -> bool {
        match lock_registry(&self.timers).remove(key) {
            Some(armed) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, armed) in lock_registry(&self.timers).drain() {
            armed.handle.abort();
        }
    }

    pub fn is_armed(&self, key: &K) -> bool {
        lock_registry(&self.timers).contains_key(key)
    }

    pub fn armed_count(&self) -> usize {
        lock_registry(&self.timers).len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::TimeoutScheduler;

    fn counting(counter: &Arc<AtomicU32>, by: u32) -> impl std::future::Future<Output = ()> {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(by, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let timers = TimeoutScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        timers.arm("q", Duration::from_secs(12), counting(&fired, 1));
        assert!(timers.is_armed(&"q"));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_armed(&"q"));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_previous_timer() {
        let timers = TimeoutScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        timers.arm("q", Duration::from_secs(5), counting(&fired, 1));
        timers.arm("q", Duration::from_secs(10), counting(&fired, 10));
        assert_eq!(timers.armed_count(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let timers = TimeoutScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        timers.arm("q", Duration::from_secs(5), counting(&fired, 1));
        assert!(timers.cancel(&"q"));
        assert!(!timers.cancel(&"q"));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn arm_if_absent_ignores_duplicates() {
        let timers = TimeoutScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        assert!(timers.arm_if_absent((), Duration::from_secs(5), counting(&fired, 1)));
        assert!(!timers.arm_if_absent((), Duration::from_secs(1), counting(&fired, 100)));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
