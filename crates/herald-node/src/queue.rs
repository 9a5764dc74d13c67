//! In-process job queue with delayed scheduling, id deduplication,
//! pause/resume, and bounded retries with exponential backoff.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use thiserror::Error;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Finished job ids remembered for deduplication.
pub const DEFAULT_RETAINED_JOBS: usize = 1000;

const IDLE_WAKE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue {0} is closed")]
    Closed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Time before the job becomes ready.
    pub delay: Duration,
}

impl JobOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self { delay }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job<T> {
    pub id: String,
    pub data: T,
    /// Previously failed attempts; zero on first delivery.
    pub attempts_made: u32,
}

/// Result of a processed job. `Err` from a processor means "retry".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Finished without success; not retried.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each later one.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Delay before retrying a job that has failed `failures` times.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.backoff.saturating_mul(1_u32 << exponent)
    }
}

/// Handles jobs pulled from a [`JobQueue`].
#[async_trait]
pub trait Processor<T: Send + Sync + 'static>: Send + Sync {
    type Error: fmt::Display + Send;

    async fn process(&self, job: &Job<T>) -> Result<JobOutcome, Self::Error>;
}

/// Enqueue-side view of a queue.
#[async_trait]
pub trait JobSink<T: Send + 'static>: Send + Sync {
    /// Adds a job unless `id` is already known. Returns whether it was added.
    async fn enqueue(&self, id: &str, data: T, options: JobOptions) -> Result<bool, QueueError>;

    /// Drops a pending or finished job record so `id` can be reused.
    async fn remove(&self, id: &str) -> Result<bool, QueueError>;
}

struct DelayedJob<T> {
    due: Instant,
    job: Job<T>,
}

struct QueueState<T> {
    waiting: VecDeque<Job<T>>,
    delayed: Vec<DelayedJob<T>>,
    active: HashSet<String>,
    finished: LruCache<String, JobState>,
    paused: bool,
    closed: bool,
}

impl<T> QueueState<T> {
    fn state_of(&self, id: &str) -> Option<JobState> {
        if self.active.contains(id) {
            return Some(JobState::Active);
        }
        if self.waiting.iter().any(|j| j.id == id) {
            return Some(JobState::Waiting);
        }
        if self.delayed.iter().any(|d| d.job.id == id) {
            return Some(JobState::Delayed);
        }
        self.finished.peek(id).copied()
    }

    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|d| d.due);
        let due = self.delayed.iter().take_while(|d| d.due <= now).count();
        for entry in self.delayed.drain(..due) {
            self.waiting.push_back(entry.job);
        }
    }

    fn schedule(&mut self, job: Job<T>, delay: Duration) {
        if delay.is_zero() {
            self.waiting.push_back(job);
        } else {
            self.delayed.push(DelayedJob {
                due: Instant::now() + delay,
                job,
            });
        }
    }
}

/// Named job queue shared between producers and workers.
pub struct JobQueue<T> {
    name: String,
    state: Mutex<QueueState<T>>,
    wake: Notify,
}

impl<T> fmt::Debug for JobQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> JobQueue<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_retention(name, DEFAULT_RETAINED_JOBS)
    }

    /// Creates a queue that remembers up to `retained` finished job ids.
    pub fn with_retention(name: impl Into<String>, retained: usize) -> Self {
        let retained = NonZeroUsize::new(retained).unwrap_or(NonZeroUsize::MIN);
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                waiting: VecDeque::new(),
                delayed: Vec::new(),
                active: HashSet::new(),
                finished: LruCache::new(retained),
                paused: false,
                closed: false,
            }),
            wake: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a job unless its id is waiting, delayed, active, or retained.
    pub fn add(
        &self,
        id: impl Into<String>,
        data: T,
        options: JobOptions,
    ) -> Result<bool, QueueError> {
        let id = id.into();
        let mut state = self.lock_state();
        if state.closed {
            return Err(QueueError::Closed(self.name.clone()));
        }
        if let Some(existing) = state.state_of(&id) {
            debug!(queue = %self.name, job_id = %id, ?existing, "duplicate job id ignored");
            return Ok(false);
        }
        state.schedule(
            Job {
                id,
                data,
                attempts_made: 0,
            },
            options.delay,
        );
        drop(state);
        self.wake.notify_one();
        Ok(true)
    }

    /// Removes a waiting, delayed, or retained job. Active jobs are untouched.
    pub fn remove(&self, id: &str) -> bool {
        let mut state = self.lock_state();
        let before = state.waiting.len() + state.delayed.len();
        state.waiting.retain(|j| j.id != id);
        state.delayed.retain(|d| d.job.id != id);
        let dropped_pending = before != state.waiting.len() + state.delayed.len();
        let dropped_finished = state.finished.pop(id).is_some();
        dropped_pending || dropped_finished
    }

    pub fn pause(&self) {
        let mut state = self.lock_state();
        if !state.paused {
            state.paused = true;
            info!(queue = %self.name, "queue paused");
        }
    }

    pub fn resume(&self) {
        let mut state = self.lock_state();
        if state.paused {
            state.paused = false;
            info!(queue = %self.name, "queue resumed");
        }
        drop(state);
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.lock_state().paused
    }

    /// Rejects further adds and wakes idle workers.
    pub fn close(&self) {
        self.lock_state().closed = true;
        self.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    pub fn state_of(&self, id: &str) -> Option<JobState> {
        self.lock_state().state_of(id)
    }

    pub fn counts(&self) -> JobCounts {
        let state = self.lock_state();
        let mut counts = JobCounts {
            waiting: state.waiting.len(),
            delayed: state.delayed.len(),
            active: state.active.len(),
            ..JobCounts::default()
        };
        for (_, finished) in state.finished.iter() {
            match finished {
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                _ => {}
            }
        }
        counts
    }

    /// True when nothing is waiting, delayed, or active.
    pub fn is_idle(&self) -> bool {
        let state = self.lock_state();
        state.waiting.is_empty() && state.delayed.is_empty() && state.active.is_empty()
    }

    /// Takes the next ready job and marks it active. `None` while paused.
    pub fn take_ready(&self) -> Option<Job<T>> {
        let mut state = self.lock_state();
        state.promote_due(Instant::now());
        if state.paused {
            return None;
        }
        let job = state.waiting.pop_front()?;
        state.active.insert(job.id.clone());
        Some(job)
    }

    fn next_due(&self) -> Option<Instant> {
        self.lock_state().delayed.iter().map(|d| d.due).min()
    }

    fn finish(&self, id: &str, outcome: JobState) {
        let mut state = self.lock_state();
        state.active.remove(id);
        state.finished.put(id.to_string(), outcome);
    }

    /// Records the result of an active job, scheduling a retry when allowed.
    pub fn settle(
        &self,
        job: Job<T>,
        result: Result<JobOutcome, String>,
        policy: &RetryPolicy,
    ) -> JobState {
        match result {
            Ok(JobOutcome::Completed) => {
                debug!(queue = %self.name, job_id = %job.id, "job completed");
                self.finish(&job.id, JobState::Completed);
                JobState::Completed
            }
            Ok(JobOutcome::Failed) => {
                warn!(queue = %self.name, job_id = %job.id, "job finished unsuccessfully");
                self.finish(&job.id, JobState::Failed);
                JobState::Failed
            }
            Err(err) => {
                let failures = job.attempts_made + 1;
                if failures >= policy.max_attempts {
                    error!(
                        queue = %self.name,
                        job_id = %job.id,
                        attempts = failures,
                        error = %err,
                        "job failed; attempts exhausted"
                    );
                    self.finish(&job.id, JobState::Failed);
                    return JobState::Failed;
                }
                let delay = policy.backoff_for(failures);
                warn!(
                    queue = %self.name,
                    job_id = %job.id,
                    attempt = failures,
                    error = %err,
                    ?delay,
                    "job failed; retrying"
                );
                let mut state = self.lock_state();
                state.active.remove(&job.id);
                state.schedule(
                    Job {
                        attempts_made: failures,
                        ..job
                    },
                    delay,
                );
                drop(state);
                self.wake.notify_one();
                if delay.is_zero() {
                    JobState::Waiting
                } else {
                    JobState::Delayed
                }
            }
        }
    }

    /// Runs one ready job through `processor` on the calling task.
    ///
    /// Returns the job's resulting state, or `None` if nothing was ready.
    pub async fn process_next<P>(&self, processor: &P, policy: &RetryPolicy) -> Option<JobState>
    where
        P: Processor<T> + ?Sized,
    {
        let job = self.take_ready()?;
        let result = processor.process(&job).await.map_err(|e| e.to_string());
        Some(self.settle(job, result, policy))
    }

    async fn next_job(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Job<T>> {
        loop {
            let notified = self.wake.notified();
            if let Some(job) = self.take_ready() {
                return Some(job);
            }
            if self.is_closed() {
                return None;
            }
            let wake_at = self
                .next_due()
                .unwrap_or_else(|| Instant::now() + IDLE_WAKE);
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = shutdown.changed() => return None,
            }
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> JobSink<T> for JobQueue<T> {
    async fn enqueue(&self, id: &str, data: T, options: JobOptions) -> Result<bool, QueueError> {
        self.add(id, data, options)
    }

    async fn remove(&self, id: &str) -> Result<bool, QueueError> {
        Ok(JobQueue::remove(self, id))
    }
}

/// Spawns a dispatcher that runs up to `concurrency` jobs at once.
///
/// The returned task ends once `shutdown` flips to true (or its sender is
/// dropped) and every in-flight job has settled.
pub fn spawn_workers<T, P>(
    queue: Arc<JobQueue<T>>,
    processor: Arc<P>,
    concurrency: usize,
    policy: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    P: Processor<T> + ?Sized + 'static,
{
    let concurrency = concurrency.max(1);
    tokio::spawn(async move {
        let permits = Arc::new(Semaphore::new(concurrency));
        info!(queue = %queue.name(), concurrency, "workers started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };
            let Some(job) = queue.next_job(&mut shutdown).await else {
                break;
            };
            let queue = Arc::clone(&queue);
            let processor = Arc::clone(&processor);
            tokio::spawn(async move {
                let result = processor.process(&job).await.map_err(|e| e.to_string());
                queue.settle(job, result, &policy);
                drop(permit);
            });
        }
        // Wait for in-flight jobs to settle.
        let _ = permits.acquire_many(concurrency as u32).await;
        info!(queue = %queue.name(), "workers stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::watch;

    use super::{
        spawn_workers, Job, JobOptions, JobOutcome, JobQueue, JobState, Processor, RetryPolicy,
    };

    struct FailTimes {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Processor<u32> for FailTimes {
        type Error = String;

        async fn process(&self, _job: &Job<u32>) -> Result<JobOutcome, String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(format!("failure {call}"))
            } else {
                Ok(JobOutcome::Completed)
            }
        }
    }

    #[test]
    fn backoff_doubles_per_failure() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_secs(2),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(4), Duration::from_secs(16));
    }

    #[tokio::test]
    async fn duplicate_ids_are_ignored_until_removed() {
        let queue = JobQueue::new("q");
        assert!(queue.add("a", 1_u32, JobOptions::default()).expect("add"));
        assert!(!queue.add("a", 2_u32, JobOptions::default()).expect("add"));

        let processor = FailTimes {
            failures: 0,
            calls: AtomicU32::new(0),
        };
        let state = queue.process_next(&processor, &RetryPolicy::once()).await;
        assert_eq!(state, Some(JobState::Completed));

        // Retained completed ids still deduplicate.
        assert!(!queue.add("a", 3_u32, JobOptions::default()).expect("add"));
        assert!(queue.remove("a"));
        assert!(queue.add("a", 3_u32, JobOptions::default()).expect("add"));
        assert_eq!(queue.counts().waiting, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_jobs_become_ready_after_their_delay() {
        let queue = JobQueue::new("q");
        queue
            .add("later", 1_u32, JobOptions::delayed(Duration::from_secs(12)))
            .expect("add");
        assert!(queue.take_ready().is_none());
        assert_eq!(queue.state_of("later"), Some(JobState::Delayed));

        tokio::time::advance(Duration::from_secs(12)).await;
        let job = queue.take_ready().expect("ready");
        assert_eq!(job.id, "later");
        assert_eq!(queue.state_of("later"), Some(JobState::Active));
    }

    #[tokio::test]
    async fn paused_queue_holds_jobs() {
        let queue = JobQueue::new("q");
        queue.add("a", 1_u32, JobOptions::default()).expect("add");
        queue.pause();
        assert!(queue.take_ready().is_none());
        queue.resume();
        assert!(queue.take_ready().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_jobs_retry_until_attempts_are_exhausted() {
        let queue = JobQueue::new("q");
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        };
        let processor = FailTimes {
            failures: 10,
            calls: AtomicU32::new(0),
        };
        queue.add("a", 1_u32, JobOptions::default()).expect("add");

        assert_eq!(
            queue.process_next(&processor, &policy).await,
            Some(JobState::Delayed)
        );
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            queue.process_next(&processor, &policy).await,
            Some(JobState::Delayed)
        );
        // Second retry waits twice as long.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(queue.take_ready().is_none());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            queue.process_next(&processor, &policy).await,
            Some(JobState::Failed)
        );
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.counts().failed, 1);
    }

    #[tokio::test]
    async fn closed_queue_rejects_adds() {
        let queue = JobQueue::<u32>::new("q");
        queue.close();
        assert!(queue.add("a", 1, JobOptions::default()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn workers_drain_the_queue_and_stop_on_shutdown() {
        let queue = Arc::new(JobQueue::new("q"));
        let processor = Arc::new(FailTimes {
            failures: 1,
            calls: AtomicU32::new(0),
        });
        for i in 0..5_u32 {
            queue
                .add(format!("job-{i}"), i, JobOptions::default())
                .expect("add");
        }
        let (tx, rx) = watch::channel(false);
        let handle = spawn_workers(
            Arc::clone(&queue),
            Arc::clone(&processor),
            2,
            RetryPolicy {
                max_attempts: 2,
                backoff: Duration::from_millis(100),
            },
            rx,
        );

        for _ in 0..50 {
            if queue.counts().completed == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(queue.counts().completed, 5);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 6);

        tx.send(true).expect("signal shutdown");
        handle.await.expect("dispatcher exits");
    }
}
