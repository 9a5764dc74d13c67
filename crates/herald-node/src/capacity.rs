//! Capacity gate for the publish queue.
//!
//! The controller is a two-state machine (`Normal`/`Exhausted`) re-evaluated
//! from ledger and store state after every publish attempt, once at startup,
//! and by a single recheck timer armed for the next epoch boundary.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use herald_chain::{ChainError, Ledger};
use herald_core::{CapacityInfo, CapacityLimit, ProviderId, PublisherJob};
use herald_store::{Store, StoreError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::keys::epoch_capacity_key;
use crate::queue::JobQueue;
use crate::timeout::TimeoutScheduler;

#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityState {
    Normal,
    Exhausted,
}

/// Whether publication must pause given ledger capacity and local usage.
pub fn is_out_of_capacity(info: &CapacityInfo, used: u128, limit: CapacityLimit) -> bool {
    if info.remaining_capacity == 0 {
        return true;
    }
    used >= limit.threshold(info.total_capacity_issued)
}

pub struct CapacityController {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn Store>,
    publish_queue: Arc<JobQueue<PublisherJob>>,
    provider_id: ProviderId,
    limit: CapacityLimit,
    seconds_per_block: u64,
    gate: Mutex<Gate>,
    recheck: TimeoutScheduler<()>,
}

#[derive(Debug)]
struct Gate {
    state: CapacityState,
    /// Epoch in which the ledger refused a submission for fees.
    fee_refused_epoch: Option<u64>,
}

impl CapacityController {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn Store>,
        publish_queue: Arc<JobQueue<PublisherJob>>,
        provider_id: ProviderId,
        limit: CapacityLimit,
        seconds_per_block: u64,
    ) -> Self {
        Self {
            ledger,
            store,
            publish_queue,
            provider_id,
            limit,
            seconds_per_block,
            gate: Mutex::new(Gate {
                state: CapacityState::Normal,
                fee_refused_epoch: None,
            }),
            recheck: TimeoutScheduler::new(),
        }
    }

    fn lock_gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CapacityState {
        self.lock_gate().state
    }

    pub fn recheck_armed(&self) -> bool {
        self.recheck.is_armed(&())
    }

    pub fn cancel_recheck(&self) {
        self.recheck.cancel(&());
    }

    /// Capacity this service has recorded for `epoch`.
    pub async fn used_capacity(&self, epoch: u64) -> Result<u128, CapacityError> {
        let key = epoch_capacity_key(epoch);
        match self.store.get(&key).await? {
            Some(raw) => raw
                .parse::<u128>()
                .map_err(|_| CapacityError::Store(StoreError::NotAnInteger(key))),
            None => Ok(0),
        }
    }

    /// Reads ledger and store state and drives the pause/resume decision.
    pub async fn check_capacity(self: &Arc<Self>) -> Result<CapacityState, CapacityError> {
        let info = self.ledger.capacity_info(self.provider_id).await?;
        let used = self.used_capacity(info.current_epoch).await?;
        let threshold = self.limit.threshold(info.total_capacity_issued);
        debug!(
            epoch = info.current_epoch,
            remaining = %info.remaining_capacity,
            used = %used,
            threshold = %threshold,
            "capacity checked"
        );
        // A fee refusal holds until the epoch turns over.
        let refused = {
            let mut gate = self.lock_gate();
            match gate.fee_refused_epoch {
                Some(epoch) if epoch == info.current_epoch => true,
                Some(_) => {
                    gate.fee_refused_epoch = None;
                    false
                }
                None => false,
            }
        };
        if refused || is_out_of_capacity(&info, used, self.limit) {
            self.exhausted(&info);
            Ok(CapacityState::Exhausted)
        } else {
            self.refilled();
            Ok(CapacityState::Normal)
        }
    }

    /// Pauses publication after the ledger refused a submission for fees.
    pub async fn signal_exhausted(self: &Arc<Self>) -> Result<(), CapacityError> {
        let info = self.ledger.capacity_info(self.provider_id).await?;
        self.lock_gate().fee_refused_epoch = Some(info.current_epoch);
        self.exhausted(&info);
        Ok(())
    }

    /// Adds `amount` to the usage counter of the epoch `at` was read in and
    /// expires the counter at that epoch's boundary.
    pub async fn record_usage(
        &self,
        at: &CapacityInfo,
        amount: u128,
    ) -> Result<u128, CapacityError> {
        let key = epoch_capacity_key(at.current_epoch);
        let total = self.store.incr_by(&key, amount).await?;
        self.store.expire(&key, self.until_next_epoch(at)).await?;
        debug!(epoch = at.current_epoch, amount = %amount, total = %total, "capacity usage recorded");
        Ok(total)
    }

    fn until_next_epoch(&self, info: &CapacityInfo) -> Duration {
        let blocks = info.blocks_until_next_epoch().max(1);
        Duration::from_secs(blocks.saturating_mul(self.seconds_per_block))
    }

    fn exhausted(self: &Arc<Self>, info: &CapacityInfo) {
        self.transition(CapacityState::Exhausted);
        self.publish_queue.pause();
        let delay = self.until_next_epoch(info);
        if self
            .recheck
            .arm_if_absent((), delay, recheck(Arc::clone(self)))
        {
            info!(?delay, next_epoch_start = info.next_epoch_start, "capacity recheck scheduled");
        }
    }

    fn refilled(&self) {
        self.transition(CapacityState::Normal);
        self.publish_queue.resume();
        self.recheck.cancel(&());
    }

    fn transition(&self, next: CapacityState) {
        let mut gate = self.lock_gate();
        if gate.state != next {
            match next {
                CapacityState::Exhausted => warn!("capacity exhausted; pausing publication"),
                CapacityState::Normal => info!("capacity available; resuming publication"),
            }
            gate.state = next;
        }
    }
}

fn recheck(controller: Arc<CapacityController>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if let Err(err) = controller.check_capacity().await {
            warn!(error = %err, "capacity recheck failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use herald_chain::{Ledger, SimLedger, SimLedgerConfig};
    use herald_core::{CapacityInfo, CapacityLimit, ProviderId, PublisherJob};
    use herald_store::{MemoryStore, Store};

    use super::{is_out_of_capacity, CapacityController, CapacityState};
    use crate::queue::JobQueue;

    const PROVIDER: ProviderId = ProviderId(1);

    fn info(remaining: u128, total: u128) -> CapacityInfo {
        CapacityInfo {
            provider_id: PROVIDER,
            current_epoch: 1,
            remaining_capacity: remaining,
            total_capacity_issued: total,
            next_epoch_start: 200,
            current_block_number: 150,
        }
    }

    #[test]
    fn zero_remaining_is_always_exhausted() {
        for limit in [CapacityLimit::Percentage(100), CapacityLimit::Amount(u64::MAX)] {
            assert!(is_out_of_capacity(&info(0, 1000), 0, limit));
        }
    }

    #[test]
    fn percentage_threshold_boundary() {
        let limit = CapacityLimit::Percentage(50);
        assert!(is_out_of_capacity(&info(1000, 1000), 500, limit));
        assert!(!is_out_of_capacity(&info(1000, 1000), 499, limit));
    }

    #[test]
    fn amount_threshold_boundary() {
        let limit = CapacityLimit::Amount(300);
        assert!(is_out_of_capacity(&info(1000, 1000), 300, limit));
        assert!(!is_out_of_capacity(&info(1000, 1000), 299, limit));
    }

    struct Fixture {
        ledger: SimLedger,
        store: Arc<MemoryStore>,
        publish: Arc<JobQueue<PublisherJob>>,
        controller: Arc<CapacityController>,
    }

    fn fixture(limit: CapacityLimit) -> Fixture {
        let ledger = SimLedger::new(SimLedgerConfig {
            epoch_length: 10,
            tx_cost: 100,
            ..SimLedgerConfig::default()
        });
        ledger.add_provider(PROVIDER, 1000);
        let store = Arc::new(MemoryStore::new());
        let publish = Arc::new(JobQueue::new("publishQueue"));
        let controller = Arc::new(CapacityController::new(
            Arc::new(ledger.clone()),
            store.clone(),
            publish.clone(),
            PROVIDER,
            limit,
            12,
        ));
        Fixture {
            ledger,
            store,
            publish,
            controller,
        }
    }

    impl Fixture {
        async fn record(&self, amount: u128) -> u128 {
            let at = self
                .ledger
                .capacity_info(PROVIDER)
                .await
                .expect("capacity info");
            self.controller
                .record_usage(&at, amount)
                .await
                .expect("record")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_pauses_and_refill_resumes() {
        let fx = fixture(CapacityLimit::Percentage(50));
        assert_eq!(
            fx.controller.check_capacity().await.expect("check"),
            CapacityState::Normal
        );

        fx.record(500).await;
        assert_eq!(
            fx.controller.check_capacity().await.expect("check"),
            CapacityState::Exhausted
        );
        assert!(fx.publish.is_paused());
        assert!(fx.controller.recheck_armed());

        // Redundant exhaustion keeps the single timer.
        fx.controller.signal_exhausted().await.expect("signal");
        assert!(fx.controller.recheck_armed());

        // Next epoch: the counter key changes, so usage reads as zero.
        fx.ledger.produce_blocks(10);
        assert_eq!(
            fx.controller.check_capacity().await.expect("check"),
            CapacityState::Normal
        );
        assert!(!fx.publish.is_paused());
        assert!(!fx.controller.recheck_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn recheck_fires_at_epoch_boundary() {
        let fx = fixture(CapacityLimit::Amount(1_000_000));
        fx.ledger.set_remaining_capacity(PROVIDER, 0);
        fx.ledger.produce_blocks(4);
        fx.controller.check_capacity().await.expect("check");
        assert_eq!(fx.controller.state(), CapacityState::Exhausted);

        // Six blocks remain in the epoch; refill happens at block 10.
        fx.ledger.produce_blocks(6);
        tokio::time::sleep(Duration::from_secs(6 * 12 + 1)).await;
        assert_eq!(fx.controller.state(), CapacityState::Normal);
        assert!(!fx.publish.is_paused());
    }

    #[tokio::test]
    async fn usage_counter_accumulates_with_expiry() {
        let fx = fixture(CapacityLimit::Percentage(80));
        fx.record(40).await;
        assert_eq!(fx.record(2).await, 42);
        assert_eq!(
            fx.store.get("epochCapacity:0").await.expect("get").as_deref(),
            Some("42")
        );
        assert_eq!(fx.controller.used_capacity(0).await.expect("used"), 42);
    }

    #[tokio::test]
    async fn usage_is_charged_to_the_epoch_it_was_read_in() {
        let fx = fixture(CapacityLimit::Percentage(80));
        fx.ledger.produce_blocks(9);
        let at_submit = fx.ledger.capacity_info(PROVIDER).await.expect("info");
        assert_eq!(at_submit.current_epoch, 0);

        // The epoch turns over before the usage is written.
        fx.ledger.produce_block();
        fx.controller
            .record_usage(&at_submit, 100)
            .await
            .expect("record");
        assert_eq!(fx.controller.used_capacity(0).await.expect("used"), 100);
        assert_eq!(fx.controller.used_capacity(1).await.expect("used"), 0);
    }
}
