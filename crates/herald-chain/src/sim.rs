use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use herald_core::hash::blake3_32;
use herald_core::{BlockHash, BlockNumber, CapacityInfo, ProviderId, TxHash};
use tracing::{debug, info};

use crate::error::{ChainError, INSUFFICIENT_FEES_MARKER};
use crate::{Block, IncludedTx, Ledger, LedgerCall, LedgerEvent, Submission};

/// Tunables for [`SimLedger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimLedgerConfig {
    /// How many blocks the finalized head trails the best head.
    pub finality_lag: u64,
    /// Blocks per capacity epoch. Capacity refills at every boundary.
    pub epoch_length: u64,
    /// Capacity charged per submitted call.
    pub tx_cost: u128,
}

impl Default for SimLedgerConfig {
    fn default() -> Self {
        Self {
            finality_lag: 0,
            epoch_length: 100,
            tx_cost: 10,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ProviderAccount {
    total_issued: u128,
    remaining: u128,
}

#[derive(Debug)]
struct SimState {
    blocks: Vec<Block>,
    pool: Vec<IncludedTx>,
    providers: HashMap<ProviderId, ProviderAccount>,
    nonce: u64,
    submitted: u64,
    submit_failures: VecDeque<ChainError>,
    drop_next: usize,
    read_failures: usize,
}

impl SimState {
    fn head(&self) -> BlockNumber {
        self.blocks.len().saturating_sub(1) as BlockNumber
    }

    fn check_read(&mut self) -> Result<(), ChainError> {
        if self.read_failures > 0 {
            self.read_failures -= 1;
            return Err(ChainError::Rpc("simulated read failure".into()));
        }
        Ok(())
    }
}

fn block_hash_for(number: BlockNumber, parent: &BlockHash, txs: &[IncludedTx]) -> BlockHash {
    let mut input = Vec::with_capacity(8 + 32 + txs.len() * 32);
    input.extend_from_slice(&number.to_be_bytes());
    input.extend_from_slice(&parent.0);
    for tx in txs {
        input.extend_from_slice(&tx.hash.0);
    }
    BlockHash(blake3_32(&input))
}

fn tx_hash_for(nonce: u64, call: &LedgerCall) -> TxHash {
    let mut input = Vec::new();
    input.extend_from_slice(&nonce.to_be_bytes());
    input.extend_from_slice(&call.provider_id.0.to_be_bytes());
    input.extend_from_slice(&call.schema_id.0.to_be_bytes());
    input.extend_from_slice(call.cid.as_bytes());
    input.extend_from_slice(&call.payload_length.to_be_bytes());
    TxHash(blake3_32(&input))
}

/// In-process ledger with block production, lagging finality, and
/// per-provider capacity that refills at each epoch boundary.
///
/// Blocks are only produced when [`SimLedger::produce_block`] is called, so
/// tests control chain progress exactly.
#[derive(Debug, Clone)]
pub struct SimLedger {
    config: SimLedgerConfig,
    state: Arc<Mutex<SimState>>,
}

impl SimLedger {
    pub fn new(config: SimLedgerConfig) -> Self {
        let config = SimLedgerConfig {
            epoch_length: config.epoch_length.max(1),
            ..config
        };
        let genesis_parent = BlockHash([0; 32]);
        let genesis = Block {
            number: 0,
            hash: block_hash_for(0, &genesis_parent, &[]),
            parent: genesis_parent,
            extrinsics: Vec::new(),
        };
        Self {
            config,
            state: Arc::new(Mutex::new(SimState {
                blocks: vec![genesis],
                pool: Vec::new(),
                providers: HashMap::new(),
                nonce: 0,
                submitted: 0,
                submit_failures: VecDeque::new(),
                drop_next: 0,
                read_failures: 0,
            })),
        }
    }

    pub fn config(&self) -> SimLedgerConfig {
        self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers (or re-issues) a provider with a full epoch budget.
    pub fn add_provider(&self, provider_id: ProviderId, capacity: u128) {
        self.lock_state().providers.insert(
            provider_id,
            ProviderAccount {
                total_issued: capacity,
                remaining: capacity,
            },
        );
    }

    /// Overrides the provider's remaining capacity for the current epoch.
    pub fn set_remaining_capacity(&self, provider_id: ProviderId, remaining: u128) {
        if let Some(account) = self.lock_state().providers.get_mut(&provider_id) {
            account.remaining = remaining;
        }
    }

    /// Makes the next submission fail with `err`. Failures queue in order.
    pub fn fail_next_submit(&self, err: ChainError) {
        self.lock_state().submit_failures.push_back(err);
    }

    /// Accepts the next `count` submissions but never includes them in a block.
    pub fn drop_next_submissions(&self, count: usize) {
        self.lock_state().drop_next += count;
    }

    /// Fails the next `count` block or finality reads.
    pub fn fail_next_reads(&self, count: usize) {
        self.lock_state().read_failures += count;
    }

    pub fn head(&self) -> BlockNumber {
        self.lock_state().head()
    }

    pub fn finalized_head(&self) -> BlockNumber {
        self.lock_state().head().saturating_sub(self.config.finality_lag)
    }

    pub fn pending_len(&self) -> usize {
        self.lock_state().pool.len()
    }

    /// Total submissions accepted, dropped ones included.
    pub fn submitted_count(&self) -> u64 {
        self.lock_state().submitted
    }

    /// Block number that includes `tx_hash`, if any.
    pub fn find_tx(&self, tx_hash: &TxHash) -> Option<BlockNumber> {
        self.lock_state()
            .blocks
            .iter()
            .find(|b| b.find_tx(tx_hash).is_some())
            .map(|b| b.number)
    }

    /// Seals the pool into a new block and returns its number.
    pub fn produce_block(&self) -> BlockNumber {
        let mut state = self.lock_state();
        let number = state.head() + 1;
        let parent = state
            .blocks
            .last()
            .map(|b| b.hash)
            .unwrap_or(BlockHash([0; 32]));
        let extrinsics = std::mem::take(&mut state.pool);
        let hash = block_hash_for(number, &parent, &extrinsics);
        debug!(number, txs = extrinsics.len(), "sim block produced");
        state.blocks.push(Block {
            number,
            hash,
            parent,
            extrinsics,
        });

        if number % self.config.epoch_length == 0 {
            for account in state.providers.values_mut() {
                account.remaining = account.total_issued;
            }
            info!(
                epoch = number / self.config.epoch_length,
                "sim epoch started; capacity refilled"
            );
        }
        number
    }

    pub fn produce_blocks(&self, count: u64) -> BlockNumber {
        let mut last = self.head();
        for _ in 0..count {
            last = self.produce_block();
        }
        last
    }
}

#[async_trait]
impl Ledger for SimLedger {
    async fn block_hash(&self, number: BlockNumber) -> Result<Option<BlockHash>, ChainError> {
        let mut state = self.lock_state();
        state.check_read()?;
        Ok(state.blocks.get(number as usize).map(|b| b.hash))
    }

    async fn block(&self, hash: &BlockHash) -> Result<Option<Block>, ChainError> {
        let mut state = self.lock_state();
        state.check_read()?;
        Ok(state.blocks.iter().find(|b| &b.hash == hash).cloned())
    }

    async fn latest_finalized_block_hash(&self) -> Result<BlockHash, ChainError> {
        let finalized = self.finalized_head();
        let mut state = self.lock_state();
        state.check_read()?;
        state
            .blocks
            .get(finalized as usize)
            .map(|b| b.hash)
            .ok_or_else(|| ChainError::Rpc(format!("finalized block {finalized} missing")))
    }

    async fn latest_finalized_block_number(&self) -> Result<BlockNumber, ChainError> {
        let mut state = self.lock_state();
        state.check_read()?;
        Ok(state.head().saturating_sub(self.config.finality_lag))
    }

    async fn submit(&self, call: LedgerCall) -> Result<Submission, ChainError> {
        let mut state = self.lock_state();
        if let Some(err) = state.submit_failures.pop_front() {
            return Err(err);
        }
        let cost = self.config.tx_cost;
        let account = state
            .providers
            .get_mut(&call.provider_id)
            .ok_or(ChainError::UnknownProvider(call.provider_id))?;
        if account.remaining < cost {
            return Err(ChainError::InsufficientCapacity(format!(
                "1010: Invalid Transaction: {INSUFFICIENT_FEES_MARKER}"
            )));
        }
        account.remaining -= cost;

        state.nonce += 1;
        state.submitted += 1;
        let tx_hash = tx_hash_for(state.nonce, &call);
        let events = vec![
            LedgerEvent::CapacityWithdrawn {
                provider_id: call.provider_id,
                amount: cost,
            },
            LedgerEvent::MessagesStored {
                schema_id: call.schema_id,
                block_number: state.head() + 1,
            },
        ];

        if state.drop_next > 0 {
            state.drop_next -= 1;
            debug!(tx_hash = %tx_hash, "sim dropping submitted tx");
        } else {
            state.pool.push(IncludedTx {
                hash: tx_hash,
                events: events.clone(),
            });
        }
        Ok(Submission { tx_hash, events })
    }

    async fn capacity_info(&self, provider_id: ProviderId) -> Result<CapacityInfo, ChainError> {
        let mut state = self.lock_state();
        state.check_read()?;
        let head = state.head();
        let account = state
            .providers
            .get(&provider_id)
            .ok_or(ChainError::UnknownProvider(provider_id))?;
        let epoch = head / self.config.epoch_length;
        Ok(CapacityInfo {
            provider_id,
            current_epoch: epoch,
            remaining_capacity: account.remaining,
            total_capacity_issued: account.total_issued,
            next_epoch_start: (epoch + 1) * self.config.epoch_length,
            current_block_number: head,
        })
    }
}
