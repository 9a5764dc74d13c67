//! Herald batching-and-publication pipeline.
//!
//! Announcements are accumulated per type into store-resident batches,
//! closed under a distributed lock, announced as content references,
//! published to the ledger under a capacity budget, and monitored until
//! found in a finalized block.

pub mod announce;
pub mod batch;
pub mod capacity;
pub mod config;
pub mod keys;
pub mod monitor;
pub mod publish;
pub mod queue;
pub mod service;
pub mod timeout;
