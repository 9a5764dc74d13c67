//! Core herald primitives shared across crates.
//!
//! Includes announcement/queue identifiers, batch and job records, the
//! capacity model, the schema table, hash/clock helpers, and base errors.

pub mod announcement;
pub mod capacity;
pub mod error;
pub mod hash;
pub mod jobs;
pub mod schema;
pub mod time;
pub mod types;

pub use announcement::Announcement;
pub use capacity::{CapacityInfo, CapacityLimit};
pub use error::HeraldError;
pub use jobs::{BatchAnnouncerJob, BatchMetadata, PayloadRef, PublisherJob, TxMonitorJob};
pub use schema::SchemaRegistry;
pub use types::{
    AnnouncementType, BatchId, BlockHash, BlockNumber, Environment, ProviderId, SchemaId, TxHash,
};
