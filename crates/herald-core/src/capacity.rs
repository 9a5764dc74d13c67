use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HeraldError;
use crate::types::{BlockNumber, ProviderId};

/// Ledger-reported capacity budget of a provider for the current epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityInfo {
    pub provider_id: ProviderId,
    pub current_epoch: u64,
    pub remaining_capacity: u128,
    pub total_capacity_issued: u128,
    pub next_epoch_start: BlockNumber,
    pub current_block_number: BlockNumber,
}

impl CapacityInfo {
    pub fn blocks_until_next_epoch(&self) -> u64 {
        self.next_epoch_start
            .saturating_sub(self.current_block_number)
    }
}

/// Self-imposed ceiling on capacity spent per epoch.
///
/// Serialized as `{"type":"percentage","value":80}` or
/// `{"type":"amount","value":1000000}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum CapacityLimit {
    /// Percentage (0..=100) of `total_capacity_issued`.
    Percentage(u64),
    /// Absolute amount of capacity.
    Amount(u64),
}

impl CapacityLimit {
    pub fn validate(self) -> Result<Self, HeraldError> {
        match self {
            CapacityLimit::Percentage(p) if p > 100 => Err(HeraldError::CapacityLimit(format!(
                "percentage {p} exceeds 100"
            ))),
            other => Ok(other),
        }
    }

    /// Parses and validates the JSON form used in configuration.
    pub fn from_json(raw: &str) -> Result<Self, HeraldError> {
        let limit: CapacityLimit = serde_json::from_str(raw)
            .map_err(|e| HeraldError::CapacityLimit(format!("{raw}: {e}")))?;
        limit.validate()
    }

    /// Used-capacity level at or above which publication must pause.
    pub fn threshold(self, total_capacity_issued: u128) -> u128 {
        match self {
            CapacityLimit::Percentage(p) => total_capacity_issued.saturating_mul(p as u128) / 100,
            CapacityLimit::Amount(v) => v as u128,
        }
    }
}

impl Default for CapacityLimit {
    fn default() -> Self {
        CapacityLimit::Percentage(80)
    }
}

impl FromStr for CapacityLimit {
    type Err = HeraldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_json(s)
    }
}
