use std::time::Duration;

use herald_core::{CapacityLimit, Environment, HeraldError, ProviderId};

use crate::queue::RetryPolicy;

/// Default ledger block time.
pub const DEFAULT_SECONDS_PER_BLOCK: u64 = 12;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Selects the schema table used when closing batches.
    pub environment: Environment,
    /// Provider paying for submissions.
    pub provider_id: ProviderId,
    /// Maximum time a batch stays open before a timed close.
    pub batch_interval: Duration,
    /// Row count that triggers an immediate close.
    pub batch_max_count: u64,
    /// Self-imposed per-epoch capacity ceiling.
    pub capacity_limit: CapacityLimit,
    /// How long a batch lock is honoured before it may be taken over.
    pub lock_expiry: Duration,
    /// Upper bound on stale-lock takeovers chained by one close call.
    pub stale_lock_max_rounds: u32,
    /// Confirmation attempts before the publish job is re-enqueued.
    pub tx_max_attempts: u32,
    /// Base backoff between confirmation attempts.
    pub tx_backoff: Duration,
    /// Maximum blocks scanned per confirmation attempt.
    pub blocks_per_scan: u64,
    pub seconds_per_block: u64,
    /// Delay before the first confirmation attempt.
    pub monitor_initial_delay: Duration,
    /// Attempts for intake, announce, and publish jobs.
    pub publish_max_attempts: u32,
    pub publish_backoff: Duration,
    /// Worker concurrency per queue.
    pub queue_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Dev,
            provider_id: ProviderId(1),
            batch_interval: Duration::from_secs(12),
            batch_max_count: 1000,
            capacity_limit: CapacityLimit::default(),
            lock_expiry: Duration::from_secs(30),
            stale_lock_max_rounds: 8,
            tx_max_attempts: 4,
            tx_backoff: Duration::from_secs(DEFAULT_SECONDS_PER_BLOCK),
            blocks_per_scan: 100,
            seconds_per_block: DEFAULT_SECONDS_PER_BLOCK,
            monitor_initial_delay: Duration::from_secs(DEFAULT_SECONDS_PER_BLOCK),
            publish_max_attempts: 3,
            publish_backoff: Duration::from_secs(2),
            queue_concurrency: 2,
        }
    }
}

impl PipelineConfig {
    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), HeraldError> {
        self.capacity_limit.validate()?;
        if self.batch_max_count == 0 {
            return Err(HeraldError::InvalidInput(
                "batch_max_count must be at least 1".into(),
            ));
        }
        if self.batch_interval.is_zero() {
            return Err(HeraldError::InvalidInput(
                "batch_interval must be positive".into(),
            ));
        }
        if self.tx_max_attempts == 0 {
            return Err(HeraldError::InvalidInput(
                "tx_max_attempts must be at least 1".into(),
            ));
        }
        if self.blocks_per_scan == 0 {
            return Err(HeraldError::InvalidInput(
                "blocks_per_scan must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Wall-clock duration of one block.
    pub fn block_time(&self) -> Duration {
        Duration::from_secs(self.seconds_per_block)
    }

    /// Wall-clock duration of `blocks` blocks.
    pub fn blocks_to_duration(&self, blocks: u64) -> Duration {
        Duration::from_secs(blocks.saturating_mul(self.seconds_per_block))
    }

    /// Retry policy for the confirmation queue.
    pub fn monitor_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.tx_max_attempts,
            backoff: self.tx_backoff,
        }
    }

    /// Retry policy for intake, announce, and publish queues.
    pub fn job_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.publish_max_attempts.max(1),
            backoff: self.publish_backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use herald_core::CapacityLimit;

    use super::PipelineConfig;

    #[test]
    fn defaults_validate() {
        PipelineConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases = [
            PipelineConfig {
                batch_max_count: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                batch_interval: Duration::ZERO,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                capacity_limit: CapacityLimit::Percentage(101),
                ..PipelineConfig::default()
            },
            PipelineConfig {
                blocks_per_scan: 0,
                ..PipelineConfig::default()
            },
        ];
        for cfg in cases {
            assert!(cfg.validate().is_err(), "{cfg:?}");
        }
    }

    #[test]
    fn retry_policies_reflect_config_fields() {
        let cfg = PipelineConfig {
            tx_max_attempts: 6,
            tx_backoff: Duration::from_secs(3),
            publish_max_attempts: 2,
            publish_backoff: Duration::from_millis(250),
            ..PipelineConfig::default()
        };
        let monitor = cfg.monitor_retry_policy();
        assert_eq!(monitor.max_attempts, 6);
        assert_eq!(monitor.backoff, Duration::from_secs(3));
        let jobs = cfg.job_retry_policy();
        assert_eq!(jobs.max_attempts, 2);
        assert_eq!(jobs.backoff, Duration::from_millis(250));
    }

    #[test]
    fn block_durations_use_seconds_per_block() {
        let cfg = PipelineConfig {
            seconds_per_block: 6,
            ..PipelineConfig::default()
        };
        assert_eq!(cfg.block_time(), Duration::from_secs(6));
        assert_eq!(cfg.blocks_to_duration(10), Duration::from_secs(60));
    }
}
