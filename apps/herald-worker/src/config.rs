use config::{Config, ConfigError, Environment, File};
use herald_chain::SimLedgerConfig;
use herald_core::{CapacityLimit, HeraldError, ProviderId};
use herald_node::config::PipelineConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    pub environment: herald_core::Environment,
    pub provider_id: u64,
    #[serde(with = "humantime_serde")]
    pub batch_interval: Duration,
    pub batch_max_count: u64,
    /// JSON form, e.g. `{"type":"percentage","value":80}`.
    pub capacity_limit: String,
    #[serde(with = "humantime_serde")]
    pub lock_expiry: Duration,
    pub stale_lock_max_rounds: u32,
    pub tx_max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub tx_backoff: Duration,
    pub blocks_per_scan: u64,
    pub seconds_per_block: u64,
    #[serde(with = "humantime_serde")]
    pub monitor_initial_delay: Duration,
    pub publish_max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub publish_backoff: Duration,
    pub queue_concurrency: usize,
    pub state_path: PathBuf,
    #[serde(with = "humantime_serde")]
    pub snapshot_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub block_interval: Duration,
    pub sim_epoch_length: u64,
    pub sim_provider_capacity: u64,
    pub sim_tx_cost: u64,
    pub sim_finality_lag: u64,
    /// Newline-delimited JSON announcements; `-` reads stdin.
    pub input: Option<String>,
}

impl WorkerConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("environment", "dev")?
            .set_default("provider_id", 1)?
            .set_default("batch_interval", "12s")?
            .set_default("batch_max_count", 1000)?
            .set_default("capacity_limit", r#"{"type":"percentage","value":80}"#)?
            .set_default("lock_expiry", "30s")?
            .set_default("stale_lock_max_rounds", 8)?
            .set_default("tx_max_attempts", 4)?
            .set_default("tx_backoff", "12s")?
            .set_default("blocks_per_scan", 100)?
            .set_default("seconds_per_block", 12)?
            .set_default("monitor_initial_delay", "12s")?
            .set_default("publish_max_attempts", 3)?
            .set_default("publish_backoff", "2s")?
            .set_default("queue_concurrency", 2)?
            .set_default("state_path", "data/herald-store.cbor")?
            .set_default("snapshot_interval", "60s")?
            .set_default("block_interval", "12s")?
            .set_default("sim_epoch_length", 100)?
            .set_default("sim_provider_capacity", 1_000_000)?
            .set_default("sim_tx_cost", 1_000)?
            .set_default("sim_finality_lag", 2)?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // Loaded into the process environment so the HERALD_ source sees it.
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("HERALD").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    /// Pipeline settings, validated.
    pub fn pipeline_config(&self) -> Result<PipelineConfig, HeraldError> {
        let config = PipelineConfig {
            environment: self.environment,
            provider_id: ProviderId(self.provider_id),
            batch_interval: self.batch_interval,
            batch_max_count: self.batch_max_count,
            capacity_limit: CapacityLimit::from_json(&self.capacity_limit)?,
            lock_expiry: self.lock_expiry,
            stale_lock_max_rounds: self.stale_lock_max_rounds,
            tx_max_attempts: self.tx_max_attempts,
            tx_backoff: self.tx_backoff,
            blocks_per_scan: self.blocks_per_scan,
            seconds_per_block: self.seconds_per_block,
            monitor_initial_delay: self.monitor_initial_delay,
            publish_max_attempts: self.publish_max_attempts,
            publish_backoff: self.publish_backoff,
            queue_concurrency: self.queue_concurrency,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn sim_ledger_config(&self) -> SimLedgerConfig {
        SimLedgerConfig {
            finality_lag: self.sim_finality_lag,
            epoch_length: self.sim_epoch_length,
            tx_cost: u128::from(self.sim_tx_cost),
        }
    }
}
