use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::transfer::consumer::ConsumerConfig;
use crate::transfer::error::TransferError;
use crate::transfer::orchestrator::RetryPolicy;
use crate::transfer::reconciler::ReconcilerConfig as ReconcilerSettings;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL; `DATABASE_URL` overrides it
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Optional CSV journal of transfer outcomes
    #[serde(default)]
    pub audit_file: Option<String>,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

fn default_max_connections() -> u32 {
    20
}

/// Consumer pool and execution limits
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    pub consumers: usize,
    /// Apply attempts per delivery on version conflicts
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Upper bound for any single ledger/store call
    pub op_timeout_ms: u64,
    /// Idle poll interval of the PostgreSQL queue
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumers: 4,
            max_attempts: 5,
            backoff_base_ms: 10,
            backoff_cap_ms: 500,
            op_timeout_ms: 5_000,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    pub scan_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub batch_size: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_secs: 30,
            stale_threshold_secs: 60,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub visibility_timeout_secs: u64,
    pub max_deliveries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "transfers".to_string(),
            visibility_timeout_secs: 30,
            max_deliveries: 10,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, TransferError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|e| {
            TransferError::Config(format!("failed to read {}: {}", config_path, e))
        })?;
        let mut config = Self::from_yaml(&content)?;
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.postgres_url = Some(url);
        }
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, TransferError> {
        serde_yaml::from_str(content)
            .map_err(|e| TransferError::Config(format!("failed to parse config yaml: {}", e)))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.worker.max_attempts.max(1),
            backoff_base: Duration::from_millis(self.worker.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.worker.backoff_cap_ms),
        }
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.worker.op_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.visibility_timeout_secs)
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            max_deliveries: self.queue.max_deliveries,
            ..ConsumerConfig::default()
        }
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            scan_interval: Duration::from_secs(self.reconciler.scan_interval_secs),
            stale_threshold: Duration::from_secs(self.reconciler.stale_threshold_secs),
            batch_size: self.reconciler.batch_size,
        }
    }
}
