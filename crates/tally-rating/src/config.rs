//! Rating service configuration
//!
//! Layered, lowest precedence first: built-in defaults, an optional
//! `tally.{toml,yaml,json}` file, `TALLY_*` environment variables (nested
//! keys separated by `__`, e.g. `TALLY_LOCK__TIMEOUT_MS=500`), and finally
//! `PORT`. A `.env` file is loaded into the environment first.

use crate::batch::BatchConfig;
use crate::resilience::{CircuitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tally_common::{Result, TallyError, DEFAULT_PRICING_COUNTRY};

/// Rating service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RatingConfig {
    pub server: ServerSettings,
    pub batch: BatchSettings,
    pub lock: LockSettings,
    pub account: AccountSettings,
    pub storage: StorageSettings,
    pub cache: CacheSettings,
    pub retry: RetrySettings,
    pub circuit: CircuitSettings,
    pub pricing: PricingSettings,
}

impl RatingConfig {
    /// Load configuration from `.env`, an optional file and the environment
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let settings = config::Config::builder()
            .add_source(config::File::with_name("tally").required(false))
            .add_source(
                config::Environment::with_prefix("TALLY")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| TallyError::Config(format!("Failed to load configuration: {}", e)))?;

        let mut cfg: Self = settings
            .try_deserialize()
            .map_err(|e| TallyError::Config(format!("Invalid configuration: {}", e)))?;

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(p) = port.parse::<u16>() {
                cfg.server.port = p;
            }
        }

        Ok(cfg)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9410,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub max_batch_size: usize,
    pub flush_interval_ms: u64,
    pub channel_buffer: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        let defaults = BatchConfig::default();
        Self {
            max_batch_size: defaults.max_batch_size,
            flush_interval_ms: defaults.flush_interval.as_millis() as u64,
            channel_buffer: defaults.channel_buffer,
        }
    }
}

impl BatchSettings {
    pub fn to_batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.max_batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            channel_buffer: self.channel_buffer,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Bounded wait for a state key lock
    pub timeout_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

impl LockSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountSettings {
    /// Account service base URL; without one every organization is priced in
    /// the fallback country
    pub base_url: Option<String>,
    pub fallback_country: String,
    pub request_timeout_ms: u64,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            fallback_country: DEFAULT_PRICING_COUNTRY.to_string(),
            request_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    EventStore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub eventstore_url: String,
    pub stream_prefix: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            eventstore_url: "esdb://localhost:2113?tls=false".to_string(),
            stream_prefix: "tally".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub backend: CacheBackend,
    pub redis_url: String,
    pub key_prefix: String,
    pub ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "tally:rating".to_string(),
            ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_retries: defaults.max_retries,
            initial_backoff_ms: defaults.initial_backoff.as_millis() as u64,
            max_backoff_ms: defaults.max_backoff.as_millis() as u64,
            backoff_multiplier: defaults.backoff_multiplier,
            jitter_factor: defaults.jitter_factor,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter_factor: self.jitter_factor.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_allowed_calls: u32,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        let defaults = CircuitConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            reset_timeout_ms: defaults.reset_timeout.as_millis() as u64,
            half_open_allowed_calls: defaults.half_open_allowed_calls,
        }
    }
}

impl CircuitSettings {
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
            half_open_allowed_calls: self.half_open_allowed_calls.max(1),
        }
    }
}

/// Locations of the externally supplied metric and price configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingSettings {
    /// JSON list of `{resource_id, metrics: [{name, rate}]}`
    pub resources_path: Option<String>,
    /// JSON list of `{resource_id, plans: [{plan_id, metrics: [{name, prices}]}]}`
    pub prices_path: Option<String>,
}
