use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

use crate::services::{DispatcherConfig, ReconcilerConfig};
use crate::venue::RetryPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub venue: VenueConfig,
    #[serde(default)]
    pub reconciler: ReconcilerSettings,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    /// Venue provider name ("paper" is the only built-in)
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Reference price the paper venue starts every symbol at
    #[serde(default = "default_price")]
    pub default_price: Decimal,
    /// Maximum attempts per venue call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Retry delay cap in milliseconds
    #[serde(default = "default_retry_backoff_cap_ms")]
    pub retry_backoff_cap_ms: u64,
}

fn default_provider() -> String {
    "paper".to_string()
}

fn default_price() -> Decimal {
    Decimal::ONE_HUNDRED
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_retry_backoff_cap_ms() -> u64 {
    5_000
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            default_price: default_price(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_cap_ms: default_retry_backoff_cap_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerSettings {
    /// Run the reconciliation loop
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between polling cycles in seconds
    #[serde(default = "default_reconcile_interval")]
    pub poll_interval_secs: u64,
    /// Maximum orders polled per cycle
    #[serde(default = "default_max_orders_per_cycle")]
    pub max_orders_per_cycle: usize,
    /// Run the chain repair pass each cycle
    #[serde(default = "default_true")]
    pub repair_chains: bool,
}

fn default_true() -> bool {
    true
}

fn default_reconcile_interval() -> u64 {
    5
}

fn default_max_orders_per_cycle() -> usize {
    100
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_reconcile_interval(),
            max_orders_per_cycle: default_max_orders_per_cycle(),
            repair_chains: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherSettings {
    /// Run the notification dispatch loop
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between log polls in milliseconds
    #[serde(default = "default_dispatch_interval")]
    pub poll_interval_ms: u64,
    /// Maximum transition records consumed per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Delivery attempts per record and subscription
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay in milliseconds
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Retry delay cap in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Uniform random extra per retry delay in milliseconds
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Webhook request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_dispatch_interval() -> u64 {
    500
}

fn default_batch_size() -> usize {
    50
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_jitter_ms() -> u64 {
    100
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: default_dispatch_interval(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_ms: default_jitter_ms(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve the health endpoints
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bind address for the health server
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default file and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("trellis")
    }

    /// Load configuration from a specific file stem plus environment
    /// overrides (TRELLIS_VENUE__DEFAULT_PRICE, etc.)
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix("TRELLIS")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Venue retry policy from the venue section
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.venue.max_retries,
            base_backoff_ms: self.venue.retry_backoff_ms,
            max_backoff_ms: self.venue.retry_backoff_cap_ms,
        }
    }

    /// Reconciler service config from the reconciler section
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            poll_interval_secs: self.reconciler.poll_interval_secs,
            max_orders_per_cycle: self.reconciler.max_orders_per_cycle,
            repair_chains: self.reconciler.repair_chains,
        }
    }

    /// Dispatcher service config from the dispatcher section
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval_ms: self.dispatcher.poll_interval_ms,
            batch_size: self.dispatcher.batch_size,
            max_attempts: self.dispatcher.max_attempts,
            base_backoff_ms: self.dispatcher.base_backoff_ms,
            max_backoff_ms: self.dispatcher.max_backoff_ms,
            jitter_ms: self.dispatcher.jitter_ms,
            request_timeout_secs: self.dispatcher.request_timeout_secs,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.venue.provider != "paper" {
            errors.push(format!(
                "Unknown venue provider '{}' (built-in providers: paper)",
                self.venue.provider
            ));
        }

        if self.venue.default_price <= Decimal::ZERO {
            errors.push("venue.default_price must be positive".to_string());
        }

        if self.venue.max_retries == 0 {
            errors.push("venue.max_retries must be at least 1".to_string());
        }

        if self.reconciler.poll_interval_secs == 0 {
            errors.push("reconciler.poll_interval_secs must be at least 1".to_string());
        }

        if self.reconciler.max_orders_per_cycle == 0 {
            errors.push("reconciler.max_orders_per_cycle must be at least 1".to_string());
        }

        if self.dispatcher.batch_size == 0 {
            errors.push("dispatcher.batch_size must be at least 1".to_string());
        }

        if self.dispatcher.max_attempts == 0 {
            errors.push("dispatcher.max_attempts must be at least 1".to_string());
        }

        if self.dispatcher.base_backoff_ms > self.dispatcher.max_backoff_ms {
            errors.push("dispatcher.base_backoff_ms exceeds dispatcher.max_backoff_ms".to_string());
        }

        if self.health.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "health.bind_addr '{}' is not a valid socket address",
                self.health.bind_addr
            ));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => errors.push(format!("Unknown logging.level '{}'", other)),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
