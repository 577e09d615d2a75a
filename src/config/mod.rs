//! # Balancer Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML configuration of a [`RequestBalancer`].
//! Every knob has a default, so an empty file yields the stock balancer:
//! ```text
//! max_concurrent = 6, default_ttl = 30s, max_retries = 2, base_delay = 1s, sweep at 200 entries
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `BalancerConfig`
//! - Validated: semantic constraints are checked before a config is accepted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the balancer (that belongs to `balancer::engine`)
//! - Reloading at runtime: a balancer's configuration is fixed at construction
//!
//! [`RequestBalancer`]: crate::RequestBalancer

pub mod loader;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::balancer::priority::{DEFAULT_CRITICAL_PREFIXES, DEFAULT_HIGH_PREFIXES};
use crate::balancer::{PriorityClassifier, RetryPolicy};

// ── Default value functions ──────────────────────────────────────────────

/// Default concurrency limit: 6 requests in flight.
fn default_max_concurrent() -> usize {
    6
}

/// Default cache TTL: 30 000ms.
fn default_ttl_ms() -> u64 {
    30_000
}

/// Default sweep threshold: 200 entries.
fn default_sweep_threshold() -> usize {
    200
}

/// Default retry budget: 2 retries (3 attempts).
fn default_max_retries() -> u32 {
    2
}

/// Default backoff base: 1000ms.
fn default_base_delay_ms() -> u64 {
    1000
}

fn default_critical_prefixes() -> Vec<String> {
    DEFAULT_CRITICAL_PREFIXES.iter().map(|s| s.to_string()).collect()
}

fn default_high_prefixes() -> Vec<String> {
    DEFAULT_HIGH_PREFIXES.iter().map(|s| s.to_string()).collect()
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a balancer instance.
///
/// # Example
///
/// ```toml
/// [scheduler]
/// max_concurrent = 4
///
/// [cache]
/// default_ttl_ms = 10000
///
/// [priority]
/// low_prefixes = ["/news"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BalancerConfig {
    /// Concurrency limit for dispatched requests.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Response cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Retry and backoff settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Key prefixes that select a priority band.
    #[serde(default)]
    pub priority: PriorityConfig,
    /// Logging settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl BalancerConfig {
    /// TTL applied when a read does not pass one.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.cache.default_ttl_ms)
    }

    /// Retry policy described by the `[retry]` section.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_retries,
            Duration::from_millis(self.retry.base_delay_ms),
        )
    }

    /// Classifier described by the `[priority]` section.
    pub fn classifier(&self) -> PriorityClassifier {
        PriorityClassifier::new(
            self.priority.critical_prefixes.clone(),
            self.priority.high_prefixes.clone(),
            self.priority.low_prefixes.clone(),
        )
    }
}

// ── Sections ─────────────────────────────────────────────────────────────

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of requests executing at once. Must be at least 1.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct CacheConfig {
    /// TTL (ms) for reads that do not pass one. `0` disables caching by default.
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    /// Entry count above which expired entries are swept.
    #[serde(default = "default_sweep_threshold")]
    pub sweep_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_ttl_ms(),
            sweep_threshold: default_sweep_threshold(),
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay (ms) for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

/// Priority classification prefixes. A key matches a prefix when it contains it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct PriorityConfig {
    /// Authentication prefixes (dispatched first).
    #[serde(default = "default_critical_prefixes")]
    pub critical_prefixes: Vec<String>,
    /// User, profile and role prefixes.
    #[serde(default = "default_high_prefixes")]
    pub high_prefixes: Vec<String>,
    /// Background prefixes. Empty by default.
    #[serde(default)]
    pub low_prefixes: Vec<String>,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            critical_prefixes: default_critical_prefixes(),
            high_prefixes: default_high_prefixes(),
            low_prefixes: Vec::new(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ObservabilityConfig {
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

impl LogFormat {
    /// Value understood by `LOG_FORMAT` in [`crate::init_tracing`].
    pub fn as_env_value(&self) -> &'static str {
        match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        }
    }
}

/// Export the JSON Schema for `BalancerConfig`.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(BalancerConfig);
    serde_json::to_string_pretty(&schema)
}
