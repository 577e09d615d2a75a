//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`BalancerConfig`] that the
//! type system cannot express (range checks, non-empty prefixes).
//!
//! ## Guarantees
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value

use super::BalancerConfig;

/// Longest accepted backoff base, in milliseconds.
pub const MAX_BASE_DELAY_MS: u64 = 60_000;

/// Largest accepted retry budget.
pub const MAX_RETRIES: u32 = 10;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "retry.base_delay_ms").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl From<ConfigError> for crate::BalancerError {
    fn from(err: ConfigError) -> Self {
        crate::BalancerError::Config(err.to_string())
    }
}

/// Validate all semantic constraints on a [`BalancerConfig`].
///
/// # Errors
///
/// Returns every violation found, in field order.
pub fn validate(config: &BalancerConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Scheduler ────────────────────────────────────────────────────
    if config.scheduler.max_concurrent == 0 {
        errors.push(ConfigError::InvalidField {
            field: "scheduler.max_concurrent".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    // ── Cache ────────────────────────────────────────────────────────
    if config.cache.sweep_threshold == 0 {
        errors.push(ConfigError::InvalidField {
            field: "cache.sweep_threshold".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    // ── Retry ────────────────────────────────────────────────────────
    if config.retry.max_retries > MAX_RETRIES {
        errors.push(ConfigError::InvalidField {
            field: "retry.max_retries".into(),
            value: config.retry.max_retries.to_string(),
            reason: format!("must be \u{2264} {MAX_RETRIES}"),
        });
    }

    if config.retry.base_delay_ms > MAX_BASE_DELAY_MS {
        errors.push(ConfigError::InvalidField {
            field: "retry.base_delay_ms".into(),
            value: config.retry.base_delay_ms.to_string(),
            reason: format!("must be \u{2264} {MAX_BASE_DELAY_MS}"),
        });
    }

    // ── Priority ─────────────────────────────────────────────────────
    let sets = [
        ("priority.critical_prefixes", &config.priority.critical_prefixes),
        ("priority.high_prefixes", &config.priority.high_prefixes),
        ("priority.low_prefixes", &config.priority.low_prefixes),
    ];
    for (field, prefixes) in sets {
        if let Some(index) = prefixes.iter().position(|p| p.is_empty()) {
            errors.push(ConfigError::InvalidField {
                field: format!("{field}[{index}]"),
                value: "\"\"".into(),
                reason: "empty prefix would match every key".into(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
