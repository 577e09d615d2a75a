//! # request-balancer
//!
//! A client-side HTTP request balancer over Tokio.
//!
//! ## Architecture
//!
//! Every outbound call goes through one [`RequestBalancer`]:
//! ```text
//! get/mutate → cache → in-flight dedup → priority queue → dispatch(6) → retry → waiters
//! ```
//!
//! Reads (`get`) are cached and deduplicated per key. Writes (`mutate`)
//! invalidate every cached read sharing the key and are never deduplicated.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod balancer;
pub mod client;
pub mod config;
pub mod metrics;

// Re-exports for convenience
pub use balancer::{BalancerMetrics, Priority, PriorityClassifier, RequestBalancer, RetryPolicy};
pub use client::RestClient;
pub use config::BalancerConfig;

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=request_balancer=debug`).
///
/// # Errors
///
/// Returns [`BalancerError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Example
///
/// ```no_run
/// # use request_balancer::{init_tracing, BalancerError};
/// # fn example() -> Result<(), BalancerError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), BalancerError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| BalancerError::Other(format!("tracing init failed: {e}")))
}

/// Failure reported by a request executor.
///
/// This is the only information the retry classifier looks at: an optional
/// HTTP status and a free-form message. Transports map their native errors
/// into this shape (see [`client::RestClient`]).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", render_failure(.status, .message))]
pub struct RequestFailure {
    status: Option<u16>,
    message: String,
}

fn render_failure(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("request failed with status {code}: {message}"),
        None => format!("request failed: {message}"),
    }
}

impl RequestFailure {
    /// Statuses that indicate a transient upstream condition.
    pub const RETRYABLE_STATUSES: [u16; 3] = [429, 502, 503];

    /// Failure carrying an HTTP status code.
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            message: message.into(),
        }
    }

    /// Failure without a status (transport or decoding problem).
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// HTTP status code, if the executor received a response.
    pub fn status_code(&self) -> Option<u16> {
        self.status
    }

    /// Raw failure message.
    pub fn text(&self) -> &str {
        &self.message
    }

    /// Whether the failure is worth another attempt.
    ///
    /// True for statuses 429/502/503, or when the message contains
    /// `"network"` or `"timeout"`. The substring match is case-sensitive.
    pub fn is_retryable(&self) -> bool {
        if let Some(code) = self.status {
            if Self::RETRYABLE_STATUSES.contains(&code) {
                return true;
            }
        }
        self.message.contains("network") || self.message.contains("timeout")
    }
}

/// Top-level balancer errors.
///
/// Cloneable so a single outcome can be handed to every caller waiting on
/// the same in-flight key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BalancerError {
    /// The executor failed terminally (non-retryable, or retries exhausted).
    #[error(transparent)]
    Request(#[from] RequestFailure),

    /// The dispatched job ended without producing a result
    /// (for example the executor panicked).
    #[error("request dropped before completion")]
    Dropped,

    /// A configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A response body could not be decoded into the requested type.
    #[error("decode error: {0}")]
    Decode(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl BalancerError {
    /// The underlying executor failure, if this error carries one.
    pub fn as_request_failure(&self) -> Option<&RequestFailure> {
        match self {
            BalancerError::Request(failure) => Some(failure),
            _ => None,
        }
    }

    /// Short label used for metrics (`err_type`).
    pub fn kind(&self) -> &'static str {
        match self {
            BalancerError::Request(f) if f.is_retryable() => "transient",
            BalancerError::Request(_) => "terminal",
            BalancerError::Dropped => "dropped",
            BalancerError::Config(_) => "config",
            BalancerError::Decode(_) => "decode",
            BalancerError::Other(_) => "other",
        }
    }
}
