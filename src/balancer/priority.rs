//! Request Priority
//!
//! Priority bands and the key classifier that assigns them.
//!
//! ## Usage
//!
//! ```
//! use request_balancer::balancer::{Priority, PriorityClassifier};
//!
//! let classifier = PriorityClassifier::default();
//!
//! assert_eq!(classifier.classify("/api/auth/login"), Priority::Critical);
//! assert_eq!(classifier.classify("/api/profile"), Priority::High);
//! assert_eq!(classifier.classify("/api/courts"), Priority::Normal);
//! ```

use serde::{Deserialize, Serialize};

/// Request priority levels.
///
/// Lower discriminant is dispatched first, so the derived ordering has
/// `Critical < High < Normal < Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Authentication traffic. Dispatched ahead of everything else.
    Critical = 0,
    /// User, profile and role lookups.
    High = 1,
    /// Standard priority for most requests.
    #[default]
    Normal = 2,
    /// Background work such as non-critical feeds.
    Low = 3,
}

impl Priority {
    /// Lowercase name, as used in logs and config.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// Default authentication prefixes.
pub const DEFAULT_CRITICAL_PREFIXES: &[&str] = &["/auth", "/login", "/logout", "/token", "/refresh"];

/// Default user, profile and role prefixes.
pub const DEFAULT_HIGH_PREFIXES: &[&str] = &["/user", "/profile", "/roles"];

/// Assigns a [`Priority`] to a request key from fixed prefix sets.
///
/// A prefix matches when the key contains it anywhere, so both
/// `/auth/login` and `https://host/api/auth/login` are authentication
/// traffic. Sets are checked in band order; the first match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityClassifier {
    critical: Vec<String>,
    high: Vec<String>,
    low: Vec<String>,
}

impl PriorityClassifier {
    /// Build a classifier from explicit prefix sets.
    pub fn new(critical: Vec<String>, high: Vec<String>, low: Vec<String>) -> Self {
        Self {
            critical,
            high,
            low,
        }
    }

    /// Band for `key`.
    pub fn classify(&self, key: &str) -> Priority {
        let matches = |prefixes: &[String]| prefixes.iter().any(|p| key.contains(p.as_str()));

        if matches(&self.critical) {
            Priority::Critical
        } else if matches(&self.high) {
            Priority::High
        } else if matches(&self.low) {
            Priority::Low
        } else {
            Priority::Normal
        }
    }
}

impl Default for PriorityClassifier {
    /// Default sets. No low-priority prefixes are configured, so `Low` is
    /// never assigned out of the box.
    fn default() -> Self {
        let owned = |set: &[&str]| -> Vec<String> { set.iter().map(|s| s.to_string()).collect() };
        Self::new(
            owned(DEFAULT_CRITICAL_PREFIXES),
            owned(DEFAULT_HIGH_PREFIXES),
            Vec::new(),
        )
    }
}
