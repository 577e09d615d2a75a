//! Request balancing
//!
//! Provides the TTL response cache, in-flight deduplication, the priority
//! dispatch queue, retry with backoff, and the [`RequestBalancer`] that ties
//! them together.

pub mod cache;
pub mod dedup;
pub mod engine;
pub mod priority;
pub mod queue;
pub mod retry;

// Re-exports
pub use cache::ResponseCache;
pub use dedup::InFlightTable;
pub use engine::{BalancerMetrics, RequestBalancer};
pub use priority::{Priority, PriorityClassifier};
pub use queue::DispatchQueue;
pub use retry::RetryPolicy;
