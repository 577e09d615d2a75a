//! Request Deduplication
//!
//! Tracks reads that have been dispatched but not yet settled, so concurrent
//! callers for the same key share one execution and one outcome.
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//! use futures::FutureExt;
//! use request_balancer::balancer::dedup::{InFlightTable, Registration};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let table: Arc<InFlightTable<u32>> = Arc::new(InFlightTable::new());
//!
//! let first = table.join_or_register("/api/me", || async { Ok(7) }.boxed().shared());
//! let second = table.join_or_register("/api/me", || async { Ok(8) }.boxed().shared());
//!
//! assert!(matches!(first, Registration::Registered(_)));
//! // The second caller joins the first caller's future
//! assert_eq!(second.into_shared().await, Ok(7));
//! # }
//! ```

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use std::sync::Arc;
use tracing::debug;

use crate::BalancerError;

/// The pending outcome shared by every caller of one in-flight key.
pub type SharedResult<T> = Shared<BoxFuture<'static, Result<T, BalancerError>>>;

/// Outcome of [`InFlightTable::join_or_register`].
pub enum Registration<T> {
    /// The caller registered a new in-flight execution and owns dispatching it.
    Registered(SharedResult<T>),
    /// Another execution for the key is already pending; wait on it.
    Joined(SharedResult<T>),
}

impl<T> Registration<T> {
    /// The shared outcome, whichever way it was obtained.
    pub fn into_shared(self) -> SharedResult<T> {
        match self {
            Registration::Registered(shared) | Registration::Joined(shared) => shared,
        }
    }
}

/// Table of in-flight reads, at most one per key.
pub struct InFlightTable<T> {
    pending: DashMap<String, SharedResult<T>>,
}

impl<T> InFlightTable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Join the pending execution for `key`, or register the one built by
    /// `make` if there is none.
    ///
    /// Check and insert happen under the key's shard lock, so two callers
    /// can never both register. `make` must not touch this table.
    pub fn join_or_register<F>(&self, key: &str, make: F) -> Registration<T>
    where
        F: FnOnce() -> SharedResult<T>,
    {
        match self.pending.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                debug!(key = key, "joined in-flight request");
                Registration::Joined(existing.get().clone())
            }
            Entry::Vacant(slot) => {
                let shared = make();
                slot.insert(shared.clone());
                debug!(key = key, "registered in-flight request");
                Registration::Registered(shared)
            }
        }
    }

    /// Drop the entry for `key`.
    pub fn complete(&self, key: &str) {
        if self.pending.remove(key).is_some() {
            debug!(key = key, "in-flight request settled");
        }
    }

    /// Guard that completes `key` when dropped, panics included.
    pub fn settle_on_drop(self: &Arc<Self>, key: impl Into<String>) -> SettleGuard<T> {
        SettleGuard {
            table: Arc::clone(self),
            key: key.into(),
        }
    }

    /// Whether an execution for `key` is pending.
    pub fn contains(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Number of pending keys.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no execution is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<T> Default for InFlightTable<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes an in-flight entry when dropped.
pub struct SettleGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    table: Arc<InFlightTable<T>>,
    key: String,
}

impl<T> Drop for SettleGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.table.complete(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ready(value: u32) -> SharedResult<u32> {
        async move { Ok(value) }.boxed().shared()
    }

    #[tokio::test]
    async fn test_first_caller_registers() {
        let table = InFlightTable::new();
        match table.join_or_register("test-key", || ready(1)) {
            Registration::Registered(shared) => assert_eq!(shared.await, Ok(1)),
            Registration::Joined(_) => panic!("Expected new registration"),
        }
        assert!(table.contains("test-key"));
    }

    #[tokio::test]
    async fn test_second_caller_joins_without_building() {
        let table = InFlightTable::new();
        let built = AtomicUsize::new(0);

        let _first = table.join_or_register("k", || {
            built.fetch_add(1, Ordering::SeqCst);
            ready(1)
        });
        let second = table.join_or_register("k", || {
            built.fetch_add(1, Ordering::SeqCst);
            ready(2)
        });

        assert!(matches!(second, Registration::Joined(_)));
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(second.into_shared().await, Ok(1));
    }

    #[tokio::test]
    async fn test_joined_callers_share_failure() {
        let table: InFlightTable<u32> = InFlightTable::new();
        let failing = || async { Err(BalancerError::Dropped) }.boxed().shared();

        let a = table.join_or_register("k", failing).into_shared();
        let b = table.join_or_register("k", failing).into_shared();

        assert_eq!(a.await, Err(BalancerError::Dropped));
        assert_eq!(b.await, Err(BalancerError::Dropped));
    }

    #[test]
    fn test_complete_allows_new_registration() {
        let table = InFlightTable::new();
        let _ = table.join_or_register("k", || ready(1));
        table.complete("k");
        assert!(table.is_empty());
        assert!(matches!(
            table.join_or_register("k", || ready(2)),
            Registration::Registered(_)
        ));
    }

    #[test]
    fn test_complete_unknown_key_is_noop() {
        let table: InFlightTable<u32> = InFlightTable::new();
        table.complete("missing");
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_settle_guard_removes_on_drop() {
        let table = Arc::new(InFlightTable::new());
        let _ = table.join_or_register("k", || ready(1));
        {
            let _guard = table.settle_on_drop("k");
            assert!(table.contains("k"));
        }
        assert!(!table.contains("k"));
    }

    #[test]
    fn test_distinct_keys_are_independent() {
        let table = InFlightTable::new();
        assert!(matches!(
            table.join_or_register("a", || ready(1)),
            Registration::Registered(_)
        ));
        assert!(matches!(
            table.join_or_register("b", || ready(2)),
            Registration::Registered(_)
        ));
        assert_eq!(table.len(), 2);
    }
}
