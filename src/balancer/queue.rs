//! Dispatch Queue
//!
//! Holds work waiting for a concurrency slot, ordered by priority band and
//! arrival.
//!
//! ## Usage
//!
//! ```
//! use futures::FutureExt;
//! use request_balancer::balancer::{DispatchQueue, Priority};
//!
//! let mut queue = DispatchQueue::new();
//!
//! queue.push(Priority::Normal, async {}.boxed());
//! queue.push(Priority::Critical, async {}.boxed());
//!
//! // Critical was queued second but dispatches first
//! assert_eq!(queue.pop().map(|item| item.priority()), Some(Priority::Critical));
//! ```

use futures::future::BoxFuture;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use tracing::debug;

use super::priority::Priority;

/// A unit of queued work.
///
/// Created on every enqueue and consumed exactly once by the dispatcher.
pub struct QueueItem {
    job: BoxFuture<'static, ()>,
    priority: Priority,
    enqueued_at: Instant,
    sequence: u64, // For FIFO within same priority
}

impl QueueItem {
    /// Priority band the item was queued at.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Arrival order across the queue's lifetime.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// How long the item has been waiting.
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// Take the job out for execution.
    pub fn into_job(self) -> BoxFuture<'static, ()> {
        self.job
    }
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: the lowest band and then the earliest
        // arrival must compare greatest.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Priority queue of pending jobs.
///
/// Not synchronised on its own; the balancer keeps it behind its scheduler
/// lock together with the active-request count.
#[derive(Default)]
pub struct DispatchQueue {
    heap: BinaryHeap<QueueItem>,
    sequence: u64,
}

impl DispatchQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a job at `priority`. Never fails.
    pub fn push(&mut self, priority: Priority, job: BoxFuture<'static, ()>) -> u64 {
        self.sequence += 1;
        let sequence = self.sequence;

        self.heap.push(QueueItem {
            job,
            priority,
            enqueued_at: Instant::now(),
            sequence,
        });

        debug!(
            priority = priority.as_str(),
            sequence = sequence,
            queue_size = self.heap.len(),
            "request enqueued"
        );
        sequence
    }

    /// Pop the highest-priority, earliest-queued job.
    pub fn pop(&mut self) -> Option<QueueItem> {
        let item = self.heap.pop()?;
        debug!(
            priority = item.priority.as_str(),
            sequence = item.sequence,
            waited_ms = item.waited().as_millis() as u64,
            queue_size = self.heap.len(),
            "request dequeued"
        );
        Some(item)
    }

    /// Number of waiting jobs.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Waiting jobs per band.
    pub fn depth_by_priority(&self) -> HashMap<Priority, usize> {
        let mut depth = HashMap::new();
        for item in self.heap.iter() {
            *depth.entry(item.priority).or_insert(0) += 1;
        }
        depth
    }
}
