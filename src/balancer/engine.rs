//! # Request Balancer
//!
//! ## Responsibility
//! Mediate every outbound request: serve reads from the TTL cache, coalesce
//! concurrent reads of one key, order pending work by priority band, keep at
//! most `max_concurrent` executors running, and retry transient failures.
//!
//! ## Guarantees
//! - At most one execution per key is in flight for reads
//! - An expired cache entry is never returned
//! - Active executions never exceed `max_concurrent`
//! - Dispatch order is `(priority, arrival)`; running work is never preempted
//! - A terminal failure always reaches every caller waiting on it
//!
//! ## NOT Responsible For
//! - Performing HTTP (callers pass an executor; see `client`)
//! - Cancelling or timing out work: once queued, a job runs to completion
//!
//! ## Usage
//!
//! ```
//! use std::time::Duration;
//! use request_balancer::{BalancerConfig, RequestBalancer, RequestFailure};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), request_balancer::BalancerError> {
//! let balancer: RequestBalancer<String> = RequestBalancer::new(BalancerConfig::default());
//!
//! let courts = balancer
//!     .get("/api/courts", || async { Ok::<_, RequestFailure>("[]".to_string()) }, None)
//!     .await?;
//! assert_eq!(courts, "[]");
//!
//! // A write drops every cached read under the same key.
//! balancer
//!     .mutate("/api/courts", || async { Ok::<_, RequestFailure>(()) })
//!     .await?;
//! assert_eq!(balancer.metrics().cache_size, 0);
//! # Ok(()) }
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::cache::ResponseCache;
use super::dedup::{InFlightTable, Registration};
use super::priority::{Priority, PriorityClassifier};
use super::queue::DispatchQueue;
use super::retry::RetryPolicy;
use crate::config::{validation, BalancerConfig};
use crate::{metrics, BalancerError, RequestFailure};

/// Point-in-time view of a balancer's counters and gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BalancerMetrics {
    /// Requests accepted by `get` and `mutate`.
    pub total_requests: u64,
    /// Reads answered from the cache.
    pub cache_hits: u64,
    /// Reads that joined an in-flight request instead of dispatching.
    pub deduplicated: u64,
    /// Backoff retries performed.
    pub retries: u64,
    /// Jobs pushed onto the dispatch queue.
    pub queued: u64,
    /// Jobs executing right now.
    pub active_requests: usize,
    /// Jobs waiting for a slot right now.
    pub queue_length: usize,
    /// Cache entries right now, expired ones included until swept.
    pub cache_size: usize,
}

#[derive(Default)]
struct Counters {
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    deduplicated: AtomicU64,
    retries: AtomicU64,
    queued: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        for c in [
            &self.total_requests,
            &self.cache_hits,
            &self.deduplicated,
            &self.retries,
            &self.queued,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// Queue plus active count, always mutated together.
struct Scheduler {
    queue: DispatchQueue,
    active: usize,
}

struct Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    max_concurrent: usize,
    default_ttl: Duration,
    retry: RetryPolicy,
    classifier: PriorityClassifier,
    cache: ResponseCache<T>,
    in_flight: Arc<InFlightTable<T>>,
    scheduler: Mutex<Scheduler>,
    counters: Counters,
}

/// Client-side request balancer.
///
/// Cheap to clone; clones share the cache, queue and counters. `T` is the
/// type produced by read executors and stored in the cache.
pub struct RequestBalancer<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RequestBalancer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for RequestBalancer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(BalancerConfig::default())
    }
}

impl<T> RequestBalancer<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Build a balancer from `config` without validating it.
    ///
    /// A zero `max_concurrent` is raised to 1 so queued work can always make
    /// progress; use [`RequestBalancer::try_from_config`] to reject it instead.
    pub fn new(config: BalancerConfig) -> Self {
        let max_concurrent = config.scheduler.max_concurrent.max(1);
        Self {
            inner: Arc::new(Inner {
                max_concurrent,
                default_ttl: config.default_ttl(),
                retry: config.retry_policy(),
                classifier: config.classifier(),
                cache: ResponseCache::new(config.cache.sweep_threshold),
                in_flight: Arc::new(InFlightTable::new()),
                scheduler: Mutex::new(Scheduler {
                    queue: DispatchQueue::new(),
                    active: 0,
                }),
                counters: Counters::default(),
            }),
        }
    }

    /// Validate `config`, then build a balancer from it.
    ///
    /// # Errors
    ///
    /// Returns [`BalancerError::Config`] listing every violated constraint.
    pub fn try_from_config(config: BalancerConfig) -> Result<Self, BalancerError> {
        validation::validate(&config).map_err(|errors| {
            BalancerError::Config(
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;
        Ok(Self::new(config))
    }

    /// Cacheable, deduplicated read.
    ///
    /// `ttl` of `None` uses the configured default; `Some(Duration::ZERO)`
    /// skips caching for this call. Concurrent calls for the same key share
    /// one execution of one executor; the executors of the later callers
    /// are never invoked.
    ///
    /// # Errors
    ///
    /// [`BalancerError::Request`] with the executor's terminal failure,
    /// [`BalancerError::Dropped`] if the executor panicked, or
    /// [`BalancerError::Other`] if a miss is polled outside a Tokio runtime
    /// (nothing is registered or queued in that case).
    pub async fn get<F, Fut>(&self, key: &str, exec: F, ttl: Option<Duration>) -> Result<T, BalancerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RequestFailure>> + Send + 'static,
    {
        let inner = &self.inner;
        Counters::bump(&inner.counters.total_requests);
        metrics::inc_request("get");

        if let Some(value) = inner.cache.lookup(key) {
            Counters::bump(&inner.counters.cache_hits);
            metrics::inc_cache_hit();
            return Ok(value);
        }

        require_runtime("get")?;
        let ttl = ttl.unwrap_or(inner.default_ttl);
        let mut job = None;
        let registration = inner.in_flight.join_or_register(key, || {
            let work = Inner::read_job(inner, key, exec, ttl);
            let (deliver, rx) = deliver_to(work);
            job = Some(deliver);
            async move { rx.await.unwrap_or(Err(BalancerError::Dropped)) }
                .boxed()
                .shared()
        });

        match registration {
            Registration::Joined(shared) => {
                Counters::bump(&inner.counters.deduplicated);
                metrics::inc_deduplicated();
                debug!(key = key, "deduplicated read");
                shared.await
            }
            Registration::Registered(shared) => {
                if let Some(job) = job {
                    inner.push(inner.classifier.classify(key), job);
                }
                shared.await
            }
        }
    }

    /// Write through the queue, invalidating related cached reads first.
    ///
    /// Every key containing `key` is dropped from the cache before the write
    /// is queued. Mutations are neither cached nor deduplicated. Outside a
    /// Tokio runtime the call fails before touching the cache.
    ///
    /// # Errors
    ///
    /// Same as [`RequestBalancer::get`].
    pub async fn mutate<R, F, Fut>(&self, key: &str, exec: F) -> Result<R, BalancerError>
    where
        R: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RequestFailure>> + Send + 'static,
    {
        let inner = &self.inner;
        Counters::bump(&inner.counters.total_requests);
        metrics::inc_request("mutate");
        require_runtime("mutate")?;

        let priority = inner.classifier.classify(key);
        let removed = inner.cache.invalidate(key);
        info!(key = key, removed = removed, "mutation invalidated cached reads");

        let worker = Arc::clone(inner);
        let work = async move {
            let started = Instant::now();
            let result = worker.execute_with_retry(&exec).await;
            metrics::record_request_duration("mutate", started.elapsed());
            result.map_err(|failure| worker.surface("mutate", failure))
        };
        let (deliver, rx) = deliver_to(work);
        inner.push(priority, deliver);

        rx.await.unwrap_or(Err(BalancerError::Dropped))
    }

    /// Drop every cached read whose key starts with or contains `pattern`.
    /// Returns the number of removed entries.
    pub fn invalidate_cache(&self, pattern: &str) -> usize {
        let removed = self.inner.cache.invalidate(pattern);
        info!(pattern = pattern, removed = removed, "cache invalidated");
        removed
    }

    /// Drop every cached read.
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
        info!("cache cleared");
    }

    /// Snapshot of counters and gauges.
    pub fn metrics(&self) -> BalancerMetrics {
        let inner = &self.inner;
        let (active_requests, queue_length) = {
            let scheduler = inner.scheduler.lock();
            (scheduler.active, scheduler.queue.len())
        };
        let c = &inner.counters;
        BalancerMetrics {
            total_requests: c.total_requests.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            deduplicated: c.deduplicated.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
            active_requests,
            queue_length,
            cache_size: inner.cache.len(),
        }
    }

    /// Zero the counters. Gauges (active, queued, cache size) are live state
    /// and are left alone.
    pub fn reset_metrics(&self) {
        self.inner.counters.reset();
        info!("balancer metrics reset");
    }

    /// Start queued jobs until the queue is empty or every slot is taken.
    ///
    /// Runs automatically after each enqueue and each completion; calling it
    /// again is always safe and does nothing when there is no free slot or
    /// no waiting job.
    pub fn process_queue(&self) {
        self.inner.process_queue();
    }

    /// Jobs waiting for a slot, per priority band. Bands with nothing queued
    /// are absent.
    pub fn queue_depth_by_priority(&self) -> HashMap<Priority, usize> {
        self.inner.scheduler.lock().queue.depth_by_priority()
    }

    /// Band a request for `key` would be queued at.
    pub fn classify(&self, key: &str) -> Priority {
        self.inner.classifier.classify(key)
    }

    /// Number of reads currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Configured concurrency limit.
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The unit of work behind a registered read: execute with retries,
    /// cache on success, then release the in-flight entry.
    fn read_job<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        exec: F,
        ttl: Duration,
    ) -> impl Future<Output = Result<T, BalancerError>> + Send + 'static
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RequestFailure>> + Send + 'static,
    {
        let inner = Arc::clone(self);
        let key = key.to_string();
        // Released on completion, or when the job is dropped unrun or panics.
        let settle = self.in_flight.settle_on_drop(key.clone());

        async move {
            let started = Instant::now();
            let result = inner.execute_with_retry(&exec).await;
            metrics::record_request_duration("get", started.elapsed());

            let outcome = match result {
                Ok(value) => {
                    inner.cache.store(key, value.clone(), ttl);
                    Ok(value)
                }
                Err(failure) => Err(inner.surface("get", failure)),
            };
            drop(settle);
            outcome
        }
    }

    async fn execute_with_retry<F, Fut, V>(&self, exec: &F) -> Result<V, RequestFailure>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V, RequestFailure>>,
    {
        self.retry
            .run(exec, |_attempt, _failure, _delay| {
                Counters::bump(&self.counters.retries);
                metrics::inc_retry();
            })
            .await
    }

    fn surface(&self, kind: &str, failure: RequestFailure) -> BalancerError {
        let err = BalancerError::from(failure);
        warn!(kind = kind, error = %err, "request failed");
        metrics::inc_failure(kind, err.kind());
        err
    }

    fn push(self: &Arc<Self>, priority: Priority, job: BoxFuture<'static, ()>) {
        {
            let mut scheduler = self.scheduler.lock();
            scheduler.queue.push(priority, job);
        }
        metrics::adjust_scheduler_gauges(1, 0);
        Counters::bump(&self.counters.queued);
        self.process_queue();
    }

    fn process_queue(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("process_queue called outside a tokio runtime; dispatch deferred");
            return;
        };

        loop {
            let item = {
                let mut scheduler = self.scheduler.lock();
                if scheduler.active >= self.max_concurrent {
                    return;
                }
                let Some(item) = scheduler.queue.pop() else {
                    return;
                };
                scheduler.active += 1;
                item
            };
            metrics::adjust_scheduler_gauges(-1, 1);

            debug!(
                priority = item.priority().as_str(),
                sequence = item.sequence(),
                waited_ms = item.waited().as_millis() as u64,
                "dispatching request"
            );
            let slot = ActiveSlot {
                inner: Arc::clone(self),
            };
            runtime.spawn(async move {
                let _slot = slot;
                item.into_job().await;
            });
        }
    }
}

impl<T> Drop for Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        // Jobs still queued are dropped with the balancer; take them off the
        // shared gauge.
        let stranded = self.scheduler.get_mut().queue.len();
        if stranded > 0 {
            metrics::adjust_scheduler_gauges(-(stranded as i64), 0);
        }
    }
}

/// Fail fast when there is no Tokio runtime to dispatch onto.
fn require_runtime(kind: &str) -> Result<(), BalancerError> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Ok(());
    }
    let err = BalancerError::Other(format!("{kind} requires a tokio runtime"));
    warn!(kind = kind, error = %err, "request rejected");
    metrics::inc_failure(kind, err.kind());
    Err(err)
}

/// Occupies one concurrency slot; frees it and pulls the next job on drop,
/// including when the job panics.
struct ActiveSlot<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<T>>,
}

impl<T> Drop for ActiveSlot<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        {
            let mut scheduler = self.inner.scheduler.lock();
            scheduler.active = scheduler.active.saturating_sub(1);
        }
        metrics::adjust_scheduler_gauges(0, -1);
        self.inner.process_queue();
    }
}

/// Wrap `work` so its output is sent to the returned receiver.
fn deliver_to<R, W>(work: W) -> (BoxFuture<'static, ()>, oneshot::Receiver<R>)
where
    R: Send + 'static,
    W: Future<Output = R> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let job = async move {
        // The caller may have stopped waiting; the work still ran.
        let _ = tx.send(work.await);
    }
    .boxed();
    (job, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer() -> RequestBalancer<u32> {
        let mut config = BalancerConfig::default();
        config.retry.base_delay_ms = 1;
        RequestBalancer::new(config)
    }

    #[tokio::test]
    async fn test_get_caches_value() {
        let b = balancer();
        let first = b.get("/api/courts", || async { Ok(1) }, None).await;
        let second = b.get("/api/courts", || async { Ok(2) }, None).await;

        assert_eq!(first, Ok(1));
        assert_eq!(second, Ok(1));
        let m = b.metrics();
        assert_eq!(m.total_requests, 2);
        assert_eq!(m.cache_hits, 1);
        assert_eq!(m.queued, 1);
        assert_eq!(m.cache_size, 1);
    }

    #[tokio::test]
    async fn test_get_zero_ttl_skips_cache() {
        let b = balancer();
        let _ = b.get("/k", || async { Ok(1) }, Some(Duration::ZERO)).await;
        let again = b.get("/k", || async { Ok(2) }, Some(Duration::ZERO)).await;
        assert_eq!(again, Ok(2));
        assert_eq!(b.metrics().cache_size, 0);
    }

    #[tokio::test]
    async fn test_in_flight_entry_released_after_settle() {
        let b = balancer();
        let _ = b.get("/k", || async { Ok(1) }, None).await;
        assert_eq!(b.in_flight(), 0);

        let failed = b
            .get("/x", || async { Err(RequestFailure::status(404, "missing")) }, None)
            .await;
        assert_eq!(failed.unwrap_err().as_request_failure().and_then(|f| f.status_code()), Some(404));
        assert_eq!(b.in_flight(), 0);
        assert_eq!(b.metrics().cache_size, 1, "failures are not cached");
    }

    #[tokio::test]
    async fn test_panicking_executor_reports_dropped_and_frees_slot() {
        let b = balancer();
        let result = b
            .get(
                "/boom",
                || async {
                    if true {
                        panic!("executor bug");
                    }
                    Ok(0)
                },
                None,
            )
            .await;

        assert_eq!(result, Err(BalancerError::Dropped));
        assert_eq!(b.in_flight(), 0);
        assert_eq!(b.metrics().active_requests, 0);

        // The key is usable again.
        assert_eq!(b.get("/boom", || async { Ok(5) }, None).await, Ok(5));
    }

    #[tokio::test]
    async fn test_mutate_invalidates_and_is_not_cached() {
        let b = balancer();
        let _ = b.get("/api/courts/1", || async { Ok(1) }, None).await;
        let _ = b.get("/api/profile", || async { Ok(2) }, None).await;

        let written = b.mutate("/api/courts", || async { Ok("saved") }).await;

        assert_eq!(written, Ok("saved"));
        assert_eq!(b.metrics().cache_size, 1);
        assert_eq!(b.get("/api/courts/1", || async { Ok(9) }, None).await, Ok(9));
    }

    #[tokio::test]
    async fn test_reset_metrics_zeroes_counters_only() {
        let b = balancer();
        let _ = b.get("/k", || async { Ok(1) }, None).await;
        b.reset_metrics();

        let m = b.metrics();
        assert_eq!(m.total_requests, 0);
        assert_eq!(m.queued, 0);
        assert_eq!(m.cache_size, 1);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear_cache() {
        let b = balancer();
        let _ = b.get("/a/1", || async { Ok(1) }, None).await;
        let _ = b.get("/a/2", || async { Ok(2) }, None).await;
        let _ = b.get("/b/1", || async { Ok(3) }, None).await;

        assert_eq!(b.invalidate_cache("/a/"), 2);
        b.clear_cache();
        assert_eq!(b.metrics().cache_size, 0);
    }

    #[test]
    fn test_try_from_config_rejects_invalid() {
        let mut config = BalancerConfig::default();
        config.scheduler.max_concurrent = 0;
        let result = RequestBalancer::<u32>::try_from_config(config);
        assert!(matches!(result, Err(BalancerError::Config(_))));
    }

    #[test]
    fn test_new_raises_zero_concurrency_to_one() {
        let mut config = BalancerConfig::default();
        config.scheduler.max_concurrent = 0;
        assert_eq!(RequestBalancer::<u32>::new(config).max_concurrent(), 1);
    }

    #[test]
    fn test_get_without_runtime_fails_and_leaves_nothing_behind() {
        let b = balancer();
        let result = futures::executor::block_on(b.get("/k", || async { Ok(1) }, None));

        assert!(matches!(result, Err(BalancerError::Other(ref m)) if m.contains("tokio runtime")));
        assert_eq!(b.in_flight(), 0);
        assert_eq!(b.metrics().queue_length, 0);
        assert_eq!(b.metrics().queued, 0);
    }

    #[tokio::test]
    async fn test_key_usable_after_rejected_get_without_runtime() {
        let b = balancer();
        let outside = b.clone();
        let rejected = std::thread::spawn(move || {
            futures::executor::block_on(outside.get("/k", || async { Ok(1) }, None))
        })
        .join()
        .expect("thread");
        assert!(rejected.is_err());

        assert_eq!(b.get("/k", || async { Ok(2) }, None).await, Ok(2));
    }

    #[test]
    fn test_mutate_without_runtime_fails_before_invalidating() {
        let b = balancer();
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let cached = rt.block_on(b.get("/api/courts", || async { Ok(1) }, None));
        assert_eq!(cached, Ok(1));
        drop(rt);

        let result = futures::executor::block_on(b.mutate("/api/courts", || async { Ok(()) }));

        assert!(matches!(result, Err(BalancerError::Other(_))));
        assert_eq!(b.metrics().cache_size, 1);
        assert_eq!(b.metrics().queue_length, 0);
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_caches_forever() {
        let b = balancer();
        let first = b.get("/api/courts", || async { Ok(7) }, Some(Duration::MAX)).await;
        let second = b.get("/api/courts", || async { Ok(8) }, Some(Duration::MAX)).await;

        assert_eq!(first, Ok(7));
        assert_eq!(second, Ok(7));
        assert_eq!(b.metrics().cache_hits, 1);
    }

    #[test]
    fn test_process_queue_outside_runtime_is_noop() {
        let b = balancer();
        b.process_queue();
        assert_eq!(b.metrics(), BalancerMetrics::default());
    }

    #[test]
    fn test_metrics_serialize_to_json() {
        let json = serde_json::to_value(BalancerMetrics::default()).expect("serialize");
        for field in [
            "total_requests",
            "cache_hits",
            "deduplicated",
            "retries",
            "queued",
            "active_requests",
            "queue_length",
            "cache_size",
        ] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
    }
}
