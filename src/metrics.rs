//! Prometheus metrics for the request balancer.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`inc_request`, `inc_retry`, …) are no-ops if `init_metrics` was never
//! called, so a balancer is always safe to run and observability simply
//! degrades gracefully. Every balancer in the process reports into the same
//! registry, so the gauges hold the sum over all instances; per-instance
//! numbers come from [`RequestBalancer::metrics`].
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `balancer_requests_total` | Counter | `kind` |
//! | `balancer_cache_hits_total` | Counter | |
//! | `balancer_deduplicated_total` | Counter | |
//! | `balancer_retries_total` | Counter | |
//! | `balancer_failures_total` | Counter | `kind`, `err_type` |
//! | `balancer_request_duration_seconds` | Histogram | `kind` |
//! | `balancer_queue_depth` | Gauge | |
//! | `balancer_active_requests` | Gauge | |
//!
//! [`RequestBalancer::metrics`]: crate::RequestBalancer::metrics

use crate::BalancerError;
use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the balancer, bundled together so they can
/// be stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Requests accepted, by kind (`get` / `mutate`).
    pub requests_total: CounterVec,
    /// Reads answered from the cache.
    pub cache_hits: IntCounter,
    /// Reads that joined an in-flight request.
    pub deduplicated: IntCounter,
    /// Backoff retries performed.
    pub retries: IntCounter,
    /// Failures surfaced to callers, by kind and error type.
    pub failures_total: CounterVec,
    /// Time from dispatch to settlement, by kind.
    pub request_duration: HistogramVec,
    /// Jobs waiting for a concurrency slot.
    pub queue_depth: IntGauge,
    /// Jobs currently executing.
    pub active_requests: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn init_err(e: prometheus::Error) -> BalancerError {
    BalancerError::Other(format!("metrics init failed: {e}"))
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, c: C) -> Result<C, BalancerError> {
    registry
        .register(Box::new(c.clone()))
        .map_err(|e| BalancerError::Other(format!("metrics registration failed: {e}")))?;
    Ok(c)
}

/// Build a metrics bundle with every descriptor name prefixed by `prefix`,
/// registered in a fresh registry.
fn build(prefix: &str) -> Result<Metrics, BalancerError> {
    let registry = Registry::new();

    let requests_total = register(
        &registry,
        CounterVec::new(
            Opts::new(format!("{prefix}_requests_total"), "Requests accepted"),
            &["kind"],
        )
        .map_err(init_err)?,
    )?;
    let cache_hits = register(
        &registry,
        IntCounter::new(format!("{prefix}_cache_hits_total"), "Reads served from cache")
            .map_err(init_err)?,
    )?;
    let deduplicated = register(
        &registry,
        IntCounter::new(
            format!("{prefix}_deduplicated_total"),
            "Reads that joined an in-flight request",
        )
        .map_err(init_err)?,
    )?;
    let retries = register(
        &registry,
        IntCounter::new(format!("{prefix}_retries_total"), "Backoff retries performed")
            .map_err(init_err)?,
    )?;
    let failures_total = register(
        &registry,
        CounterVec::new(
            Opts::new(format!("{prefix}_failures_total"), "Failures surfaced to callers"),
            &["kind", "err_type"],
        )
        .map_err(init_err)?,
    )?;
    let request_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                format!("{prefix}_request_duration_seconds"),
                "Time from dispatch to settlement",
            ),
            &["kind"],
        )
        .map_err(init_err)?,
    )?;
    let queue_depth = register(
        &registry,
        IntGauge::new(format!("{prefix}_queue_depth"), "Jobs waiting for a slot")
            .map_err(init_err)?,
    )?;
    let active_requests = register(
        &registry,
        IntGauge::new(format!("{prefix}_active_requests"), "Jobs currently executing")
            .map_err(init_err)?,
    )?;

    Ok(Metrics {
        registry,
        requests_total,
        cache_hits,
        deduplicated,
        retries,
        failures_total,
        request_duration,
        queue_depth,
        active_requests,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`BalancerError::Other`] if metric construction or registry
/// registration fails.
pub fn init_metrics() -> Result<(), BalancerError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let metrics = build("balancer")?;
    // If another thread raced us, the first one wins; both bundles are identical.
    let _ = METRICS.set(metrics);
    Ok(())
}

/// Return a reference to the initialised [`Metrics`], or `None` if
/// [`init_metrics`] has not been called yet.
fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count an accepted request of `kind` (`"get"` or `"mutate"`).
pub fn inc_request(kind: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.requests_total.get_metric_with_label_values(&[kind]) {
            c.inc();
        }
    }
}

/// Count a read served from the cache.
pub fn inc_cache_hit() {
    if let Some(m) = metrics() {
        m.cache_hits.inc();
    }
}

/// Count a read that joined an in-flight request.
pub fn inc_deduplicated() {
    if let Some(m) = metrics() {
        m.deduplicated.inc();
    }
}

/// Count a backoff retry.
pub fn inc_retry() {
    if let Some(m) = metrics() {
        m.retries.inc();
    }
}

/// Count a failure surfaced to callers.
pub fn inc_failure(kind: &str, err_type: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .failures_total
            .get_metric_with_label_values(&[kind, err_type])
        {
            c.inc();
        }
    }
}

/// Record dispatch-to-settlement latency for a request of `kind`.
pub fn record_request_duration(kind: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.request_duration.get_metric_with_label_values(&[kind]) {
            h.observe(d.as_secs_f64());
        }
    }
}

impl Metrics {
    fn adjust_scheduler_gauges(&self, queue_delta: i64, active_delta: i64) {
        self.queue_depth.add(queue_delta);
        self.active_requests.add(active_delta);
    }
}

/// Move the queue-depth and active-request gauges by the given deltas.
///
/// Balancers report changes rather than absolute values, so the gauges stay
/// correct with any number of instances in the process.
pub fn adjust_scheduler_gauges(queue_delta: i64, active_delta: i64) {
    if let Some(m) = metrics() {
        m.adjust_scheduler_gauges(queue_delta, active_delta);
    }
}

/// Gather all registered metrics as a raw list of metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
