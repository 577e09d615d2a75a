//! Demo binary for request-balancer
//!
//! Drives a burst of simulated API traffic through one balancer and prints
//! the resulting metrics.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -- --config balancer.toml
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (overrides the config file)
//! - `RUST_LOG=info`: log level filter

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use request_balancer::config::loader;
use request_balancer::{init_tracing, metrics, BalancerConfig, RequestBalancer, RequestFailure};
use serde_json::{json, Value};
use tracing::{info, warn};

/// Parsed CLI arguments.
struct Args {
    /// Optional TOML config file.
    config: Option<PathBuf>,
}

/// Parse command-line arguments manually (no external arg parser dependency).
fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let path = args.get(i).ok_or("--config requires a path")?;
                config = Some(PathBuf::from(path));
            }
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown argument: {other}\n\n{}", usage())),
        }
        i += 1;
    }

    Ok(Args { config })
}

fn usage() -> String {
    "usage: request-balancer [--config <path>]".to_string()
}

/// Simulated upstream: answers after a short delay, fails the first call to
/// any `/flaky` path with a 503.
fn upstream(
    path: &'static str,
    calls: Arc<AtomicU32>,
) -> impl Fn() -> futures::future::BoxFuture<'static, Result<Value, RequestFailure>> + Send + Sync + 'static {
    use futures::FutureExt;
    move || {
        let calls = calls.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if path.contains("/flaky") && n == 0 {
                return Err(RequestFailure::status(503, "service unavailable"));
            }
            Ok(json!({ "path": path, "call": n }))
        }
        .boxed()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    let config = match &args.config {
        Some(path) => loader::load_from_file(path)?,
        None => BalancerConfig::default(),
    };

    if std::env::var_os("LOG_FORMAT").is_none() {
        std::env::set_var("LOG_FORMAT", config.observability.log_format.as_env_value());
    }
    let _ = init_tracing();
    metrics::init_metrics()?;

    info!(
        max_concurrent = config.scheduler.max_concurrent,
        default_ttl_ms = config.cache.default_ttl_ms,
        "Starting request-balancer demo"
    );

    // Keep the demo snappy regardless of the configured backoff base.
    let mut config = config;
    config.retry.base_delay_ms = config.retry.base_delay_ms.min(50);
    let balancer: RequestBalancer<Value> = RequestBalancer::try_from_config(config)?;

    let paths: [&'static str; 6] = [
        "/auth/session",
        "/user/profile",
        "/api/courts",
        "/api/courts",
        "/api/bookings/flaky",
        "/api/courts",
    ];

    let mut handles = Vec::new();
    for path in paths {
        let calls = Arc::new(AtomicU32::new(0));
        let b = balancer.clone();
        handles.push(tokio::spawn(async move {
            let result = b.get(path, upstream(path, calls), None).await;
            (path, result)
        }));
    }

    for handle in handles {
        match handle.await? {
            (path, Ok(body)) => info!(path = path, body = %body, "read completed"),
            (path, Err(e)) => warn!(path = path, error = %e, "read failed"),
        }
    }

    // Served from cache.
    let _ = balancer
        .get("/api/courts", upstream("/api/courts", Arc::new(AtomicU32::new(0))), None)
        .await?;

    // A write drops the cached court list.
    balancer
        .mutate("/api/courts", || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, RequestFailure>(json!({ "saved": true }))
        })
        .await?;

    let snapshot = balancer.metrics();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    println!("{}", metrics::gather_metrics());

    Ok(())
}
