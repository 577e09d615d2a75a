//! # REST Client
//!
//! ## Responsibility
//! Thin JSON-over-HTTP wrapper that routes every call through a
//! [`RequestBalancer`]: reads are cached and deduplicated per path, writes
//! invalidate the cached reads they touch.
//!
//! ## Guarantees
//! - Transport errors reach the balancer as [`RequestFailure`]s: non-2xx
//!   responses keep their status; timeouts and connection problems carry
//!   `"timeout"` / `"network"` in the message, so they are retried
//! - Cached bodies are stored as `serde_json::Value` and decoded per call,
//!   so one cached read can serve callers expecting different shapes
//!
//! ## NOT Responsible For
//! - Token refresh or any other session handling
//!
//! ## Usage
//!
//! ```no_run
//! use request_balancer::{BalancerConfig, RequestBalancer, RestClient};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Court {
//!     id: u64,
//!     name: String,
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), request_balancer::BalancerError> {
//! let client = RestClient::new("https://api.example.com", RequestBalancer::new(BalancerConfig::default()))?
//!     .with_bearer_token("secret");
//!
//! let courts: Vec<Court> = client.get_json("/courts", None).await?;
//! # Ok(()) }
//! ```

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::{BalancerError, RequestBalancer, RequestFailure};

/// Default per-attempt HTTP timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON REST client backed by a [`RequestBalancer`].
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    balancer: RequestBalancer<Value>,
}

impl RestClient {
    /// Create a client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`BalancerError::Config`] if `base_url` is not an absolute
    /// `http` or `https` URL.
    pub fn new(
        base_url: impl Into<String>,
        balancer: RequestBalancer<Value>,
    ) -> Result<Self, BalancerError> {
        let base_url = base_url.into();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(BalancerError::Config(format!(
                "base url must start with http:// or https://, got {base_url:?}"
            )));
        }

        Ok(Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            timeout: DEFAULT_TIMEOUT,
            balancer,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The balancer every call goes through.
    pub fn balancer(&self) -> &RequestBalancer<Value> {
        &self.balancer
    }

    /// Full URL for `path`.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GET `path` and decode the JSON body into `D`.
    ///
    /// `ttl` follows [`RequestBalancer::get`]: `None` for the default,
    /// `Some(Duration::ZERO)` to bypass the cache.
    ///
    /// # Errors
    ///
    /// [`BalancerError::Request`] for HTTP or transport failures,
    /// [`BalancerError::Decode`] if the body does not fit `D`.
    pub async fn get_json<D>(&self, path: &str, ttl: Option<Duration>) -> Result<D, BalancerError>
    where
        D: DeserializeOwned,
    {
        let call = self.call(Method::GET, path, None);
        let body = self.balancer.get(path, move || call.clone().send(), ttl).await?;
        decode(path, body)
    }

    /// POST `body` as JSON to `path`.
    ///
    /// # Errors
    ///
    /// Same as [`RestClient::get_json`].
    pub async fn post_json<B, D>(&self, path: &str, body: &B) -> Result<D, BalancerError>
    where
        B: Serialize + ?Sized,
        D: DeserializeOwned,
    {
        self.write(Method::POST, path, Some(encode(path, body)?)).await
    }

    /// PUT `body` as JSON to `path`.
    ///
    /// # Errors
    ///
    /// Same as [`RestClient::get_json`].
    pub async fn put_json<B, D>(&self, path: &str, body: &B) -> Result<D, BalancerError>
    where
        B: Serialize + ?Sized,
        D: DeserializeOwned,
    {
        self.write(Method::PUT, path, Some(encode(path, body)?)).await
    }

    /// PATCH `body` as JSON to `path`.
    ///
    /// # Errors
    ///
    /// Same as [`RestClient::get_json`].
    pub async fn patch_json<B, D>(&self, path: &str, body: &B) -> Result<D, BalancerError>
    where
        B: Serialize + ?Sized,
        D: DeserializeOwned,
    {
        self.write(Method::PATCH, path, Some(encode(path, body)?)).await
    }

    /// DELETE `path`, discarding any response body.
    ///
    /// # Errors
    ///
    /// [`BalancerError::Request`] for HTTP or transport failures.
    pub async fn delete(&self, path: &str) -> Result<(), BalancerError> {
        let call = self.call(Method::DELETE, path, None);
        self.balancer.mutate(path, move || call.clone().send()).await?;
        Ok(())
    }

    async fn write<D>(&self, method: Method, path: &str, body: Option<Value>) -> Result<D, BalancerError>
    where
        D: DeserializeOwned,
    {
        let call = self.call(method, path, body);
        let response = self.balancer.mutate(path, move || call.clone().send()).await?;
        decode(path, response)
    }

    fn call(&self, method: Method, path: &str, body: Option<Value>) -> Call {
        Call {
            http: self.http.clone(),
            method,
            url: self.url(path),
            token: self.token.clone(),
            timeout: self.timeout,
            body,
        }
    }
}

/// One HTTP request, replayable for retries.
#[derive(Clone)]
struct Call {
    http: reqwest::Client,
    method: Method,
    url: String,
    token: Option<String>,
    timeout: Duration,
    body: Option<Value>,
}

impl Call {
    fn send(self) -> impl Future<Output = Result<Value, RequestFailure>> + Send + 'static {
        async move {
            debug!(method = %self.method, url = %self.url, "sending request");

            let mut request = self
                .http
                .request(self.method, self.url.as_str())
                .timeout(self.timeout);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = &self.body {
                request = request.json(body);
            }

            let response = request.send().await.map_err(transport_failure)?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                let message = if text.is_empty() {
                    status.canonical_reason().unwrap_or("request failed").to_string()
                } else {
                    text
                };
                return Err(RequestFailure::status(status.as_u16(), message));
            }

            let bytes = response.bytes().await.map_err(transport_failure)?;
            if bytes.is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_slice(&bytes)
                .map_err(|e| RequestFailure::message(format!("malformed response body: {e}")))
        }
    }
}

/// Map a reqwest error onto the retry classifier's vocabulary.
fn transport_failure(err: reqwest::Error) -> RequestFailure {
    if err.is_timeout() {
        RequestFailure::message(format!("timeout: {err}"))
    } else if let Some(status) = err.status() {
        RequestFailure::status(status.as_u16(), err.to_string())
    } else {
        RequestFailure::message(format!("network error: {err}"))
    }
}

fn encode<B: Serialize + ?Sized>(path: &str, body: &B) -> Result<Value, BalancerError> {
    serde_json::to_value(body)
        .map_err(|e| BalancerError::Other(format!("could not encode body for {path}: {e}")))
}

fn decode<D: DeserializeOwned>(path: &str, body: Value) -> Result<D, BalancerError> {
    serde_json::from_value(body).map_err(|e| BalancerError::Decode(format!("{path}: {e}")))
}
