//! Integration tests for `RestClient` against a mocked HTTP backend.
//!
//! Covers:
//! - GET caching and dedup through the balancer
//! - Bearer token propagation
//! - Status mapping (terminal 4xx, retried 503)
//! - Timeout and connection failures mapped to retryable messages
//! - Writes invalidating cached reads

use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use request_balancer::{BalancerConfig, BalancerError, RequestBalancer, RestClient};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Court {
    id: u64,
    name: String,
}

// ============================================================================
// Helpers
// ============================================================================

fn fast_balancer() -> RequestBalancer<Value> {
    let mut config = BalancerConfig::default();
    config.retry.base_delay_ms = 1;
    RequestBalancer::new(config)
}

fn client_for(server: &MockServer) -> RestClient {
    RestClient::new(server.uri(), fast_balancer()).expect("mock server uri is absolute")
}

fn courts_body() -> Value {
    json!([{"id": 1, "name": "Centre"}, {"id": 2, "name": "Annex"}])
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test]
async fn test_get_json_decodes_and_caches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/courts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(courts_body()))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let first: Vec<Court> = client.get_json("/api/courts", None).await.expect("first read");
    let second: Vec<Court> = client.get_json("/api/courts", None).await.expect("cached read");

    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
    assert_eq!(client.balancer().metrics().cache_hits, 1);
}

#[tokio::test]
async fn test_concurrent_get_json_hits_backend_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/profile"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": 7, "name": "Sam"}))
                .set_delay(Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let reads = (0..5).map(|_| client.get_json::<Court>("/user/profile", None));
    let results = join_all(reads).await;

    assert!(results.iter().all(|r| r.as_ref().map(|c| c.id) == Ok(7)));
    assert_eq!(client.balancer().metrics().deduplicated, 4);
}

#[tokio::test]
async fn test_get_json_zero_ttl_bypasses_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/live"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server);
    for _ in 0..2 {
        let _: Value = client
            .get_json("/api/live", Some(Duration::ZERO))
            .await
            .expect("live read");
    }
}

#[tokio::test]
async fn test_bearer_token_is_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/me"))
        .and(header("authorization", "Bearer s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1, "name": "Me"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).with_bearer_token("s3cret");
    let me: Court = client.get_json("/api/me", None).await.expect("authorized read");
    assert_eq!(me.name, "Me");
}

#[tokio::test]
async fn test_shape_mismatch_is_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/courts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"unexpected": true})))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let result = client.get_json::<Vec<Court>>("/api/courts", None).await;
    assert!(matches!(result, Err(BalancerError::Decode(_))));
}

// ============================================================================
// Failure mapping
// ============================================================================

#[tokio::test]
async fn test_404_is_terminal_and_keeps_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/courts/99"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such court"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .get_json::<Court>("/api/courts/99", None)
        .await
        .expect_err("404 must fail");

    let failure = err.as_request_failure().expect("request failure");
    assert_eq!(failure.status_code(), Some(404));
    assert_eq!(failure.text(), "no such court");
    assert_eq!(client.balancer().metrics().retries, 0);
}

#[tokio::test]
async fn test_503_is_retried_until_budget_spent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/courts"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .get_json::<Value>("/api/courts", None)
        .await
        .expect_err("503 forever must fail");

    let failure = err.as_request_failure().expect("request failure");
    assert_eq!(failure.status_code(), Some(503));
    assert_eq!(failure.text(), "Service Unavailable");
    assert_eq!(client.balancer().metrics().retries, 2);
}

#[tokio::test]
async fn test_timeout_maps_to_retryable_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let client = client_for(&server).with_timeout(Duration::from_millis(50));
    let err = client
        .get_json::<Value>("/api/slow", None)
        .await
        .expect_err("must time out");

    let failure = err.as_request_failure().expect("request failure");
    assert!(failure.text().contains("timeout"), "{failure}");
    assert!(failure.is_retryable());
    assert_eq!(client.balancer().metrics().retries, 2);
}

#[tokio::test]
async fn test_connection_refused_maps_to_network_failure() {
    // Port 1 is never bound in the test environment.
    let client = RestClient::new("http://127.0.0.1:1", fast_balancer()).expect("valid url");
    let err = client
        .get_json::<Value>("/api/courts", None)
        .await
        .expect_err("must fail to connect");

    let failure = err.as_request_failure().expect("request failure");
    assert!(failure.text().contains("network"), "{failure}");
    assert_eq!(failure.status_code(), None);
    assert_eq!(client.balancer().metrics().retries, 2);
}

// ============================================================================
// Writes
// ============================================================================

#[tokio::test]
async fn test_post_json_sends_body_and_invalidates_reads() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/courts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(courts_body()))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/courts"))
        .and(body_json(json!({"id": 3, "name": "Garden"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 3, "name": "Garden"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let _: Vec<Court> = client.get_json("/api/courts", None).await.expect("read");

    let created: Court = client
        .post_json(
            "/api/courts",
            &Court {
                id: 3,
                name: "Garden".into(),
            },
        )
        .await
        .expect("create");
    assert_eq!(created.id, 3);

    // Cache was dropped, so this read reaches the backend again.
    let _: Vec<Court> = client.get_json("/api/courts", None).await.expect("re-read");
}

#[tokio::test]
async fn test_put_and_patch_use_their_methods() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/courts/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1, "name": "Main"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/courts/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1, "name": "Main 2"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let put: Court = client
        .put_json("/api/courts/1", &json!({"name": "Main"}))
        .await
        .expect("put");
    let patched: Court = client
        .patch_json("/api/courts/1", &json!({"name": "Main 2"}))
        .await
        .expect("patch");

    assert_eq!(put.name, "Main");
    assert_eq!(patched.name, "Main 2");
}

#[tokio::test]
async fn test_delete_accepts_empty_body() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/bookings/5"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.delete("/api/bookings/5").await.expect("delete");
}

#[tokio::test]
async fn test_unauthorized_write_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let result = client.post_json::<_, Value>("/auth/refresh", &json!({})).await;

    let err = result.expect_err("401 must fail");
    assert_eq!(
        err.as_request_failure().and_then(|f| f.status_code()),
        Some(401)
    );
}
