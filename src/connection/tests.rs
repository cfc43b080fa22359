//! Tests for failure classification and reconnect-and-retry.

use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;

use super::*;
use crate::api::Cluster;
use crate::test_support::{FakeConnector, FakeOlvm, RecordingProgress};

fn transient(message: &str) -> ApiError {
    ApiError::Remote(message.to_owned())
}

async fn manager(
    olvm: &FakeOlvm,
    max_retries: u32,
) -> (ConnectionManager<FakeConnector>, RecordingProgress) {
    let progress = RecordingProgress::new();
    let manager = ConnectionManager::connect(
        olvm.connector(),
        RetryPolicy::new(max_retries, Duration::from_millis(1)),
        Arc::new(progress.clone()),
    )
    .await
    .unwrap_or_else(|err| panic!("initial connect should succeed: {err}"));
    (manager, progress)
}

async fn list_clusters(
    manager: &ConnectionManager<FakeConnector>,
) -> Result<Vec<Cluster>, ConnectionError> {
    manager
        .execute(|conn| async move { conn.list_clusters().await })
        .await
}

#[rstest]
#[case("dial tcp: connection refused")]
#[case("read: Connection Reset by peer")]
#[case("Network is unreachable")]
#[case("no route to host")]
#[case("request TIMEOUT after 30s")]
#[case("context deadline exceeded")]
#[case("connection lost: session closed")]
#[case("write: broken pipe")]
#[case("tag not matched")]
#[case("expect <fault> but got <html>")]
#[case("Unexpected token < in JSON")]
#[case("XML parsing error at line 1")]
#[case("parse error: expected value")]
#[case("unexpected end element")]
#[case("Unauthorized")]
#[case("session expired")]
#[case("Token Expired")]
#[case("access denied for user")]
#[case("HTTP 502: bad gateway")]
#[case("HTTP 429: slow down")]
#[case("service temporarily unavailable")]
#[case("temporary failure in name resolution")]
fn transient_messages_are_retryable(#[case] message: &str) {
    assert!(is_retryable_message(message), "{message} should be retryable");
}

#[rstest]
#[case("invalid argument")]
#[case("http 503 service unavailable")]
#[case("Temporary outage")]
#[case("HTTP 400: bad request")]
#[case("disk is locked")]
fn terminal_messages_are_not_retryable(#[case] message: &str) {
    assert!(
        !is_retryable_message(message),
        "{message} should not be retryable"
    );
}

#[test]
fn auth_errors_are_always_retryable() {
    assert!(is_retryable(&ApiError::Auth(String::from("bad credentials"))));
    assert!(!is_retryable(&ApiError::NotFound(String::from("vm vm-1"))));
}

#[tokio::test]
async fn initial_connect_failure_is_reported() {
    let olvm = FakeOlvm::new();
    olvm.fail_next_connect(transient("connection refused"));

    let result = ConnectionManager::connect(
        olvm.connector(),
        RetryPolicy::default(),
        Arc::new(RecordingProgress::new()),
    )
    .await;

    assert!(matches!(result, Err(ConnectionError::Connect(_))));
}

#[tokio::test]
async fn failed_initial_probe_closes_the_session() {
    let olvm = FakeOlvm::new();
    olvm.fail_next_probe(ApiError::Auth(String::from("login required")));

    let result = ConnectionManager::connect(
        olvm.connector(),
        RetryPolicy::default(),
        Arc::new(RecordingProgress::new()),
    )
    .await;

    assert!(matches!(result, Err(ConnectionError::Connect(ApiError::Auth(_)))));
    assert_eq!(olvm.closed_sessions(), vec![1]);
}

#[tokio::test]
async fn healthy_session_is_reused() {
    let olvm = FakeOlvm::with_standard_inventory();
    let (manager, _progress) = manager(&olvm, 4).await;

    let clusters = list_clusters(&manager)
        .await
        .unwrap_or_else(|err| panic!("call should succeed: {err}"));
    list_clusters(&manager)
        .await
        .unwrap_or_else(|err| panic!("call should succeed: {err}"));

    assert_eq!(clusters.len(), 1);
    assert_eq!(olvm.connects(), 1);
    assert_eq!(olvm.probes(), 3);
    assert!(olvm.closed_sessions().is_empty());
}

#[tokio::test]
async fn transient_failure_reconnects_once_and_succeeds() {
    let olvm = FakeOlvm::with_standard_inventory();
    olvm.fail_next("list_clusters", transient("connection reset by peer"));
    let (manager, progress) = manager(&olvm, 4).await;

    let clusters = list_clusters(&manager)
        .await
        .unwrap_or_else(|err| panic!("retry should succeed: {err}"));

    assert_eq!(clusters.len(), 1);
    assert_eq!(olvm.connects(), 2);
    assert_eq!(olvm.closed_sessions(), vec![1]);
    assert_eq!(olvm.call_count("list_clusters"), 2);
    assert!(progress.contains("Reconnection attempt 1/4"));
    assert!(progress.contains("Operation succeeded after reconnection"));
}

#[tokio::test]
async fn persistent_transient_failure_exhausts_budget() {
    let olvm = FakeOlvm::with_standard_inventory();
    for _ in 0..4 {
        olvm.fail_next("list_clusters", transient("HTTP 503: unavailable"));
    }
    let (manager, _progress) = manager(&olvm, 3).await;

    let result = list_clusters(&manager).await;

    assert_eq!(
        result,
        Err(ConnectionError::RetriesExhausted {
            attempts: 3,
            source: transient("HTTP 503: unavailable"),
        })
    );
    assert_eq!(olvm.call_count("list_clusters"), 4);
    assert_eq!(olvm.connects(), 4);
    assert_eq!(olvm.closed_sessions(), vec![1, 2, 3]);
}

#[tokio::test]
async fn terminal_failure_is_returned_without_reconnecting() {
    let olvm = FakeOlvm::with_standard_inventory();
    olvm.fail_next("list_clusters", transient("invalid argument"));
    let (manager, _progress) = manager(&olvm, 4).await;

    let result = list_clusters(&manager).await;

    assert_eq!(result, Err(ConnectionError::Api(transient("invalid argument"))));
    assert_eq!(olvm.connects(), 1);
    assert_eq!(olvm.call_count("list_clusters"), 1);
}

#[tokio::test]
async fn not_found_is_terminal() {
    let olvm = FakeOlvm::with_standard_inventory();
    let (manager, _progress) = manager(&olvm, 4).await;

    let err = manager
        .execute(|conn| async move { conn.get_vm("missing").await })
        .await
        .err()
        .unwrap_or_else(|| panic!("unknown VM should fail"));

    assert!(err.is_not_found());
    assert_eq!(olvm.connects(), 1);
}

#[tokio::test]
async fn failing_probe_triggers_reconnect() {
    let olvm = FakeOlvm::with_standard_inventory();
    let (manager, progress) = manager(&olvm, 4).await;
    olvm.fail_next_probe(transient("connection lost"));

    list_clusters(&manager)
        .await
        .unwrap_or_else(|err| panic!("call should succeed after reconnect: {err}"));

    assert_eq!(olvm.connects(), 2);
    assert_eq!(olvm.closed_sessions(), vec![1]);
    assert!(progress.contains("Connection test failed, reconnecting to OLVM"));
}

#[tokio::test]
async fn terminal_probe_failure_is_returned() {
    let olvm = FakeOlvm::with_standard_inventory();
    let (manager, _progress) = manager(&olvm, 4).await;
    olvm.fail_next_probe(transient("invalid argument"));

    let result = list_clusters(&manager).await;

    assert_eq!(result, Err(ConnectionError::Api(transient("invalid argument"))));
    assert_eq!(olvm.call_count("list_clusters"), 0);
}

#[tokio::test]
async fn failed_reconnects_exhaust_budget() {
    let olvm = FakeOlvm::with_standard_inventory();
    olvm.fail_next("list_clusters", transient("broken pipe"));
    let (manager, _progress) = manager(&olvm, 3).await;
    for _ in 0..3 {
        olvm.fail_next_connect(transient("connection refused"));
    }

    let result = list_clusters(&manager).await;

    assert_eq!(
        result,
        Err(ConnectionError::ReconnectExhausted {
            attempts: 3,
            source: transient("connection refused"),
        })
    );
    assert_eq!(olvm.connects(), 4);
    assert_eq!(olvm.call_count("list_clusters"), 1);
}

#[tokio::test]
async fn terminal_failure_after_reconnect_is_distinguished() {
    let olvm = FakeOlvm::with_standard_inventory();
    olvm.fail_next("list_clusters", transient("connection reset"));
    olvm.fail_next("list_clusters", ApiError::NotFound(String::from("clusters")));
    let (manager, _progress) = manager(&olvm, 4).await;

    let result = list_clusters(&manager).await;

    assert_eq!(
        result,
        Err(ConnectionError::AfterReconnect(ApiError::NotFound(
            String::from("clusters")
        )))
    );
    assert_eq!(olvm.connects(), 2);
}

#[tokio::test]
async fn closed_manager_reconnects_on_next_call() {
    let olvm = FakeOlvm::with_standard_inventory();
    let (manager, _progress) = manager(&olvm, 4).await;
    manager.close();

    list_clusters(&manager)
        .await
        .unwrap_or_else(|err| panic!("call should reconnect: {err}"));

    assert_eq!(olvm.connects(), 2);
    assert_eq!(olvm.closed_sessions(), vec![1]);
}

#[tokio::test]
async fn dropping_the_manager_closes_the_session() {
    let olvm = FakeOlvm::with_standard_inventory();
    let (manager, _progress) = manager(&olvm, 4).await;

    drop(manager);

    assert_eq!(olvm.closed_sessions(), vec![1]);
}
