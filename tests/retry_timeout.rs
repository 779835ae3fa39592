//! Retry budget and the synthesized 5022 timeout response.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;

use common::{wait_until, Broker, Mode, TestClient, TEST_TIMEOUT};
use stomp_jsonrpc::rpc::{CallCallback, CallEvent, ClientPolicy, JsonRpcRequest, TIMEOUT_ERROR_CODE};
use stomp_jsonrpc::FailureKind;

fn policy(retry_timeout: Duration, retry_number: u32) -> ClientPolicy {
    ClientPolicy::new(
        retry_timeout,
        retry_number,
        Duration::ZERO,
        Duration::ZERO,
        vec![FailureKind::Io],
    )
}

#[test]
fn test_silent_server_times_out_after_retry_budget() {
    let broker = Broker::start(Mode::Silent);
    let test = TestClient::new(broker.port(), policy(Duration::from_millis(1000), 2));

    let started = Instant::now();
    let handle = test
        .client
        .call(JsonRpcRequest::new("echo", json!({}), "123"))
        .unwrap();
    let response = handle.wait(Some(TEST_TIMEOUT)).unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.id(), &json!("123"));
    assert_eq!(response.error_code(), Some(TIMEOUT_ERROR_CODE));
    assert_eq!(TIMEOUT_ERROR_CODE, 5022);
    assert!(elapsed >= Duration::from_millis(1900), "resolved too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(4), "resolved too late: {:?}", elapsed);

    // Sent once, resent once.
    assert!(wait_until(|| broker.requests().len() == 2));
    assert_eq!(broker.requests()[0], broker.requests()[1]);
    assert_eq!(test.client.pending_calls(), 0);
}

#[test]
fn test_retry_events_reach_callback() {
    let broker = Broker::start(Mode::Silent);
    let test = TestClient::new(broker.port(), policy(Duration::from_millis(200), 3));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: CallCallback = Arc::new(move |event| sink.lock().unwrap().push(event));
    let handle = test
        .client
        .call_with_callback(JsonRpcRequest::new("echo", json!({}), 9), Some(callback))
        .unwrap();
    handle.wait(Some(TEST_TIMEOUT)).unwrap();

    assert!(wait_until(|| seen
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, CallEvent::Resolved(_)))));
    let events = seen.lock().unwrap();
    let retries = events
        .iter()
        .filter(|event| matches!(event, CallEvent::Retrying { .. }))
        .count();
    assert_eq!(retries, 2);
    assert!(matches!(events.last(), Some(CallEvent::Resolved(response)) if response.error_code() == Some(5022)));
}

#[test]
fn test_unreachable_endpoint_still_resolves() {
    // Reserve a port and release it so nothing listens there.
    let port = {
        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        spare.local_addr().unwrap().port()
    };
    let test = TestClient::new(port, policy(Duration::from_millis(300), 2));

    let started = Instant::now();
    let handle = test
        .client
        .call(JsonRpcRequest::new("echo", json!({}), "lost"))
        .unwrap();
    let response = handle.wait(Some(TEST_TIMEOUT)).unwrap();

    assert_eq!(response.error_code(), Some(TIMEOUT_ERROR_CODE));
    assert!(started.elapsed() < TEST_TIMEOUT);
    assert!(!test.client.is_connected());
}

#[test]
fn test_late_response_after_timeout_is_ignored() {
    let broker = Broker::start(Mode::Silent);
    let test = TestClient::new(broker.port(), policy(Duration::from_millis(200), 1));
    test.client.connect().unwrap();
    assert!(wait_until(|| broker.is_subscribed("rpc.responses")));

    let handle = test
        .client
        .call(JsonRpcRequest::new("echo", json!({}), "slow"))
        .unwrap();
    let response = handle.wait(Some(TEST_TIMEOUT)).unwrap();
    assert_eq!(response.error_code(), Some(TIMEOUT_ERROR_CODE));

    let delivered = broker.push(
        "rpc.responses",
        json!({"jsonrpc": "2.0", "id": "slow", "result": "too late"}),
    );
    assert_eq!(delivered, 1);
    std::thread::sleep(Duration::from_millis(100));
    assert!(handle.is_done());
    assert_eq!(handle.wait(Some(TEST_TIMEOUT)).unwrap().error_code(), Some(TIMEOUT_ERROR_CODE));
}
