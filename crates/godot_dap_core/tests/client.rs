mod common;

use std::time::{Duration, Instant};

use common::MockPeer;
use godot_dap_core::{DapClient, DapError, CONNECTION_LOST_EVENT};
use serde_json::json;

#[tokio::test]
async fn test_concurrent_requests_get_their_own_responses() {
    let peer = MockPeer::bind().await;
    let client = DapClient::connect(&peer.config()).await.expect("connect");
    let mut conn = peer.accept().await;

    let script = async {
        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(conn.next_request().await);
        }
        // Answer in reverse arrival order.
        for request in requests.iter().rev() {
            conn.respond(request, json!({ "echo": request.arguments["n"] }))
                .await;
        }
    };

    let (a, b, c, ()) = tokio::join!(
        client.send_and_wait("evaluate", json!({ "n": 1 })),
        client.send_and_wait("evaluate", json!({ "n": 2 })),
        client.send_and_wait("evaluate", json!({ "n": 3 })),
        script
    );

    assert_eq!(a.expect("first").body["echo"], 1);
    assert_eq!(b.expect("second").body["echo"], 2);
    assert_eq!(c.expect("third").body["echo"], 3);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_unanswered_request_times_out_at_deadline() {
    let peer = MockPeer::bind().await;
    let client = DapClient::connect(&peer.config()).await.expect("connect");
    let mut conn = peer.accept().await;

    let deadline = Duration::from_millis(200);
    for _ in 0..20 {
        let started = Instant::now();
        let err = client
            .send_and_wait_with("threads", json!({}), deadline)
            .await
            .expect_err("peer never answers");
        let elapsed = started.elapsed();

        assert!(matches!(err, DapError::Timeout { .. }), "unexpected error: {err}");
        assert!(elapsed >= deadline, "returned early after {elapsed:?}");
        assert!(elapsed < deadline * 5, "returned late after {elapsed:?}");
        conn.expect_request("threads").await;
    }
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_late_and_duplicate_responses_are_dropped() {
    let peer = MockPeer::bind().await;
    let client = DapClient::connect(&peer.config()).await.expect("connect");
    let mut conn = peer.accept().await;

    let err = client
        .send_and_wait_with("stackTrace", json!({}), Duration::from_millis(50))
        .await
        .expect_err("no answer in time");
    assert!(matches!(err, DapError::Timeout { .. }), "unexpected error: {err}");
    let stale = conn.expect_request("stackTrace").await;

    let script = async {
        let fresh = conn.expect_request("scopes").await;
        conn.respond(&stale, json!({ "stale": true })).await;
        conn.respond(&fresh, json!({ "scopes": [] })).await;
        conn.respond(&fresh, json!({ "duplicate": true })).await;
    };
    let (response, ()) = tokio::join!(client.send_and_wait("scopes", json!({ "frameId": 0 })), script);

    let response = response.expect("fresh response");
    assert_eq!(response.body, json!({ "scopes": [] }));
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_failed_response_is_remote_error() {
    let peer = MockPeer::bind().await;
    let client = DapClient::connect(&peer.config()).await.expect("connect");
    let mut conn = peer.accept().await;

    let script = async {
        let request = conn.expect_request("setVariable").await;
        conn.respond_error(&request, "setVariable is not implemented")
            .await;
    };
    let (result, ()) = tokio::join!(client.send_and_wait("setVariable", json!({})), script);

    match result.expect_err("peer refused") {
        DapError::Remote { command, message } => {
            assert_eq!(command, "setVariable");
            assert_eq!(message, "setVariable is not implemented");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_decode_error_fails_every_pending_request() {
    let peer = MockPeer::bind().await;
    let client = DapClient::connect_starting_at(&peer.config(), 10)
        .await
        .expect("connect");
    let mut conn = peer.accept().await;
    let mut events = client.subscribe();

    let mut pending = Vec::new();
    for (seq, command) in [(10, "threads"), (11, "stackTrace"), (12, "scopes")] {
        let request = client.send_request(command, json!({})).await.expect("send");
        assert_eq!(request.seq(), seq);
        pending.push(request);
        assert_eq!(conn.expect_request(command).await.seq, seq);
    }
    assert_eq!(client.pending_count(), 3);

    conn.send_raw(b"Content-Length: banana\r\n\r\n{}").await;

    for request in pending {
        let err = request
            .wait(Duration::from_secs(1))
            .await
            .expect_err("connection is gone");
        assert!(matches!(err, DapError::ConnectionLost(_)), "unexpected error: {err}");
    }
    assert!(!client.is_connected());
    assert_eq!(client.pending_count(), 0);

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("event in time")
        .expect("bus still open");
    assert_eq!(event.event, CONNECTION_LOST_EVENT);

    let err = client
        .send_and_wait("threads", json!({}))
        .await
        .expect_err("dead connection");
    assert!(matches!(err, DapError::ConnectionLost(_)), "unexpected error: {err}");
}

#[tokio::test]
async fn test_peer_close_fails_pending_request() {
    let peer = MockPeer::bind().await;
    let client = DapClient::connect(&peer.config()).await.expect("connect");
    let mut conn = peer.accept().await;

    let pending = client.send_request("pause", json!({})).await.expect("send");
    conn.expect_request("pause").await;
    drop(conn);

    let err = pending
        .wait(Duration::from_secs(1))
        .await
        .expect_err("peer went away");
    assert!(matches!(err, DapError::ConnectionLost(_)), "unexpected error: {err}");
}

#[tokio::test]
async fn test_event_flood_does_not_block_responses() {
    let peer = MockPeer::bind().await;
    let client = DapClient::connect(&peer.config()).await.expect("connect");
    let mut conn = peer.accept().await;
    // Never drained; its queues fill up and start dropping.
    let _idle = client.subscribe();

    let script = async {
        let request = conn.expect_request("threads").await;
        for i in 0..500 {
            conn.send_event("output", json!({ "output": format!("line {i}\n") }))
                .await;
        }
        conn.send_event("stopped", json!({ "reason": "pause" })).await;
        conn.respond(&request, json!({ "threads": [{ "id": 1, "name": "Main" }] }))
            .await;
    };
    let (response, ()) = tokio::join!(client.send_and_wait("threads", json!({})), script);

    let response = response.expect("response must still arrive");
    assert_eq!(response.body["threads"][0]["name"], "Main");
}

#[tokio::test]
async fn test_unknown_messages_are_skipped() {
    let peer = MockPeer::bind().await;
    let client = DapClient::connect(&peer.config()).await.expect("connect");
    let mut conn = peer.accept().await;
    let mut events = client.subscribe();

    let script = async {
        let request = conn.expect_request("threads").await;
        conn.send_raw(b"Content-Length: 19\r\n\r\n{\"type\":\"mystery\"}\n")
            .await;
        conn.send_raw(b"Content-Length: 58\r\n\r\n{\"type\":\"request\",\"seq\":7,\"command\":\"runInTerminal\",\"x\":1}")
            .await;
        conn.send_event("godot/custom", json!({ "a": 1 })).await;
        conn.respond(&request, json!({ "threads": [] })).await;
    };
    let (response, ()) = tokio::join!(client.send_and_wait("threads", json!({})), script);
    response.expect("still connected after unknown traffic");

    let event = events.recv().await.expect("custom event delivered");
    assert_eq!(event.event, "godot/custom");
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_close_is_idempotent_and_fails_waiters() {
    let peer = MockPeer::bind().await;
    let client = DapClient::connect(&peer.config()).await.expect("connect");
    let mut conn = peer.accept().await;

    let pending = client.send_request("continue", json!({})).await.expect("send");
    conn.expect_request("continue").await;

    client.close().await;
    client.close().await;

    let err = pending
        .wait(Duration::from_secs(1))
        .await
        .expect_err("closed");
    assert!(matches!(err, DapError::ConnectionLost(_)), "unexpected error: {err}");
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_connect_refused_is_connect_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let config = godot_dap_core::DapConfig::default().with_port(port);
    let err = DapClient::connect(&config).await.expect_err("refused");
    assert!(matches!(err, DapError::Connect { .. }), "unexpected error: {err}");
    assert_eq!(err.kind(), "connect_error");
}
