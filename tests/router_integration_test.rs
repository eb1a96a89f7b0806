//! Router Integration Tests
//!
//! End-to-end tests of two routers over an in-memory channel:
//! - Correlation of many concurrent requests
//! - Hello handshake from either side
//! - Liveness probe closing a router whose peer went silent

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kvgate::channel::{Channel, Frame, MemoryChannel};
use kvgate::rpc::{Call, Deadline, Message, Reply, Response, Router, RouterState, RpcError};
use kvgate::Config;
use serde_json::{json, Value};

/// Config with short probe timings so liveness tests run quickly.
fn fast_config() -> Config {
    Config {
        handshake_timeout_ms: 500,
        probe_interval_ms: 50,
        probe_timeout_ms: 50,
        ..Config::default()
    }
}

/// Peer speaking the wire format by hand. Answers `hello` while `answer`
/// is set and ignores everything else.
async fn raw_peer(channel: MemoryChannel, answer: Arc<AtomicBool>) {
    while let Ok(frame) = channel.recv().await {
        let Ok(Message::Request(request)) = Message::decode(&frame.text) else {
            continue;
        };
        if request.method == "hello" && answer.load(Ordering::SeqCst) {
            let text = Message::from(Response {
                id: request.id,
                outcome: Ok(Value::Null),
            })
            .encode();
            if channel.send(Frame::text(text)).await.is_err() {
                return;
            }
        }
    }
}

/// Test that concurrent requests each receive their own response.
#[tokio::test]
async fn test_concurrent_requests_are_correlated() {
    let (left, right) = MemoryChannel::pair();
    let server = Router::new(right, fast_config());
    server.register_handler("double", |call: Call| async move {
        let n = call.params.as_u64().unwrap_or_default();
        // Answer out of order
        tokio::time::sleep(Duration::from_millis(100 - n)).await;
        Ok(Reply::new(json!(n * 2)))
    });

    let client = Router::connect(left, fast_config())
        .await
        .expect("client handshake");

    let requests: Vec<_> = (0..50u64)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move {
                let reply = client
                    .request("double", json!(n), Vec::new(), Deadline::after(Duration::from_secs(2)))
                    .await
                    .expect("request should succeed");
                (n, reply.value)
            })
        })
        .collect();

    for request in requests {
        let (n, value) = request.await.expect("task panicked");
        assert_eq!(value, json!(n * 2));
    }
    assert_eq!(client.pending_count(), 0);
}

/// Test that a peer which says hello first still completes the handshake.
#[tokio::test]
async fn test_passive_hello_completes_handshake() {
    let (left, right) = MemoryChannel::pair();

    // The early side's hello is buffered before the other side exists
    let early = Router::new(left, fast_config());
    let early_hello = {
        let early = early.clone();
        tokio::spawn(async move { early.hello(Deadline::after(Duration::from_millis(500))).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(early.state(), RouterState::Handshaking);

    let late = Router::new(right, fast_config());
    late.hello(Deadline::after(Duration::from_millis(500)))
        .await
        .expect("late handshake");
    early_hello
        .await
        .expect("task panicked")
        .expect("early handshake");

    assert_eq!(early.state(), RouterState::Ready);
    assert_eq!(late.state(), RouterState::Ready);

    // Handshaking again is harmless
    late.hello(Deadline::after(Duration::from_millis(500)))
        .await
        .expect("repeat handshake");
    assert_eq!(late.state(), RouterState::Ready);
}

/// Test that both sides racing their hello reach Ready.
#[tokio::test]
async fn test_simultaneous_hello() {
    let (left, right) = MemoryChannel::pair();
    let a = Router::new(left, fast_config());
    let b = Router::new(right, fast_config());

    let deadline = Deadline::after(Duration::from_millis(500));
    let (ra, rb) = tokio::join!(a.hello(deadline.clone()), b.hello(deadline));
    ra.expect("a handshake");
    rb.expect("b handshake");

    assert_eq!(a.state(), RouterState::Ready);
    assert_eq!(b.state(), RouterState::Ready);
}

/// Test that a handshake with nobody listening times out and closes.
#[tokio::test]
async fn test_handshake_timeout_closes_router() {
    let (left, _right) = MemoryChannel::pair();

    let err = Router::connect(left, fast_config()).await.unwrap_err();
    assert_eq!(err, RpcError::Timeout);
}

/// Test that a silent peer is detected and in-flight requests are rejected.
#[tokio::test]
async fn test_liveness_failure_closes_router() {
    let (left, right) = MemoryChannel::pair();
    let answer = Arc::new(AtomicBool::new(true));
    tokio::spawn(raw_peer(right, Arc::clone(&answer)));

    let config = fast_config();
    let interval = config.probe_interval();
    let router = Router::connect(left, config).await.expect("handshake");
    assert_eq!(router.state(), RouterState::Ready);

    // A few healthy probes
    tokio::time::sleep(interval * 3).await;
    assert!(!router.is_closed());

    let in_flight = {
        let router = router.clone();
        tokio::spawn(async move {
            router
                .request("never_answered", Value::Null, Vec::new(), Deadline::never())
                .await
        })
    };

    answer.store(false, Ordering::SeqCst);
    tokio::time::timeout(interval * 2 + Duration::from_millis(100), router.closed())
        .await
        .expect("router should close after the peer goes silent");

    assert_eq!(router.state(), RouterState::Closed);
    assert!(router
        .close_reason()
        .expect("close reason")
        .contains("liveness probe failed"));
    assert_eq!(in_flight.await.expect("task panicked"), Err(RpcError::Closed));

    let err = router
        .request("anything", Value::Null, Vec::new(), Deadline::never())
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::Closed);
}

/// Test that closing one router closes its peer through the channel.
#[tokio::test]
async fn test_close_propagates_to_peer() {
    let (left, right) = MemoryChannel::pair();
    let b = Router::new(right, fast_config());
    let a = Router::connect(left, fast_config()).await.expect("handshake");

    a.close();
    tokio::time::timeout(Duration::from_secs(1), b.closed())
        .await
        .expect("peer should close");
    assert_eq!(b.state(), RouterState::Closed);
}
