//! Bridge Integration Tests
//!
//! Tests of `proxy` forwarding through a bridge:
//! - Status probe before and after attach
//! - KV calls and errors relayed through the proxy
//! - Failover when the privileged router goes away

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kvgate::kv::{DenyAll, KvClient, KvService, MemoryBlobStore, QuotaStore};
use kvgate::rpc::{Call, ErrorObject};
use kvgate::{Bridge, Config, MemoryChannel, Router, RpcError};

const APP_ORIGIN: &str = "https://a.example";

/// A caller-facing router serving `proxy` through `bridge`, and a client
/// talking to it.
async fn proxied_client(bridge: &Bridge) -> KvClient {
    let (left, right) = MemoryChannel::pair();
    let facing = Router::new(right, Config::default());
    bridge.register(&facing);

    let router = Router::connect(left, Config::default())
        .await
        .expect("handshake");
    KvClient::via_proxy(router).with_timeout(Duration::from_secs(2))
}

/// A privileged target router connected to a router serving `service`.
/// Returns `(target, service_side)`.
async fn privileged_target(service: &KvService) -> (Router, Router) {
    let (left, right) = MemoryChannel::pair();
    let service_side = Router::new(right, Config::default());
    service.register(&service_side, APP_ORIGIN);

    let target = Router::connect(left, Config::default())
        .await
        .expect("handshake");
    (target, service_side)
}

fn service() -> KvService {
    KvService::new(QuotaStore::new(Arc::new(MemoryBlobStore::new())), Arc::new(DenyAll))
}

/// Wait until the bridge has dropped its target.
async fn wait_detached(bridge: &Bridge) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while bridge.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("bridge should detach");
}

/// Test that the status probe reflects whether a target is attached.
#[tokio::test]
async fn test_status_probe() {
    let bridge = Bridge::new(&Config::default());
    let client = proxied_client(&bridge).await;

    assert_eq!(client.ping().await, Err(RpcError::NotConnected));
    assert_eq!(client.get("docs", "file").await, Err(RpcError::NotConnected));

    let service = service();
    let (target, _service_side) = privileged_target(&service).await;
    bridge.attach(&target);

    client.ping().await.expect("connected");
}

/// Test that KV values and errors pass through the proxy unchanged.
#[tokio::test]
async fn test_kv_through_proxy() {
    let bridge = Bridge::new(&Config::default());
    let client = proxied_client(&bridge).await;

    let service = service();
    let (target, _service_side) = privileged_target(&service).await;
    bridge.attach(&target);

    assert!(!client.ask("docs", 10).await.expect("ask"));
    service
        .store()
        .allow("docs", APP_ORIGIN, 10)
        .await
        .expect("allow");
    assert!(client.ask("docs", 10).await.expect("ask"));

    client
        .set("docs", "file", Bytes::from_static(b"0123456789"))
        .await
        .expect("set");
    assert_eq!(
        client.get("docs", "file").await.expect("get"),
        Some(Bytes::from_static(b"0123456789"))
    );
    assert_eq!(
        client.set("docs", "file2", Bytes::from_static(b"x")).await,
        Err(RpcError::TooBig)
    );
}

/// Test that an application-defined error code survives forwarding.
#[tokio::test]
async fn test_unknown_error_code_is_relayed() {
    let bridge = Bridge::new(&Config::default());
    let client = proxied_client(&bridge).await;

    let (left, right) = MemoryChannel::pair();
    let service_side = Router::new(right, Config::default());
    service_side.register_handler("reject", |_call: Call| async {
        Err(anyhow::Error::new(RpcError::from_object(ErrorObject {
            code: "UserRejected".to_string(),
            message: "User rejected the request".to_string(),
        })))
    });
    let target = Router::connect(left, Config::default())
        .await
        .expect("handshake");
    bridge.attach(&target);

    let err = client
        .router()
        .request(
            "proxy",
            kvgate::bridge::proxy_params("reject", serde_json::Value::Null),
            Vec::new(),
            kvgate::Deadline::after(Duration::from_secs(2)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UserRejected");
    assert_eq!(err.to_object().message, "User rejected the request");
}

/// Test failover: the target going away yields NotConnected until a new
/// target is attached.
#[tokio::test]
async fn test_failover_to_new_target() {
    let bridge = Bridge::new(&Config::default());
    let client = proxied_client(&bridge).await;
    let service = service();
    service
        .store()
        .allow("docs", APP_ORIGIN, 100)
        .await
        .expect("allow");

    let (first, first_service) = privileged_target(&service).await;
    bridge.attach(&first);
    client
        .set("docs", "file", Bytes::from_static(b"v1"))
        .await
        .expect("set");

    // Service side disappears, the target notices and the bridge detaches
    first_service.close();
    wait_detached(&bridge).await;
    assert!(first.is_closed());
    assert_eq!(client.get("docs", "file").await, Err(RpcError::NotConnected));

    let (second, _second_service) = privileged_target(&service).await;
    bridge.attach(&second);
    assert_eq!(
        client.get("docs", "file").await.expect("get"),
        Some(Bytes::from_static(b"v1"))
    );
}
