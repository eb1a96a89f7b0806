//! Forwarding from caller-facing routers to the current privileged router.
//!
//! ```text
//! caller ──proxy{method, params}──> [caller router] ── Bridge ──> [target router] ──> service
//! ```
//!
//! The bridge holds a single slot. [`Bridge::attach`] replaces it (last
//! writer wins) and starts watching the new target's close signal; when
//! that router closes while still attached, the slot is cleared. Calls made
//! while the slot is empty fail with `NotConnected`.
//!
//! The slot holds a weak reference, so attaching a router does not keep it
//! alive.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::Transferable;
use crate::config::Config;
use crate::constants::PROXY_METHOD;
use crate::rpc::{Call, Deadline, Reply, Router, RpcError, WeakRouter};

/// Params of a `proxy` call: the method to forward and its params.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProxyCall {
    /// Method invoked on the target.
    pub method: String,
    /// Params passed through unchanged.
    #[serde(default)]
    pub params: Value,
}

impl ProxyCall {
    /// Parse `proxy` params: `[{ method, params }]` or `{ method, params }`.
    pub fn parse(params: Value) -> Result<Self, RpcError> {
        let inner = match params {
            Value::Array(mut items) if items.len() == 1 => items.remove(0),
            other => other,
        };
        serde_json::from_value(inner).map_err(|e| RpcError::InvalidParams(format!("{PROXY_METHOD}: {e}")))
    }
}

/// Build `proxy` params forwarding `method` with `params`.
pub fn proxy_params(method: &str, params: Value) -> Value {
    json!([{ "method": method, "params": params }])
}

#[derive(Debug)]
struct Target {
    id: Uuid,
    router: WeakRouter,
    /// Stops the close watcher once this target leaves the slot.
    watcher: CancellationToken,
}

type Slot = StdMutex<Option<Target>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<Target>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single-slot registry of the router `proxy` calls are forwarded to.
///
/// Clones share the slot.
#[derive(Debug, Clone)]
pub struct Bridge {
    slot: Arc<Slot>,
    timeout: Duration,
}

impl Bridge {
    /// Create an empty bridge forwarding with the configured proxy timeout.
    pub fn new(config: &Config) -> Self {
        Self {
            slot: Arc::new(StdMutex::new(None)),
            timeout: config.proxy_timeout(),
        }
    }

    /// Make `router` the target, replacing any previous one.
    ///
    /// Must be called inside a tokio runtime.
    pub fn attach(&self, router: &Router) {
        let id = router.id();
        let watcher = CancellationToken::new();
        let previous = {
            let mut slot = lock(&self.slot);
            if slot.as_ref().is_some_and(|target| target.id == id) {
                return;
            }
            slot.replace(Target {
                id,
                router: router.downgrade(),
                watcher: watcher.clone(),
            })
        };

        match previous {
            Some(previous) => {
                previous.watcher.cancel();
                log::info!("[Bridge] Attached router {id}, replacing {}", previous.id);
            }
            None => log::info!("[Bridge] Attached router {id}"),
        }

        let signal = router.close_signal();
        let slot = Arc::downgrade(&self.slot);
        tokio::spawn(async move {
            tokio::select! {
                () = watcher.cancelled() => {}
                () = signal.cancelled() => detach_if_current(&slot, id),
            }
        });
    }

    /// Clear the slot. Returns whether a target was attached.
    pub fn detach(&self) -> bool {
        let previous = lock(&self.slot).take();
        if let Some(previous) = &previous {
            previous.watcher.cancel();
            log::info!("[Bridge] Detached router {}", previous.id);
        }
        previous.is_some()
    }

    /// The current target, if attached and still open.
    pub fn current(&self) -> Option<Router> {
        let slot = lock(&self.slot);
        slot.as_ref()
            .and_then(|target| target.router.upgrade())
            .filter(|router| !router.is_closed())
    }

    /// Whether a live target is attached.
    pub fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    /// Forward a call to the current target and relay its outcome.
    ///
    /// `NotConnected` if there is no live target, or if the target closes
    /// before answering.
    pub async fn forward(
        &self,
        method: &str,
        params: Value,
        transfer: Vec<Transferable>,
    ) -> Result<Reply, RpcError> {
        let Some(target) = self.current() else {
            log::debug!("[Bridge] Dropping {method}: no target");
            return Err(RpcError::NotConnected);
        };

        log::debug!("[Bridge] Forwarding {method} to router {}", target.id());
        match target
            .request(method, params, transfer, Deadline::after(self.timeout))
            .await
        {
            Err(RpcError::Closed) => Err(RpcError::NotConnected),
            outcome => outcome,
        }
    }

    /// Serve `proxy` on `router`, forwarding through this bridge.
    pub fn register(&self, router: &Router) {
        let bridge = self.clone();
        router.register_handler(PROXY_METHOD, move |call: Call| {
            let bridge = bridge.clone();
            async move {
                let ProxyCall { method, params } = ProxyCall::parse(call.params)?;
                bridge
                    .forward(&method, params, call.transfer)
                    .await
                    .map_err(anyhow::Error::from)
            }
        });
    }
}

fn detach_if_current(slot: &Weak<Slot>, id: Uuid) {
    let Some(slot) = slot.upgrade() else {
        return;
    };
    let mut slot = lock(&slot);
    if slot.as_ref().is_some_and(|target| target.id == id) {
        *slot = None;
        log::info!("[Bridge] Target router {id} closed, detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;

    fn open_router() -> (Router, Router) {
        let (left, right) = MemoryChannel::pair();
        (Router::new(left, Config::default()), Router::new(right, Config::default()))
    }

    #[test]
    fn test_parse_accepts_array_and_object() {
        let expected = ProxyCall {
            method: "kv_get".to_string(),
            params: json!(["docs", "file"]),
        };
        assert_eq!(ProxyCall::parse(proxy_params("kv_get", json!(["docs", "file"]))).unwrap(), expected);
        assert_eq!(
            ProxyCall::parse(json!({ "method": "kv_get", "params": ["docs", "file"] })).unwrap(),
            expected
        );

        let hello = ProxyCall::parse(json!([{ "method": "hello" }])).unwrap();
        assert_eq!(hello.params, Value::Null);

        let err = ProxyCall::parse(json!([1, 2])).unwrap_err();
        assert_eq!(err.code(), crate::rpc::error::code::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_not_connected_without_target() {
        let bridge = Bridge::new(&Config::default());
        assert!(!bridge.is_connected());
        assert_eq!(
            bridge.forward("hello", Value::Null, Vec::new()).await,
            Err(RpcError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_last_attach_wins() {
        let bridge = Bridge::new(&Config::default());
        let (first, _first_peer) = open_router();
        let (second, _second_peer) = open_router();

        bridge.attach(&first);
        bridge.attach(&second);
        assert_eq!(bridge.current().unwrap().id(), second.id());

        // Closing the replaced router leaves the current target alone
        first.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bridge.current().unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn test_replaced_target_stops_its_watcher() {
        let bridge = Bridge::new(&Config::default());
        let (first, _first_peer) = open_router();
        let (second, _second_peer) = open_router();
        let tasks = || tokio::runtime::Handle::current().metrics().num_alive_tasks();
        let baseline = tasks();

        // Neither router ever closes
        bridge.attach(&first);
        bridge.attach(&second);
        bridge.attach(&second);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tasks(), baseline + 1);

        assert!(bridge.detach());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tasks(), baseline);
    }

    #[tokio::test]
    async fn test_target_close_detaches() {
        let bridge = Bridge::new(&Config::default());
        let (target, _peer) = open_router();
        bridge.attach(&target);
        assert!(bridge.is_connected());

        target.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!bridge.is_connected());
        assert!(!bridge.detach());
    }

    #[tokio::test]
    async fn test_forward_relays_value_and_transferables() {
        let bridge = Bridge::new(&Config::default());
        let (target, service) = open_router();
        service.register_handler("echo", |call: Call| async move {
            Ok(Reply::with_transfer(call.params, call.transfer))
        });
        bridge.attach(&target);

        let payload = bytes::Bytes::from_static(b"blob");
        let reply = bridge
            .forward("echo", json!({ "n": 1 }), vec![payload.clone()])
            .await
            .unwrap();
        assert_eq!(reply.value, json!({ "n": 1 }));
        assert_eq!(reply.transfer, vec![payload]);
    }
}
