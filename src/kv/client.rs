//! Typed client for the KV methods.
//!
//! Talks to a [`super::KvService`] either directly over a router, or through
//! a [`crate::bridge::Bridge`] by wrapping every call in `proxy`.

use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::service::KvMethod;
use super::store::ScopeRecord;
use crate::bridge::proxy_params;
use crate::channel::Transferable;
use crate::constants::{HELLO_METHOD, PROXY_METHOD};
use crate::rpc::{Deadline, Reply, Router, RpcError};

/// How calls reach the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Direct,
    Proxy,
}

/// KV client over a [`Router`].
#[derive(Debug, Clone)]
pub struct KvClient {
    router: Router,
    route: Route,
    timeout: Duration,
}

fn decode<T: DeserializeOwned>(method: KvMethod, value: Value) -> Result<T, RpcError> {
    serde_json::from_value(value)
        .map_err(|e| RpcError::Internal(format!("unexpected {method} reply: {e}")))
}

impl KvClient {
    /// Call the service on the router's peer directly.
    pub fn new(router: Router) -> Self {
        let timeout = router.config().request_timeout();
        Self {
            router,
            route: Route::Direct,
            timeout,
        }
    }

    /// Call the service through the peer's `proxy` method.
    pub fn via_proxy(router: Router) -> Self {
        Self {
            route: Route::Proxy,
            ..Self::new(router)
        }
    }

    /// Use `timeout` instead of the configured request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The router calls go through.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Whether the service is reachable.
    ///
    /// Through a proxy this reports whether the bridge currently has a live
    /// target.
    pub async fn ping(&self) -> Result<(), RpcError> {
        self.call(HELLO_METHOD, Value::Null, Vec::new()).await.map(|_| ())
    }

    /// Request access to `scope` with `capacity` bytes. `false` if consent
    /// was refused.
    pub async fn ask(&self, scope: &str, capacity: u64) -> Result<bool, RpcError> {
        let reply = self.kv(KvMethod::Ask, json!([scope, capacity]), Vec::new()).await?;
        decode(KvMethod::Ask, reply.value)
    }

    /// Grant `origin` access to `scope`. Only served on privileged routers.
    pub async fn allow(&self, scope: &str, origin: &str, capacity: u64) -> Result<ScopeRecord, RpcError> {
        let reply = self
            .kv(KvMethod::Allow, json!([scope, origin, capacity]), Vec::new())
            .await?;
        decode(KvMethod::Allow, reply.value)
    }

    /// Store `value` under `key` in `scope`.
    pub async fn set(&self, scope: &str, key: &str, value: Bytes) -> Result<(), RpcError> {
        self.kv(KvMethod::Set, json!([scope, key]), vec![value]).await?;
        Ok(())
    }

    /// Read `key` from `scope`.
    pub async fn get(&self, scope: &str, key: &str) -> Result<Option<Bytes>, RpcError> {
        #[derive(serde::Deserialize)]
        struct Found {
            found: bool,
        }

        let reply = self.kv(KvMethod::Get, json!([scope, key]), Vec::new()).await?;
        let Found { found } = decode(KvMethod::Get, reply.value)?;
        if !found {
            return Ok(None);
        }
        match reply.transfer.into_iter().next() {
            Some(value) => Ok(Some(value)),
            None => Err(RpcError::Internal(format!("{} reply is missing its value", KvMethod::Get))),
        }
    }

    async fn kv(&self, method: KvMethod, params: Value, transfer: Vec<Transferable>) -> Result<Reply, RpcError> {
        self.call(method.as_str(), params, transfer).await
    }

    async fn call(&self, method: &str, params: Value, transfer: Vec<Transferable>) -> Result<Reply, RpcError> {
        let deadline = Deadline::after(self.timeout);
        match self.route {
            Route::Direct => self.router.request(method, params, transfer, deadline).await,
            Route::Proxy => {
                self.router
                    .request(PROXY_METHOD, proxy_params(method, params), transfer, deadline)
                    .await
            }
        }
    }
}
