//! KV methods served over a [`Router`].
//!
//! The service is registered per router for one origin: every call arriving
//! on that router acts on behalf of that origin, and callers never name
//! their own origin.
//!
//! | method     | params                      | transfer   | result             |
//! |------------|-----------------------------|------------|--------------------|
//! | `kv_ask`   | `[scope, capacity]`         |            | `bool`             |
//! | `kv_set`   | `[scope, key]`              | `[value]`  | `null`             |
//! | `kv_get`   | `[scope, key]`              |            | `{ found }` + value |
//! | `kv_allow` | `[scope, origin, capacity]` |            | `ScopeRecord`      |
//!
//! `kv_allow` grants access to an arbitrary origin, so it is only exposed by
//! [`KvService::register_privileged`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::store::QuotaStore;
use crate::rpc::{Call, Reply, Router, RpcError};

/// Methods served by [`KvService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KvMethod {
    /// Check permission, asking for consent if needed.
    Ask,
    /// Grant permission to an origin (privileged).
    Allow,
    /// Store a value.
    Set,
    /// Read a value.
    Get,
}

impl KvMethod {
    /// Methods available to ordinary callers.
    pub const PUBLIC: [KvMethod; 3] = [KvMethod::Ask, KvMethod::Set, KvMethod::Get];

    /// Every method, including privileged ones.
    pub const ALL: [KvMethod; 4] = [KvMethod::Ask, KvMethod::Allow, KvMethod::Set, KvMethod::Get];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ask => "kv_ask",
            Self::Allow => "kv_allow",
            Self::Set => "kv_set",
            Self::Get => "kv_get",
        }
    }
}

impl TryFrom<&str> for KvMethod {
    type Error = RpcError;

    fn try_from(method: &str) -> Result<Self, Self::Error> {
        match method {
            "kv_ask" => Ok(Self::Ask),
            "kv_allow" => Ok(Self::Allow),
            "kv_set" => Ok(Self::Set),
            "kv_get" => Ok(Self::Get),
            other => Err(RpcError::MethodNotFound(other.to_string())),
        }
    }
}

impl std::fmt::Display for KvMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides whether an origin may use a scope it has no permission for yet.
///
/// Implementations typically put a prompt in front of the user; they may
/// take as long as they like, bounded by the caller's request deadline.
#[async_trait]
pub trait Consent: Send + Sync {
    /// Return `true` to grant `origin` access to `scope` with `capacity`.
    async fn request(&self, scope: &str, origin: &str, capacity: u64) -> anyhow::Result<bool>;
}

/// Consent that refuses every request. Permission then has to come from a
/// privileged `kv_allow`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl Consent for DenyAll {
    async fn request(&self, _scope: &str, _origin: &str, _capacity: u64) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Consent that grants every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Consent for AllowAll {
    async fn request(&self, _scope: &str, _origin: &str, _capacity: u64) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Serves [`KvMethod`]s from a [`QuotaStore`].
#[derive(Clone)]
pub struct KvService {
    store: QuotaStore,
    consent: Arc<dyn Consent>,
}

impl std::fmt::Debug for KvService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvService")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

fn parse<T: DeserializeOwned>(method: KvMethod, params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::InvalidParams(format!("{method}: {e}")))
}

impl KvService {
    /// Create a service over `store` that asks `consent` for new permissions.
    pub fn new(store: QuotaStore, consent: Arc<dyn Consent>) -> Self {
        Self { store, consent }
    }

    /// The underlying store.
    pub fn store(&self) -> &QuotaStore {
        &self.store
    }

    /// Serve `kv_ask`, `kv_set` and `kv_get` on `router` for `origin`.
    pub fn register(&self, router: &Router, origin: &str) {
        self.register_methods(router, origin, &KvMethod::PUBLIC);
    }

    /// Serve every method, including `kv_allow`, on `router` for `origin`.
    pub fn register_privileged(&self, router: &Router, origin: &str) {
        self.register_methods(router, origin, &KvMethod::ALL);
    }

    fn register_methods(&self, router: &Router, origin: &str, methods: &[KvMethod]) {
        let origin: Arc<str> = Arc::from(origin);
        for &method in methods {
            let service = self.clone();
            let origin = Arc::clone(&origin);
            router.register_handler(method.as_str(), move |call: Call| {
                let service = service.clone();
                let origin = Arc::clone(&origin);
                async move { service.dispatch(&origin, call).await }
            });
        }
        log::debug!("[Kv] Serving {} method(s) for {origin} on router {}", methods.len(), router.id());
    }

    /// Handle one call on behalf of `origin`.
    pub async fn dispatch(&self, origin: &str, call: Call) -> anyhow::Result<Reply> {
        let method = KvMethod::try_from(call.method.as_str())?;
        let Call { params, transfer, .. } = call;

        let reply = match method {
            KvMethod::Ask => {
                let (scope, capacity): (String, u64) = parse(method, params)?;
                Reply::new(json!(self.ask(&scope, origin, capacity).await?))
            }
            KvMethod::Allow => {
                let (scope, target, capacity): (String, String, u64) = parse(method, params)?;
                let record = self.store.allow(&scope, &target, capacity).await?;
                Reply::new(serde_json::to_value(record)?)
            }
            KvMethod::Set => {
                let (scope, key): (String, String) = parse(method, params)?;
                let Some(value) = transfer.into_iter().next() else {
                    return Err(RpcError::InvalidParams(format!("{method}: missing value transferable")).into());
                };
                self.store.set(&scope, origin, &key, value).await?;
                Reply::default()
            }
            KvMethod::Get => {
                let (scope, key): (String, String) = parse(method, params)?;
                match self.store.get(&scope, origin, &key).await? {
                    Some(value) => Reply::with_transfer(json!({ "found": true }), vec![value]),
                    None => Reply::new(json!({ "found": false })),
                }
            }
        };
        Ok(reply)
    }

    async fn ask(&self, scope: &str, origin: &str, capacity: u64) -> anyhow::Result<bool> {
        if self.store.ask(scope, origin).await? {
            return Ok(true);
        }

        log::info!("[Kv] Asking consent for {origin} on {scope} ({capacity} bytes)");
        if !self.consent.request(scope, origin, capacity).await? {
            log::info!("[Kv] Consent refused for {origin} on {scope}");
            return Ok(false);
        }

        self.store.allow(scope, origin, capacity).await?;
        Ok(true)
    }
}
