//! kvgate - permissioned key-value storage over message channels.
//!
//! This crate connects isolated execution contexts through a correlated
//! request/response protocol and serves a quota-limited key-value store on
//! top of it.
//!
//! # Architecture
//!
//! ```text
//! caller ── Router ══ Channel ══ Router ── KvService ── QuotaStore ── BlobStore
//!                                   │
//!                                 Bridge (proxy) ──> privileged Router
//! ```
//!
//! - **Router** - pending and handler tables, hello handshake, liveness probe
//! - **QuotaStore** - per-(scope, origin) ACL with a capacity ratchet
//! - **Bridge** - forwards `proxy` calls to whichever router is attached
//!
//! # Modules
//!
//! - [`channel`] - transport abstraction and the in-memory pair
//! - [`rpc`] - wire codec, errors, deadlines and the router
//! - [`kv`] - blob store, quota store, KV service and client
//! - [`bridge`] - single-slot forwarding proxy
//! - [`config`] - timeouts, loaded from file and environment

pub mod bridge;
pub mod channel;
pub mod config;
pub mod constants;
pub mod kv;
pub mod rpc;

// Re-export commonly used types
pub use bridge::Bridge;
pub use channel::{Channel, ChannelError, Frame, MemoryChannel, Transferable};
pub use config::Config;
pub use kv::{KvClient, KvService, QuotaStore};
pub use rpc::{Deadline, Router, RouterState, RpcError};
