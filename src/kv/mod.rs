//! Permissioned, quota-limited key-value storage.
//!
//! - [`blob`] - the byte storage the store is layered on
//! - [`store`] - ACL and capacity accounting
//! - [`service`] - KV methods served over a router, bound to one origin
//! - [`client`] - typed caller for those methods

pub mod blob;
pub mod client;
pub mod service;
pub mod store;

pub use blob::{BlobStore, Bucket, MemoryBlobStore, MemoryBucket};
pub use client::KvClient;
pub use service::{AllowAll, Consent, DenyAll, KvMethod, KvService};
pub use store::{QuotaStore, ScopeRecord, Usage};
