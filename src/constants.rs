//! Protocol-wide constants for kvgate.
//!
//! Timeouts here are the defaults baked into [`crate::config::Config`];
//! every one of them can be overridden at load time.
//!
//! # Categories
//!
//! - **Protocol**: reserved method names
//! - **Timeouts**: handshake, liveness and forwarding deadlines
//! - **Storage**: reserved scope and bookkeeping key prefixes

use std::time::Duration;

// ============================================================================
// Protocol
// ============================================================================

/// Method used for both the handshake and the liveness probe.
///
/// Handled by the router itself; user code can never register it.
pub const HELLO_METHOD: &str = "hello";

/// Method exposed by the bridge for forwarding calls to the privileged router.
pub const PROXY_METHOD: &str = "proxy";

// ============================================================================
// Timeouts
// ============================================================================

/// How long `Router::connect` waits for the hello exchange to complete.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Pause between two successful liveness probes.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(1000);

/// Deadline for a single liveness probe.
///
/// A peer that does not answer within this window is considered gone and
/// the router closes.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Deadline applied by the bridge when forwarding a `proxy` call.
///
/// Long enough to cover calls that wait on user consent.
pub const PROXY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default deadline used by [`crate::kv::KvClient`] calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Storage
// ============================================================================

/// Scope reserved for the store's own bookkeeping (ACL and size ledger).
///
/// Never addressable by callers.
pub const META_SCOPE: &str = "meta";

/// Key prefix of ACL records inside [`META_SCOPE`].
pub const ACL_KEY_PREFIX: &str = "acl";

/// Key prefix of size ledger entries inside [`META_SCOPE`].
pub const SIZE_KEY_PREFIX: &str = "size";
