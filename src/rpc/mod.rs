//! Correlated request/response protocol over a [`crate::channel::Channel`].
//!
//! - [`codec`] - the two JSON wire shapes
//! - [`router`] - pending table, handler table, handshake and liveness
//! - [`deadline`] - per-request timeout and cancellation
//! - [`error`] - error taxonomy shared by every layer

pub mod codec;
pub mod deadline;
pub mod error;
pub mod router;

pub use codec::{Message, Request, RequestId, Response};
pub use deadline::Deadline;
pub use error::{ErrorObject, RpcError};
pub use router::{Call, Handler, HandlerFuture, Reply, Router, RouterState, WeakRouter};
