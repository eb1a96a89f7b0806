//! RPC error taxonomy and its wire representation.
//!
//! Every failure a caller can observe maps to one `RpcError` variant with a
//! stable string code. Errors returned by a remote handler arrive as
//! `{ code, message }` and are mapped back to the typed variant by code, so
//! `NotAllowed` raised three routers away is still `NotAllowed` here.

use serde::{Deserialize, Serialize};

use crate::channel::ChannelError;

/// Wire codes for each error kind.
pub mod code {
    /// Request named an unregistered method.
    pub const METHOD_NOT_FOUND: &str = "MethodNotFound";
    /// Params did not match the method's expected shape.
    pub const INVALID_PARAMS: &str = "InvalidParams";
    /// ACL check failed or the scope is reserved.
    pub const NOT_ALLOWED: &str = "NotAllowed";
    /// Write would exceed the granted capacity.
    pub const TOO_BIG: &str = "TooBig";
    /// Bridge has no live target.
    pub const NOT_CONNECTED: &str = "NotConnected";
    /// Request deadline elapsed.
    pub const TIMEOUT: &str = "Timeout";
    /// Request was cancelled by the caller.
    pub const ABORTED: &str = "Aborted";
    /// Router is closed.
    pub const CLOSED: &str = "Closed";
    /// Any other handler failure.
    pub const INTERNAL: &str = "InternalError";
}

/// `{ code, message }` object carried in an error Response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Stable error code (see [`code`]).
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

/// Errors surfaced by routers, handlers and the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// No handler is registered for the method.
    MethodNotFound(String),
    /// Params could not be interpreted.
    InvalidParams(String),
    /// ACL check failed.
    NotAllowed,
    /// Capacity check failed.
    TooBig,
    /// Bridge has no current target.
    NotConnected,
    /// The request deadline elapsed.
    Timeout,
    /// The request was cancelled.
    Aborted,
    /// The router is closed; fatal for that router.
    Closed,
    /// Handler failed for another reason.
    Internal(String),
    /// Error with a code this side does not know.
    Remote {
        /// Code as received.
        code: String,
        /// Message as received.
        message: String,
    },
}

impl RpcError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &str {
        match self {
            Self::MethodNotFound(_) => code::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => code::INVALID_PARAMS,
            Self::NotAllowed => code::NOT_ALLOWED,
            Self::TooBig => code::TOO_BIG,
            Self::NotConnected => code::NOT_CONNECTED,
            Self::Timeout => code::TIMEOUT,
            Self::Aborted => code::ABORTED,
            Self::Closed => code::CLOSED,
            Self::Internal(_) => code::INTERNAL,
            Self::Remote { code, .. } => code,
        }
    }

    /// Convert to the object sent in an error Response.
    pub fn to_object(&self) -> ErrorObject {
        let message = match self {
            Self::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorObject {
            code: self.code().to_string(),
            message,
        }
    }

    /// Rebuild a typed error from a received error object.
    pub fn from_object(object: ErrorObject) -> Self {
        let ErrorObject { code, message } = object;
        match code.as_str() {
            code::METHOD_NOT_FOUND => {
                Self::MethodNotFound(strip_prefix(&message, "Method not found: "))
            }
            code::INVALID_PARAMS => {
                Self::InvalidParams(strip_prefix(&message, "Invalid params: "))
            }
            code::NOT_ALLOWED => Self::NotAllowed,
            code::TOO_BIG => Self::TooBig,
            code::NOT_CONNECTED => Self::NotConnected,
            code::TIMEOUT => Self::Timeout,
            code::ABORTED => Self::Aborted,
            code::CLOSED => Self::Closed,
            code::INTERNAL => Self::Internal(strip_prefix(&message, "Internal error: ")),
            _ => Self::Remote { code, message },
        }
    }

    /// Map a handler failure to the error sent back to the caller.
    ///
    /// An `RpcError` anywhere in the chain keeps its own code; everything
    /// else becomes `Internal` with the full context chain as message.
    pub fn from_handler(error: &anyhow::Error) -> Self {
        if let Some(rpc) = error.chain().find_map(|e| e.downcast_ref::<RpcError>()) {
            return rpc.clone();
        }
        Self::Internal(format!("{error:#}"))
    }
}

fn strip_prefix(message: &str, prefix: &str) -> String {
    message.strip_prefix(prefix).unwrap_or(message).to_string()
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MethodNotFound(method) => write!(f, "Method not found: {method}"),
            Self::InvalidParams(msg) => write!(f, "Invalid params: {msg}"),
            Self::NotAllowed => write!(f, "Not allowed"),
            Self::TooBig => write!(f, "Too big"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::Timeout => write!(f, "Request timed out"),
            Self::Aborted => write!(f, "Request aborted"),
            Self::Closed => write!(f, "Router closed"),
            Self::Internal(msg) => write!(f, "Internal error: {msg}"),
            Self::Remote { code, message } => write!(f, "{code}: {message}"),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<ChannelError> for RpcError {
    fn from(error: ChannelError) -> Self {
        match error {
            ChannelError::Closed => Self::Closed,
            ChannelError::SendFailed(msg) => Self::Internal(format!("send failed: {msg}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_known_codes_map_back_to_variants() {
        for error in [
            RpcError::MethodNotFound("kv_nope".to_string()),
            RpcError::InvalidParams("expected array".to_string()),
            RpcError::NotAllowed,
            RpcError::TooBig,
            RpcError::NotConnected,
            RpcError::Timeout,
            RpcError::Aborted,
            RpcError::Closed,
            RpcError::Internal("boom".to_string()),
        ] {
            assert_eq!(RpcError::from_object(error.to_object()), error);
        }
    }

    #[test]
    fn test_unknown_code_is_kept_verbatim() {
        let object = ErrorObject {
            code: "UserRejected".to_string(),
            message: "User rejected".to_string(),
        };
        let error = RpcError::from_object(object.clone());
        assert_eq!(error.code(), "UserRejected");
        assert_eq!(error.to_object(), object);
    }

    #[test]
    fn test_handler_error_keeps_rpc_code_through_context() {
        let err = anyhow::Error::new(RpcError::TooBig).context("writing entry");
        assert_eq!(RpcError::from_handler(&err), RpcError::TooBig);

        let err: anyhow::Result<()> = Err(anyhow::anyhow!("disk on fire")).context("writing entry");
        let mapped = RpcError::from_handler(&err.unwrap_err());
        assert_eq!(mapped.code(), code::INTERNAL);
        assert!(mapped.to_string().contains("disk on fire"));
    }
}
