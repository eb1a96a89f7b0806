//! Channel abstraction for message-passing between contexts.
//!
//! A `Channel` is the only thing the router knows about its peer: an
//! ordered-per-direction, message-oriented pipe with optional out-of-band
//! payloads and an explicit close. How two contexts obtain a channel in the
//! first place is up to the embedding application.
//!
//! # Architecture
//!
//! ```text
//! Channel (trait)
//!     │
//!     ├── MemoryChannel (in-process pair, tokio mpsc)
//!     │
//!     └── (application transports: ports, sockets, workers, ...)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let (left, right) = MemoryChannel::pair();
//!
//! left.send(Frame::text(r#"{"id":0,"method":"hello"}"#)).await?;
//! let frame = right.recv().await?;
//! ```
//!
//! Frames carry UTF-8 text (the JSON encoding produced by
//! [`crate::rpc::codec`]) plus any number of [`Transferable`] payloads that
//! travel next to the text without being encoded into it.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;

pub use memory::MemoryChannel;

/// Out-of-band binary payload moved alongside a frame.
pub type Transferable = Bytes;

/// One message on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Encoded message text.
    pub text: String,
    /// Payloads transferred with the message, in order.
    pub transfer: Vec<Transferable>,
}

impl Frame {
    /// Create a frame without transferables.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            transfer: Vec::new(),
        }
    }

    /// Create a frame carrying transferables.
    pub fn with_transfer(text: impl Into<String>, transfer: Vec<Transferable>) -> Self {
        Self {
            text: text.into(),
            transfer,
        }
    }
}

/// Errors that can occur during channel operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Failed to send message.
    SendFailed(String),
    /// Channel was closed (locally or by the peer).
    Closed,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::Closed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// A bidirectional message channel to exactly one peer.
///
/// `send` may be called concurrently from many tasks. `recv` is only ever
/// driven by a single reader task at a time.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send a frame to the peer.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Closed` if either side closed the channel, or
    /// `ChannelError::SendFailed` for transport-specific failures.
    async fn send(&self, frame: Frame) -> Result<(), ChannelError>;

    /// Receive the next frame from the peer.
    ///
    /// Waits until a frame is available or the channel is closed.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Closed` once no more frames can arrive.
    async fn recv(&self) -> Result<Frame, ChannelError>;

    /// Close the channel. Idempotent.
    ///
    /// Pending and future `recv` calls on this side return `Closed`.
    fn close(&self);
}
