//! In-process channel pair.
//!
//! Two `MemoryChannel` ends connected by unbounded tokio mpsc queues. Used
//! for contexts living in the same process and throughout the test suite.
//! Closing either end makes the peer's `recv` return `Closed` once the
//! already-queued frames are drained.

use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Channel, ChannelError, Frame};

/// One end of an in-process channel pair.
pub struct MemoryChannel {
    /// Sender towards the peer; taken on close.
    tx: StdMutex<Option<UnboundedSender<Frame>>>,
    /// Frames sent by the peer.
    rx: Mutex<UnboundedReceiver<Frame>>,
    /// Cancelled when this end is closed.
    closed: CancellationToken,
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl MemoryChannel {
    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();
        (Self::new(left_tx, left_rx), Self::new(right_tx, right_rx))
    }

    fn new(tx: UnboundedSender<Frame>, rx: UnboundedReceiver<Frame>) -> Self {
        Self {
            tx: StdMutex::new(Some(tx)),
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    /// Whether this end has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        let tx = self
            .tx
            .lock()
            .map_err(|e| ChannelError::SendFailed(format!("sender lock poisoned: {e}")))?
            .clone()
            .ok_or(ChannelError::Closed)?;
        tx.send(frame).map_err(|_closed| ChannelError::Closed)
    }

    async fn recv(&self) -> Result<Frame, ChannelError> {
        tokio::select! {
            () = self.closed.cancelled() => Err(ChannelError::Closed),
            frame = async { self.rx.lock().await.recv().await } => {
                frame.ok_or(ChannelError::Closed)
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }
}
