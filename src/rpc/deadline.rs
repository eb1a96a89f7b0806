//! Request deadlines and cancellation.
//!
//! A `Deadline` combines an optional point in time with an optional
//! cancellation token. Whichever fires first ends the request: an elapsed
//! instant yields `Timeout`, a cancelled token yields `Aborted`.

use std::future::pending;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::RpcError;

/// When a request stops waiting for its response.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    at: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl Deadline {
    /// Wait forever (until the router closes).
    pub fn never() -> Self {
        Self::default()
    }

    /// Expire `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    /// Expire at `instant`.
    pub fn at(instant: Instant) -> Self {
        Self {
            at: Some(instant),
            cancel: None,
        }
    }

    /// Abort when `token` is cancelled.
    pub fn cancelled_by(token: CancellationToken) -> Self {
        Self {
            at: None,
            cancel: Some(token),
        }
    }

    /// Also abort when `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Whether the deadline has already fired.
    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| at <= Instant::now())
            || self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Resolves with the error to report once the deadline fires.
    ///
    /// Never resolves for [`Deadline::never`].
    pub(crate) async fn expired(&self) -> RpcError {
        let elapsed = async {
            match self.at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => pending::<()>().await,
            }
        };
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = cancelled => RpcError::Aborted,
            () = elapsed => RpcError::Timeout,
        }
    }
}
