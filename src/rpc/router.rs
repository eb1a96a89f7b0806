//! Request/response router over a single channel.
//!
//! A `Router` turns a raw [`Channel`] into a correlated RPC protocol:
//!
//! ```text
//!  caller task                 Router                          peer
//!      │  request(method)         │                              │
//!      │─────────────────────────>│ pending[id] = oneshot        │
//!      │                          │── Request { id, method } ───>│
//!      │                          │                              │
//!      │                          │<── Response { id, result } ──│
//!      │<─────────────────────────│ pending.remove(id)           │
//! ```
//!
//! # Lifecycle
//!
//! `Handshaking → Ready → Closed`. Construction spawns the reader task and
//! enters `Handshaking`. [`Router::hello`] races an active `hello` request
//! against a passive `hello` from the peer; whichever lands first makes the
//! router `Ready` and starts the liveness probe. The probe re-sends `hello`
//! every `probe_interval` and closes the router the first time it fails.
//! Closing is terminal: pending requests reject with `Closed`, future
//! requests fail immediately, and the channel is closed.
//!
//! # Cleanup
//!
//! Each in-flight request owns a guard that removes its pending entry on
//! every exit path (response, timeout, abort, closure, or the caller
//! dropping the future). A response arriving for an id that is no longer
//! pending is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock as StdRwLock, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::codec::{Message, Request, RequestId, Response};
use super::deadline::Deadline;
use super::error::RpcError;
use crate::channel::{Channel, ChannelError, Frame, Transferable};
use crate::config::Config;
use crate::constants::HELLO_METHOD;

/// An incoming call handed to a handler.
#[derive(Debug, Clone)]
pub struct Call {
    /// Correlation id assigned by the caller.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Method parameters.
    pub params: Value,
    /// Payloads transferred with the request.
    pub transfer: Vec<Transferable>,
}

/// A successful outcome: a JSON value plus transferred payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    /// Result value.
    pub value: Value,
    /// Payloads transferred with the response.
    pub transfer: Vec<Transferable>,
}

impl Reply {
    /// Reply with a value and no transferables.
    pub fn new(value: Value) -> Self {
        Self {
            value,
            transfer: Vec::new(),
        }
    }

    /// Reply with a value and transferables.
    pub fn with_transfer(value: Value, transfer: Vec<Transferable>) -> Self {
        Self { value, transfer }
    }
}

/// Future returned by a [`Handler`].
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Reply>>;

/// A registered method implementation.
pub type Handler = Arc<dyn Fn(Call) -> HandlerFuture + Send + Sync>;

/// Router lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    /// Reader attached, hello exchange not complete yet.
    Handshaking,
    /// Hello exchange complete, liveness probe running.
    Ready,
    /// Terminal.
    Closed,
}

type PendingTx = oneshot::Sender<Result<Reply, RpcError>>;

/// How an inbound request is served.
enum Inbound {
    /// Router-owned handshake/liveness method.
    Hello,
    /// User-registered handler.
    Handler(Handler),
    /// Nothing registered under that name.
    Unknown,
}

struct RouterInner {
    id: Uuid,
    channel: Arc<dyn Channel>,
    config: Config,
    next_id: AtomicU64,
    pending: StdMutex<HashMap<RequestId, PendingTx>>,
    handlers: StdRwLock<HashMap<String, Handler>>,
    /// Set once a `hello` request from the peer has been seen.
    hello_seen: watch::Sender<bool>,
    state: watch::Sender<RouterState>,
    closed: CancellationToken,
    close_reason: StdMutex<Option<String>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Correlated RPC endpoint over one channel.
///
/// Cheap to clone; all clones drive the same router. The router stays
/// alive until it is closed (explicitly, by handshake or liveness failure,
/// or by the transport), so callers that are done with it should call
/// [`Router::close`].
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

/// Non-owning reference to a [`Router`].
#[derive(Clone, Debug)]
pub struct WeakRouter {
    inner: Weak<RouterInner>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl WeakRouter {
    /// Upgrade to a strong handle if the router still exists.
    pub fn upgrade(&self) -> Option<Router> {
        self.inner.upgrade().map(|inner| Router { inner })
    }
}

impl Router {
    /// Create a router over `channel` and start reading from it.
    ///
    /// The router starts in [`RouterState::Handshaking`]. Register handlers,
    /// then call [`Router::hello`]. Must be called inside a tokio runtime.
    pub fn new(channel: impl Channel + 'static, config: Config) -> Self {
        Self::from_shared(Arc::new(channel), config)
    }

    /// Like [`Router::new`] for a channel that is already shared.
    pub fn from_shared(channel: Arc<dyn Channel>, config: Config) -> Self {
        let inner = Arc::new(RouterInner {
            id: Uuid::new_v4(),
            channel,
            config,
            next_id: AtomicU64::new(0),
            pending: StdMutex::new(HashMap::new()),
            handlers: StdRwLock::new(HashMap::new()),
            hello_seen: watch::Sender::new(false),
            state: watch::Sender::new(RouterState::Handshaking),
            closed: CancellationToken::new(),
            close_reason: StdMutex::new(None),
        });

        log::debug!("[Router {}] Created", inner.id);
        tokio::spawn(read_loop(Arc::clone(&inner)));

        Self { inner }
    }

    /// Create a router and complete the handshake within the configured
    /// handshake timeout.
    ///
    /// For routers that serve methods, prefer [`Router::new`] followed by
    /// handler registration and [`Router::hello`], so no early request
    /// from the peer hits an empty handler table.
    pub async fn connect(channel: impl Channel + 'static, config: Config) -> Result<Self, RpcError> {
        let deadline = Deadline::after(config.handshake_timeout());
        let router = Self::new(channel, config);
        router.hello(deadline).await?;
        Ok(router)
    }

    /// Unique identifier of this router instance.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RouterState {
        *self.inner.state.borrow()
    }

    /// Whether the router is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Why the router closed, if it has.
    pub fn close_reason(&self) -> Option<String> {
        lock(&self.inner.close_reason).clone()
    }

    /// Number of requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Configuration this router was created with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Non-owning handle to this router.
    pub fn downgrade(&self) -> WeakRouter {
        WeakRouter {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Resolves once the router is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Token cancelled when the router closes.
    ///
    /// Lets observers wait for closure without keeping the router alive.
    /// Cancelling the returned token has no effect on the router.
    pub fn close_signal(&self) -> CancellationToken {
        self.inner.closed.child_token()
    }

    /// Close the router. Idempotent.
    pub fn close(&self) {
        self.inner.close("closed locally");
    }

    /// Register `handler` for `method`, replacing any previous handler.
    ///
    /// The handler's outcome (value or error) is always turned into exactly
    /// one response. `hello` is reserved and cannot be registered.
    pub fn register_handler<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
    {
        let method = method.into();
        if method == HELLO_METHOD {
            log::warn!("[Router {}] Refusing to register reserved method {method}", self.inner.id);
            return;
        }

        let handler: Handler = Arc::new(move |call| handler(call).boxed());
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.insert(method.clone(), handler).is_some() {
            log::debug!("[Router {}] Replaced handler for {method}", self.inner.id);
        }
    }

    /// Complete the hello handshake.
    ///
    /// Sends an active `hello` and concurrently waits for the peer's own
    /// `hello`; the first to succeed makes the router `Ready` (exactly once)
    /// and starts the liveness probe. On failure the router is closed.
    pub async fn hello(&self, deadline: Deadline) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }

        let mut passive = self.inner.hello_seen.subscribe();
        let outcome = tokio::select! {
            biased;
            seen = async { passive.wait_for(|seen| *seen).await.is_ok() } => {
                if seen { Ok(()) } else { Err(RpcError::Closed) }
            }
            reply = self.request(HELLO_METHOD, Value::Null, Vec::new(), deadline) => {
                reply.map(|_| ())
            }
        };

        match outcome {
            Ok(()) => {
                if self.inner.mark_ready() {
                    log::info!("[Router {}] Ready", self.inner.id);
                    tokio::spawn(probe_loop(self.clone()));
                }
                if self.is_closed() {
                    return Err(RpcError::Closed);
                }
                Ok(())
            }
            Err(error) => {
                self.inner.close(&format!("handshake failed: {error}"));
                Err(error)
            }
        }
    }

    /// Send a request and wait for its response.
    ///
    /// Resolves with the first of: the correlated response, the deadline
    /// (`Timeout` / `Aborted`), or router closure (`Closed`). The pending
    /// entry is removed on every path.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        transfer: Vec<Transferable>,
        deadline: Deadline,
    ) -> Result<Reply, RpcError> {
        let inner = &self.inner;
        let (id, response_rx) = inner.register_pending()?;
        let _pending = scopeguard::guard(id, |id| inner.forget(id));

        let text = Message::from(Request {
            id,
            method: method.to_string(),
            params,
        })
        .encode();
        log::debug!("[Router {}] -> {method} #{id}", inner.id);

        if let Err(error) = inner.channel.send(Frame::with_transfer(text, transfer)).await {
            if error == ChannelError::Closed {
                inner.close("channel closed while sending");
            }
            return Err(error.into());
        }

        tokio::select! {
            biased;
            response = response_rx => response.unwrap_or(Err(RpcError::Closed)),
            error = deadline.expired() => {
                log::debug!("[Router {}] {method} #{id} gave up: {error}", inner.id);
                Err(error)
            }
            () = inner.closed.cancelled() => Err(RpcError::Closed),
        }
    }
}

impl RouterInner {
    fn register_pending(&self) -> Result<(RequestId, oneshot::Receiver<Result<Reply, RpcError>>), RpcError> {
        let mut pending = lock(&self.pending);
        if self.closed.is_cancelled() {
            return Err(RpcError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        pending.insert(id, tx);
        Ok((id, rx))
    }

    fn forget(&self, id: RequestId) {
        lock(&self.pending).remove(&id);
    }

    /// Returns true for the single call that moves `Handshaking` to `Ready`.
    fn mark_ready(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == RouterState::Handshaking {
                *state = RouterState::Ready;
                true
            } else {
                false
            }
        })
    }

    fn close(&self, reason: &str) {
        {
            let mut close_reason = lock(&self.close_reason);
            if close_reason.is_some() {
                return;
            }
            *close_reason = Some(reason.to_string());
        }

        self.closed.cancel();
        let abandoned = {
            let mut pending = lock(&self.pending);
            let count = pending.len();
            // Dropping the senders rejects every waiting request
            pending.clear();
            count
        };
        self.state.send_replace(RouterState::Closed);
        self.channel.close();

        log::info!(
            "[Router {}] Closed ({reason}), {abandoned} pending request(s) rejected",
            self.id
        );
    }

    fn route(&self, method: &str) -> Inbound {
        if method == HELLO_METHOD {
            return Inbound::Hello;
        }
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        match handlers.get(method) {
            Some(handler) => Inbound::Handler(Arc::clone(handler)),
            None => Inbound::Unknown,
        }
    }

    async fn respond(&self, id: RequestId, outcome: Result<Reply, RpcError>) {
        let (outcome, transfer) = match outcome {
            Ok(reply) => (Ok(reply.value), reply.transfer),
            Err(error) => (Err(error), Vec::new()),
        };
        let text = Message::from(Response { id, outcome }).encode();
        if let Err(error) = self.channel.send(Frame::with_transfer(text, transfer)).await {
            log::debug!("[Router {}] Could not answer #{id}: {error}", self.id);
        }
    }

    fn resolve(&self, response: Response, transfer: Vec<Transferable>) {
        let Response { id, outcome } = response;
        let Some(tx) = lock(&self.pending).remove(&id) else {
            log::debug!("[Router {}] Dropping response for unknown request #{id}", self.id);
            return;
        };
        // The caller may have stopped waiting in the meantime
        let _ = tx.send(outcome.map(|value| Reply { value, transfer }));
    }
}

/// Reads frames until the router or the channel closes.
async fn read_loop(inner: Arc<RouterInner>) {
    loop {
        let frame = tokio::select! {
            () = inner.closed.cancelled() => return,
            frame = inner.channel.recv() => frame,
        };

        match frame {
            Ok(frame) => on_frame(&inner, frame).await,
            Err(error) => {
                inner.close(&format!("transport error: {error}"));
                return;
            }
        }
    }
}

async fn on_frame(inner: &Arc<RouterInner>, frame: Frame) {
    let Frame { text, transfer } = frame;
    let message = match Message::decode(&text) {
        Ok(message) => message,
        Err(error) => {
            log::warn!("[Router {}] Dropping malformed frame: {error}", inner.id);
            return;
        }
    };

    match message {
        Message::Response(response) => inner.resolve(response, transfer),
        Message::Request(Request { id, method, params }) => match inner.route(&method) {
            Inbound::Hello => {
                inner.hello_seen.send_replace(true);
                inner.respond(id, Ok(Reply::default())).await;
            }
            Inbound::Unknown => {
                log::debug!("[Router {}] <- {method} #{id}: no handler", inner.id);
                inner.respond(id, Err(RpcError::MethodNotFound(method))).await;
            }
            Inbound::Handler(handler) => {
                log::debug!("[Router {}] <- {method} #{id}", inner.id);
                let call = Call {
                    id,
                    method,
                    params,
                    transfer,
                };
                tokio::spawn(run_handler(Arc::clone(inner), handler, call));
            }
        },
    }
}

/// Runs one handler and sends exactly one response for it, even if the
/// handler panics.
async fn run_handler(inner: Arc<RouterInner>, handler: Handler, call: Call) {
    let id = call.id;
    let method = call.method.clone();

    // Invoked inside the task so a panic while building the future is caught too
    let outcome = match tokio::spawn(async move { handler(call).await }).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(error)) => {
            log::warn!("[Router {}] {method} #{id} failed: {error:#}", inner.id);
            Err(RpcError::from_handler(&error))
        }
        Err(join_error) => {
            log::error!("[Router {}] {method} #{id} panicked: {join_error}", inner.id);
            Err(RpcError::Internal(format!("handler for {method} panicked")))
        }
    };

    inner.respond(id, outcome).await;
}

/// Liveness probe: one `hello` per interval, close on the first failure.
async fn probe_loop(router: Router) {
    let interval = router.inner.config.probe_interval();
    let timeout = router.inner.config.probe_timeout();

    loop {
        let probe = router
            .request(HELLO_METHOD, Value::Null, Vec::new(), Deadline::after(timeout))
            .await;

        if let Err(error) = probe {
            if !router.is_closed() {
                log::warn!("[Router {}] Liveness probe failed: {error}", router.inner.id);
                router.inner.close(&format!("liveness probe failed: {error}"));
            }
            return;
        }

        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = router.inner.closed.cancelled() => return,
        }
    }
}
