//! Transport abstraction
//!
//! One logical protocol, three physical channels. Every variant owns exactly
//! one physical channel and one session id, and implements the same four
//! operations: `start`, `send`, `register_handler`, `close`.
//!
//! Shared lifecycle rules live in [`TransportCore`]:
//! - messages that arrive before a handler is installed are buffered and
//!   flushed in arrival order when `register_handler` is called
//! - `close` is idempotent and fires the close hook exactly once
//! - after `close`, `send` fails with [`TransportError::Closed`]

pub mod http_stream;
pub mod pipe;
pub mod sse;

pub use http_stream::HttpStreamTransport;
pub use pipe::PipeTransport;
pub use sse::SseTransport;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{TransportError, TransportResult};
use crate::protocol::JsonRpcMessage;

/// Future returned by an inbound-message handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Inbound-message callback installed via `register_handler`
pub type MessageHandler = Arc<dyn Fn(JsonRpcMessage) -> HandlerFuture + Send + Sync>;

/// Hook invoked exactly once when a transport closes
pub type CloseHook = Box<dyn FnOnce() + Send>;

/// Which physical channel a transport instance speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Newline-delimited JSON over stdin/stdout
    Pipe,
    /// Server-Sent Events with a POST back-channel
    Sse,
    /// Chunked HTTP response streaming
    HttpStream,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pipe => write!(f, "pipe"),
            Self::Sse => write!(f, "sse"),
            Self::HttpStream => write!(f, "http-stream"),
        }
    }
}

/// Uniform transport contract, one instance per physical channel
#[async_trait]
pub trait Transport: Send + Sync {
    /// The channel variant this instance speaks
    fn kind(&self) -> TransportKind;

    /// The session id this instance is bound to
    fn session_id(&self) -> &str;

    /// Begin accepting input. Fails with `AlreadyStarted` on a second call.
    async fn start(self: Arc<Self>) -> TransportResult<()>;

    /// Serialize and write one JSON-RPC envelope.
    ///
    /// Fails with `Closed` after `close()`. Internal write failures close
    /// the transport and are reported through the close path rather than
    /// propagated, so a faulty client cannot crash the engine.
    async fn send(&self, message: JsonRpcMessage) -> TransportResult<()>;

    /// Install the inbound-message callback. Messages buffered before
    /// installation are flushed in arrival order first.
    async fn register_handler(&self, handler: MessageHandler);

    /// Release the physical channel. Idempotent; the close hook fires once.
    async fn close(&self);

    /// Whether `close()` has run
    fn is_closed(&self) -> bool;
}

/// Lifecycle states shared by all variants
const STATE_IDLE: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Handler slot plus pre-handler buffer, serialized so flushed and live
/// messages cannot interleave out of order
struct HandlerState {
    handler: Option<MessageHandler>,
    buffered: VecDeque<JsonRpcMessage>,
}

/// Shared state machine backing every transport variant
pub struct TransportCore {
    session_id: String,
    kind: TransportKind,
    state: AtomicU8,
    handler: AsyncMutex<HandlerState>,
    close_hook: Mutex<Option<CloseHook>>,
}

impl TransportCore {
    pub fn new(kind: TransportKind, session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            state: AtomicU8::new(STATE_IDLE),
            handler: AsyncMutex::new(HandlerState {
                handler: None,
                buffered: VecDeque::new(),
            }),
            close_hook: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Install the hook run exactly once on close
    pub fn set_close_hook(&self, hook: CloseHook) {
        let mut slot = self.close_hook.lock().expect("close hook lock poisoned");
        *slot = Some(hook);
    }

    /// Transition Idle -> Started
    pub fn mark_started(&self) -> TransportResult<()> {
        match self
            .state
            .compare_exchange(STATE_IDLE, STATE_STARTED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(STATE_STARTED) => Err(TransportError::AlreadyStarted),
            Err(_) => Err(TransportError::Closed),
        }
    }

    /// Whether sends are still allowed
    pub fn ensure_open(&self) -> TransportResult<()> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CLOSED
    }

    /// Transition to Closed and run the close hook. Returns false if the
    /// transport was already closed (the hook does not run again).
    pub fn mark_closed(&self) -> bool {
        let was_open = self.state.swap(STATE_CLOSED, Ordering::SeqCst) != STATE_CLOSED;
        if was_open {
            let hook = self
                .close_hook
                .lock()
                .expect("close hook lock poisoned")
                .take();
            if let Some(hook) = hook {
                hook();
            }
            tracing::debug!(session_id = %self.session_id, kind = %self.kind, "transport closed");
        }
        was_open
    }

    /// Route one inbound message to the handler, or buffer it until a
    /// handler is installed. The handler lock is held across the callback so
    /// a single transport processes messages strictly in arrival order.
    pub async fn dispatch(&self, message: JsonRpcMessage) {
        let mut state = self.handler.lock().await;
        match state.handler.clone() {
            Some(handler) => handler(message).await,
            None => {
                tracing::trace!(
                    session_id = %self.session_id,
                    "no handler installed yet, buffering inbound message"
                );
                state.buffered.push_back(message);
            }
        }
    }

    /// Install the handler and flush any buffered messages in arrival order
    pub async fn install_handler(&self, handler: MessageHandler) {
        let mut state = self.handler.lock().await;
        while let Some(message) = state.buffered.pop_front() {
            handler(message).await;
        }
        state.handler = Some(handler);
    }
}
