//! Server-Sent Events transport
//!
//! The response body is not bidirectional: on connect the transport emits an
//! `endpoint` event carrying the URL the client must POST envelopes to, then
//! pushes one `message` event per outbound envelope. Inbound messages arrive
//! through the POST handler, which routes them here by session id via
//! [`SseTransport::accept`]. Heartbeat comments keep idle connections alive
//! through intermediaries.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::response::sse::Event;
use tokio::sync::mpsc;

use super::{MessageHandler, Transport, TransportCore, TransportKind};
use crate::error::{TransportError, TransportResult};
use crate::protocol::{self, JsonRpcMessage};

/// Default heartbeat spacing when the config does not override it
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

/// One SSE connection bound to one session
pub struct SseTransport {
    core: Arc<TransportCore>,
    sender: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    /// POST URL advertised in the `endpoint` event
    endpoint: String,
    heartbeat: Duration,
}

impl SseTransport {
    /// Create the transport plus the event receiver the HTTP layer turns
    /// into the response stream
    pub fn new(
        session_id: impl Into<String>,
        endpoint_base: &str,
        heartbeat: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let session_id = session_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = format!("{endpoint_base}?sessionId={session_id}");
        let transport = Arc::new(Self {
            core: Arc::new(TransportCore::new(TransportKind::Sse, session_id)),
            sender: Mutex::new(Some(tx)),
            endpoint,
            heartbeat,
        });
        (transport, rx)
    }

    /// Install the hook run when the connection closes
    pub fn set_close_hook(&self, hook: super::CloseHook) {
        self.core.set_close_hook(hook);
    }

    /// The POST URL clients use for inbound messages
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Route one inbound envelope (from the POST handler) to the registered
    /// handler
    pub async fn accept(&self, message: JsonRpcMessage) {
        self.core.dispatch(message).await;
    }

    fn push_event(&self, event: Event) -> TransportResult<()> {
        let sender = self.sender.lock().expect("sse sender lock poisoned");
        match sender.as_ref() {
            Some(tx) if tx.send(event).is_ok() => Ok(()),
            _ => Err(TransportError::write_failed("sse client disconnected")),
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        self.core.kind()
    }

    fn session_id(&self) -> &str {
        self.core.session_id()
    }

    async fn start(self: Arc<Self>) -> TransportResult<()> {
        self.core.mark_started()?;

        // The endpoint event must be the first thing on the wire so the
        // client learns where to POST before it needs to.
        self.push_event(Event::default().event("endpoint").data(self.endpoint.clone()))?;

        let transport = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(transport.heartbeat);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if transport.is_closed() {
                    break;
                }
                if transport
                    .push_event(Event::default().comment("heartbeat"))
                    .is_err()
                {
                    transport.close().await;
                    break;
                }
            }
        });
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> TransportResult<()> {
        self.core.ensure_open()?;
        let event = Event::default()
            .event("message")
            .data(protocol::encode(&message));
        if let Err(e) = self.push_event(event) {
            tracing::warn!(
                session_id = %self.core.session_id(),
                error = %e,
                "sse push failed, closing transport"
            );
            self.close().await;
            return Err(e);
        }
        Ok(())
    }

    async fn register_handler(&self, handler: MessageHandler) {
        self.core.install_handler(handler).await;
    }

    async fn close(&self) {
        if self.core.mark_closed() {
            // Dropping the sender ends the response stream.
            self.sender
                .lock()
                .expect("sse sender lock poisoned")
                .take();
        }
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}
