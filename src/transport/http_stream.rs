//! Chunked HTTP streaming transport
//!
//! One kept-open request/response pair: the inbound message is the POST
//! body, outbound envelopes are written as newline-delimited JSON chunks on
//! the response. The session id is echoed in a response header so a
//! stateless client can resume the same session on its next call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{MessageHandler, Transport, TransportCore, TransportKind};
use crate::error::{TransportError, TransportResult};
use crate::protocol::{self, JsonRpcMessage};

/// Header used to carry the session id in both directions
pub const SESSION_ID_HEADER: &str = "session-id";

/// One chunked HTTP response bound to one session
pub struct HttpStreamTransport {
    core: Arc<TransportCore>,
    sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
    responses_sent: AtomicUsize,
}

impl HttpStreamTransport {
    /// Create the transport plus the chunk receiver the HTTP layer turns
    /// into the response body
    pub fn new(session_id: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            core: Arc::new(TransportCore::new(TransportKind::HttpStream, session_id)),
            sender: Mutex::new(Some(tx)),
            responses_sent: AtomicUsize::new(0),
        });
        (transport, rx)
    }

    /// How many response envelopes (results or errors) have been written.
    /// The HTTP layer uses this to end a unary exchange once every request
    /// in the POST body has been answered.
    pub fn responses_sent(&self) -> usize {
        self.responses_sent.load(Ordering::SeqCst)
    }

    /// Install the hook run when the response stream closes
    pub fn set_close_hook(&self, hook: super::CloseHook) {
        self.core.set_close_hook(hook);
    }

    /// Route the inbound POST-body envelope to the registered handler
    pub async fn accept(&self, message: JsonRpcMessage) {
        self.core.dispatch(message).await;
    }
}

#[async_trait]
impl Transport for HttpStreamTransport {
    fn kind(&self) -> TransportKind {
        self.core.kind()
    }

    fn session_id(&self) -> &str {
        self.core.session_id()
    }

    async fn start(self: Arc<Self>) -> TransportResult<()> {
        // Chunk framing needs no preamble; starting only arms the state
        // machine so a second start (or a start after close) is rejected.
        self.core.mark_started()
    }

    async fn send(&self, message: JsonRpcMessage) -> TransportResult<()> {
        self.core.ensure_open()?;
        let is_response = matches!(
            message,
            JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_)
        );
        let mut chunk = protocol::encode(&message);
        chunk.push('\n');

        let pushed = {
            let sender = self.sender.lock().expect("chunk sender lock poisoned");
            match sender.as_ref() {
                Some(tx) => tx.send(chunk).is_ok(),
                None => false,
            }
        };
        if !pushed {
            tracing::warn!(
                session_id = %self.core.session_id(),
                "http stream client disconnected, closing transport"
            );
            self.close().await;
            return Err(TransportError::write_failed("http stream client disconnected"));
        }
        if is_response {
            self.responses_sent.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn register_handler(&self, handler: MessageHandler) {
        self.core.install_handler(handler).await;
    }

    async fn close(&self) {
        if self.core.mark_closed() {
            // Dropping the sender terminates the chunked response body.
            self.sender
                .lock()
                .expect("chunk sender lock poisoned")
                .take();
        }
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_send_writes_newline_delimited_chunks() {
        let (transport, mut rx) = HttpStreamTransport::new("sess-2");
        Arc::clone(&transport).start().await.unwrap();

        transport
            .send(JsonRpcMessage::response(json!({"n": 1}), json!(1)))
            .await
            .unwrap();
        transport
            .send(JsonRpcMessage::notification("message/partial", Some(json!({"n": 2}))))
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert!(first.ends_with('\n'));
        let parsed: Value = serde_json::from_str(first.trim()).unwrap();
        assert_eq!(parsed["result"]["n"], json!(1));

        let second = rx.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(second.trim()).unwrap();
        assert_eq!(parsed["method"], json!("message/partial"));
    }

    #[tokio::test]
    async fn test_close_ends_response_body() {
        let (transport, mut rx) = HttpStreamTransport::new("sess-2");
        Arc::clone(&transport).start().await.unwrap();
        transport.close().await;
        assert!(rx.recv().await.is_none());

        let err = transport
            .send(JsonRpcMessage::response(json!(null), json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn test_disconnect_triggers_close_hook_once() {
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (transport, rx) = HttpStreamTransport::new("sess-2");
        let hook_fired = Arc::clone(&fired);
        transport.set_close_hook(Box::new(move || {
            hook_fired.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        Arc::clone(&transport).start().await.unwrap();
        drop(rx);

        let _ = transport
            .send(JsonRpcMessage::response(json!(null), json!(1)))
            .await;
        transport.close().await;
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
