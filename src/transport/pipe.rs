//! Process-pipe transport
//!
//! Newline-delimited JSON-RPC over an input/output stream pair, stdin/stdout
//! in production. The output stream carries protocol traffic exclusively;
//! all diagnostics go through tracing on stderr so framing is never
//! corrupted. A line that fails to parse is answered with a `-32700` parse
//! error (`id: null`) and the read loop keeps going.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;

use super::{MessageHandler, Transport, TransportCore, TransportKind};
use crate::error::{ProtocolError, TransportError, TransportResult};
use crate::protocol::{self, JsonRpcError, JsonRpcMessage};

/// Transport over a pipe-like reader/writer pair.
///
/// Generic over the streams so tests can drive it with `tokio::io::duplex`.
pub struct PipeTransport<R, W> {
    core: Arc<TransportCore>,
    reader: Mutex<Option<R>>,
    writer: Arc<AsyncMutex<W>>,
}

impl PipeTransport<tokio::io::Stdin, tokio::io::Stdout> {
    /// Pipe transport over the process's stdin/stdout
    pub fn stdio(session_id: impl Into<String>) -> Self {
        Self::new(session_id, tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> PipeTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Create a pipe transport over an arbitrary stream pair
    pub fn new(session_id: impl Into<String>, reader: R, writer: W) -> Self {
        Self {
            core: Arc::new(TransportCore::new(TransportKind::Pipe, session_id)),
            reader: Mutex::new(Some(reader)),
            writer: Arc::new(AsyncMutex::new(writer)),
        }
    }

    /// Install the hook run when the transport closes
    pub fn set_close_hook(&self, hook: super::CloseHook) {
        self.core.set_close_hook(hook);
    }

    /// Write one newline-terminated envelope to the output stream
    async fn write_line(
        writer: &AsyncMutex<W>,
        message: &JsonRpcMessage,
    ) -> std::io::Result<()> {
        let mut line = protocol::encode(message);
        line.push('\n');
        let mut guard = writer.lock().await;
        guard.write_all(line.as_bytes()).await?;
        guard.flush().await
    }

    /// Read loop: one JSON-RPC envelope per line until EOF or close
    async fn run_read_loop(self: Arc<Self>) {
        let reader = match self.reader.lock().expect("reader lock poisoned").take() {
            Some(reader) => reader,
            None => return,
        };
        let mut lines = BufReader::new(reader);
        let mut buffer = String::new();

        loop {
            buffer.clear();
            let read = match lines.read_line(&mut buffer).await {
                Ok(read) => read,
                Err(e) => {
                    tracing::warn!(session_id = %self.core.session_id(), error = %e, "pipe read failed");
                    break;
                }
            };
            if read == 0 {
                tracing::debug!(session_id = %self.core.session_id(), "pipe reached EOF");
                break;
            }
            let line = buffer.trim();
            if line.is_empty() {
                continue;
            }

            match protocol::decode(line) {
                Ok(message) => self.core.dispatch(message).await,
                Err(err) => {
                    // A malformed line gets an error response, never a crash.
                    let id = match &err {
                        ProtocolError::Parse(_) => serde_json::Value::Null,
                        _ => protocol::extract_id(line),
                    };
                    tracing::warn!(
                        session_id = %self.core.session_id(),
                        error = %err,
                        "rejecting malformed inbound line"
                    );
                    let reply = JsonRpcMessage::error(JsonRpcError::from(&err), id);
                    if let Err(e) = Self::write_line(&self.writer, &reply).await {
                        tracing::warn!(error = %e, "failed to write error reply, closing pipe");
                        break;
                    }
                }
            }
        }

        self.close().await;
    }
}

#[async_trait]
impl<R, W> Transport for PipeTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn kind(&self) -> TransportKind {
        self.core.kind()
    }

    fn session_id(&self) -> &str {
        self.core.session_id()
    }

    async fn start(self: Arc<Self>) -> TransportResult<()> {
        self.core.mark_started()?;
        let transport = Arc::clone(&self);
        tokio::spawn(async move {
            transport.run_read_loop().await;
        });
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> TransportResult<()> {
        self.core.ensure_open()?;
        if let Err(e) = Self::write_line(&self.writer, &message).await {
            // Write failures are contained: close the channel and report
            // through the close path instead of bubbling up to the caller.
            tracing::warn!(
                session_id = %self.core.session_id(),
                error = %e,
                "pipe write failed, closing transport"
            );
            self.core.mark_closed();
            return Err(TransportError::from(e));
        }
        Ok(())
    }

    async fn register_handler(&self, handler: MessageHandler) {
        self.core.install_handler(handler).await;
    }

    async fn close(&self) {
        if self.core.mark_closed() {
            let mut guard = self.writer.lock().await;
            let _ = guard.shutdown().await;
        }
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}
