//! HTTP front-end for the SSE and chunked-streaming transports
//!
//! Routes:
//! - `GET /sse` opens the event stream; the first event is `endpoint` with
//!   the POST URL for inbound messages
//! - `POST /messages?sessionId=…` (or `Session-Id` header) carries inbound
//!   envelopes for an SSE session
//! - `POST /stream` is the chunked transport: newline-delimited request
//!   envelopes in the body, newline-delimited chunks in the response, the
//!   session id echoed in the `Session-Id` response header
//! - `GET /healthz` liveness probe

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::engine::ProtocolEngine;
use crate::protocol::{self, JsonRpcError, JsonRpcMessage};
use crate::transport::http_stream::SESSION_ID_HEADER;
use crate::transport::{HttpStreamTransport, SseTransport, Transport};

/// POST path advertised in the SSE `endpoint` event
pub const MESSAGES_PATH: &str = "/messages";

/// HTTP front-end settings
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    /// Bind address, e.g. `127.0.0.1:8808`
    pub bind: String,
    /// Spacing of SSE heartbeat comments
    pub heartbeat: Duration,
    /// Patience for in-flight responses after a `/stream` body ends
    pub drain_grace: Duration,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8808".to_string(),
            heartbeat: crate::transport::sse::DEFAULT_HEARTBEAT,
            drain_grace: Duration::from_secs(65),
        }
    }
}

/// Shared router state: the engine plus the live SSE transport instances,
/// keyed by session id so the POST handler can route inbound messages
pub struct ServerState {
    engine: Arc<ProtocolEngine>,
    config: HttpServerConfig,
    sse_transports: Mutex<HashMap<String, Arc<SseTransport>>>,
}

impl ServerState {
    pub fn new(engine: Arc<ProtocolEngine>, config: HttpServerConfig) -> Arc<Self> {
        Arc::new(Self {
            engine,
            config,
            sse_transports: Mutex::new(HashMap::new()),
        })
    }

    fn sse_transport(&self, session_id: &str) -> Option<Arc<SseTransport>> {
        self.sse_transports
            .lock()
            .expect("sse map lock poisoned")
            .get(session_id)
            .cloned()
    }
}

/// Build the router; exposed separately so tests can drive it in-process
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/sse", get(handle_sse_connect))
        .route(MESSAGES_PATH, post(handle_sse_message))
        .route("/stream", post(handle_stream))
        .route("/healthz", get(handle_healthz))
        .with_state(state)
}

/// Bind and serve until ctrl-c
pub async fn serve(engine: Arc<ProtocolEngine>, config: HttpServerConfig) -> crate::error::Result<()> {
    let listener = TcpListener::bind(&config.bind).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "http front-end listening");

    let state = ServerState::new(engine, config);
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn handle_healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn handle_sse_connect(State(state): State<Arc<ServerState>>) -> Response {
    let session = state.engine.sessions().create_session(HashMap::from([(
        "transport".to_string(),
        json!("sse"),
    )]));

    let (transport, rx) =
        SseTransport::new(&session.id, MESSAGES_PATH, state.config.heartbeat);

    // Disconnects cancel the session's in-flight work and unregister the
    // instance; the session record itself survives until TTL so the client
    // can reconnect.
    let disconnect = state.engine.disconnect_hook(&session.id);
    let map_state = Arc::clone(&state);
    let hook_session = session.id.clone();
    transport.set_close_hook(Box::new(move || {
        disconnect();
        map_state
            .sse_transports
            .lock()
            .expect("sse map lock poisoned")
            .remove(&hook_session);
    }));

    state.engine.attach(transport.clone() as Arc<dyn Transport>).await;
    state
        .sse_transports
        .lock()
        .expect("sse map lock poisoned")
        .insert(session.id.clone(), Arc::clone(&transport));

    if let Err(e) = Arc::clone(&transport).start().await {
        tracing::warn!(session_id = %session.id, error = %e, "sse transport failed to start");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let stream = UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    if let Ok(value) = session.id.parse() {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
}

async fn handle_sse_message(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let session_id = query
        .get("sessionId")
        .cloned()
        .or_else(|| header_session_id(&headers));
    let Some(session_id) = session_id else {
        return error_reply(
            StatusCode::BAD_REQUEST,
            JsonRpcError::invalid_request("missing session id"),
            Value::Null,
        );
    };

    let Some(transport) = state.sse_transport(&session_id) else {
        return error_reply(
            StatusCode::NOT_FOUND,
            JsonRpcError::invalid_request(format!("no active sse session '{session_id}'")),
            Value::Null,
        );
    };

    match protocol::decode(&body) {
        Ok(message) => {
            transport.accept(message).await;
            (StatusCode::ACCEPTED, Json(json!({ "accepted": true }))).into_response()
        }
        Err(err) => error_reply(
            StatusCode::BAD_REQUEST,
            JsonRpcError::from(&err),
            protocol::extract_id(&body),
        ),
    }
}

async fn handle_stream(
    State(state): State<Arc<ServerState>>,
    request: Request<Body>,
) -> Response {
    // First contact may omit the header; an unknown id falls back to a
    // fresh session rather than an error so stateless clients can always
    // make progress.
    let claimed = header_session_id(request.headers());
    let session = claimed
        .as_deref()
        .and_then(|id| state.engine.sessions().get_session(id))
        .unwrap_or_else(|| {
            state.engine.sessions().create_session(HashMap::from([(
                "transport".to_string(),
                json!("http-stream"),
            )]))
        });

    let (transport, rx) = HttpStreamTransport::new(&session.id);
    transport.set_close_hook(state.engine.disconnect_hook(&session.id));
    state
        .engine
        .attach(transport.clone() as Arc<dyn Transport>)
        .await;
    if let Err(e) = Arc::clone(&transport).start().await {
        tracing::warn!(session_id = %session.id, error = %e, "stream transport failed to start");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let body_stream = request.into_body().into_data_stream();
    let reader_transport = Arc::clone(&transport);
    let grace = state.config.drain_grace;
    tokio::spawn(async move {
        let expected = feed_inbound(&reader_transport, body_stream).await;
        drain_and_close(reader_transport, expected, grace).await;
    });

    let stream =
        UnboundedReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(axum::body::Bytes::from(chunk)));
    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/x-ndjson"),
    );
    if let Ok(value) = session.id.parse() {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
}

/// Feed newline-delimited envelopes from the POST body to the transport.
/// Returns the number of request envelopes (the ones that expect replies).
async fn feed_inbound(
    transport: &Arc<HttpStreamTransport>,
    mut body: axum::body::BodyDataStream,
) -> usize {
    let mut expected = 0usize;
    let mut buffer = String::new();
    loop {
        let chunk = match body.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "stream request body failed");
                break;
            }
            None => break,
        };
        match std::str::from_utf8(chunk.as_ref()) {
            Ok(fragment) => buffer.push_str(fragment),
            Err(_) => {
                let _ = transport
                    .send(JsonRpcMessage::error(
                        JsonRpcError::parse_error("request body is not UTF-8"),
                        Value::Null,
                    ))
                    .await;
                return expected;
            }
        }
        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim().to_string();
            buffer.drain(..=pos);
            if !line.is_empty() {
                expected += accept_line(transport, &line).await;
            }
        }
    }
    let trailing = buffer.trim().to_string();
    if !trailing.is_empty() {
        expected += accept_line(transport, &trailing).await;
    }
    expected
}

async fn accept_line(transport: &Arc<HttpStreamTransport>, line: &str) -> usize {
    match protocol::decode(line) {
        Ok(message) => {
            let expects_reply = matches!(message, JsonRpcMessage::Request(_));
            transport.accept(message).await;
            usize::from(expects_reply)
        }
        Err(err) => {
            let id = match err {
                crate::error::ProtocolError::Parse(_) => Value::Null,
                _ => protocol::extract_id(line),
            };
            let _ = transport
                .send(JsonRpcMessage::error(JsonRpcError::from(&err), id))
                .await;
            0
        }
    }
}

/// Keep the response open until every accepted request has been answered,
/// then end the chunked body. The grace bound keeps a lost in-flight task
/// from pinning the connection forever.
async fn drain_and_close(
    transport: Arc<HttpStreamTransport>,
    expected: usize,
    grace: Duration,
) {
    let deadline = tokio::time::Instant::now() + grace;
    while transport.responses_sent() < expected
        && !transport.is_closed()
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    transport.close().await;
}

fn header_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn error_reply(status: StatusCode, error: JsonRpcError, id: Value) -> Response {
    let envelope = JsonRpcMessage::error(error, id);
    (status, Json(serde_json::to_value(&envelope).unwrap_or(Value::Null))).into_response()
}
