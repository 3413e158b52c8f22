//! Protocol engine
//!
//! JSON-RPC method dispatcher wiring transports to the session registry,
//! request tracker, conversation history and the upstream AI client.
//!
//! Per-session states: `UNINITIALIZED -> INITIALIZED -> TERMINATED`, with
//! tool calls as a per-request pending sub-state (a tracker entry), never a
//! session-wide lock — other requests on the same session proceed
//! concurrently and callers correlate responses by id, not order.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::ai::{AiClient, AnswerEvent};
use crate::history::{ConversationHistory, ConversationMessage, Role};
use crate::protocol::{JsonRpcError, JsonRpcMessage, JsonRpcRequest};
use crate::requests::RequestTracker;
use crate::session::{Session, SessionRegistry, SessionState};
use crate::transport::Transport;

/// Protocol version offered when the client does not request one
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Method names understood by the dispatcher
pub const SUPPORTED_METHODS: &[&str] = &["initialize", "message", "run", "terminate"];

/// Patience for a cancelled worker to flush its final response on terminate
const WORKER_FLUSH_GRACE: Duration = Duration::from_secs(5);

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Version echoed in `initialize` results when the client names none
    pub protocol_version: String,
    /// Yield to the runtime after this many streamed events, bounding
    /// event-loop starvation during fast token bursts
    pub yield_every: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            yield_every: 8,
        }
    }
}

/// First-class extension point run before dispatch. Returning an error
/// short-circuits the request with that JSON-RPC error.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn before_dispatch(
        &self,
        session: &Session,
        request: &JsonRpcRequest,
    ) -> Result<(), JsonRpcError>;
}

/// The JSON-RPC method dispatcher
pub struct ProtocolEngine {
    sessions: Arc<SessionRegistry>,
    requests: Arc<RequestTracker>,
    history: Arc<ConversationHistory>,
    ai: Arc<dyn AiClient>,
    middleware: Vec<Arc<dyn Middleware>>,
    config: EngineConfig,
    /// Weak self-reference cloned into handler closures and spawned tasks
    self_weak: Weak<Self>,
}

impl ProtocolEngine {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        requests: Arc<RequestTracker>,
        history: Arc<ConversationHistory>,
        ai: Arc<dyn AiClient>,
        middleware: Vec<Arc<dyn Middleware>>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let engine = Arc::new_cyclic(|weak| Self {
            sessions,
            requests,
            history,
            ai,
            middleware,
            config,
            self_weak: Weak::clone(weak),
        });

        // Expiry and explicit deletion share one cleanup path: cancel the
        // session's in-flight work, drop its history, close a still-bound
        // transport.
        let requests = Arc::clone(&engine.requests);
        let history = Arc::clone(&engine.history);
        engine.sessions.set_cleanup_hook(Arc::new(move |session| {
            requests.cancel_all_for_session(&session.id);
            history.delete_history(&session.id);
            if let Some(transport) = session.transport() {
                tokio::spawn(async move {
                    transport.close().await;
                });
            }
        }));
        engine
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn requests(&self) -> &Arc<RequestTracker> {
        &self.requests
    }

    pub fn history(&self) -> &Arc<ConversationHistory> {
        &self.history
    }

    /// Bind a transport to the engine: installs the inbound handler and the
    /// close hook that cancels the session's in-flight work on disconnect.
    /// The session record itself survives until TTL so the client can
    /// reconnect and resume.
    pub async fn attach(&self, transport: Arc<dyn Transport>) {
        let session_id = transport.session_id().to_string();
        tracing::debug!(session_id = %session_id, kind = %transport.kind(), "transport attached");
        let _ = self
            .sessions
            .bind_transport(&session_id, Some(Arc::downgrade(&transport)));

        let Some(engine) = self.self_weak.upgrade() else {
            return;
        };
        let handler_transport = Arc::clone(&transport);
        transport
            .register_handler(Arc::new(move |message| {
                let engine = Arc::clone(&engine);
                let transport = Arc::clone(&handler_transport);
                Box::pin(async move {
                    engine.handle_message(transport, message).await;
                })
            }))
            .await;
    }

    /// Close hook the launchers install on each transport so disconnects
    /// cancel that session's in-flight work without deleting the session
    pub fn disconnect_hook(&self, session_id: &str) -> crate::transport::CloseHook {
        let requests = Arc::clone(&self.requests);
        let sessions = Arc::clone(&self.sessions);
        let session_id = session_id.to_string();
        Box::new(move || {
            requests.cancel_all_for_session(&session_id);
            let _ = sessions.bind_transport(&session_id, None);
        })
    }

    /// Entry point for every inbound envelope on a transport
    pub async fn handle_message(
        &self,
        transport: Arc<dyn Transport>,
        message: JsonRpcMessage,
    ) {
        match message {
            JsonRpcMessage::Request(request) => self.handle_request(transport, request).await,
            JsonRpcMessage::Notification(note) => {
                tracing::debug!(method = %note.method, "ignoring client notification");
            }
            JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_) => {
                tracing::debug!("ignoring client-originated response envelope");
            }
        }
    }

    async fn handle_request(
        &self,
        transport: Arc<dyn Transport>,
        request: JsonRpcRequest,
    ) {
        let id = request.id.clone();
        let session = match self.sessions.get_session(transport.session_id()) {
            Some(session) => session,
            None => {
                self.respond_error(
                    &transport,
                    JsonRpcError::invalid_request("unknown or expired session"),
                    id,
                )
                .await;
                return;
            }
        };
        self.sessions.touch(&session.id);

        for middleware in &self.middleware {
            if let Err(error) = middleware.before_dispatch(&session, &request).await {
                self.respond_error(&transport, error, id).await;
                return;
            }
        }

        match request.method.as_str() {
            "initialize" => {
                let outcome = self.handle_initialize(&session, request.params.as_ref());
                self.respond(&transport, outcome, id).await;
            }
            "message" | "run" => {
                self.handle_run(transport, session, request).await;
            }
            "terminate" => {
                self.handle_terminate(transport, session, id).await;
            }
            other => {
                let error = JsonRpcError::method_not_found(other)
                    .with_data(json!({ "supported": SUPPORTED_METHODS }));
                self.respond_error(&transport, error, id).await;
            }
        }
    }

    /// `initialize`: valid only once per session; responds with the
    /// protocol version and server capabilities before any other work
    fn handle_initialize(
        &self,
        session: &Session,
        params: Option<&Value>,
    ) -> Result<Value, JsonRpcError> {
        let requested_version = match params {
            None => None,
            Some(Value::Object(map)) => {
                let version = map
                    .get("protocol_version")
                    .or_else(|| map.get("protocolVersion"));
                match version {
                    None => None,
                    Some(Value::String(version)) => Some(version.clone()),
                    Some(_) => {
                        return Err(JsonRpcError::invalid_params(
                            "protocol_version must be a string",
                        ))
                    }
                }
            }
            Some(_) => {
                return Err(JsonRpcError::invalid_params(
                    "initialize params must be an object",
                ))
            }
        };

        self.sessions
            .set_state(&session.id, SessionState::Initialized)
            .map_err(|_| {
                JsonRpcError::invalid_request(format!(
                    "initialize is not valid in state '{}'",
                    session.state
                ))
            })?;

        let version = requested_version.unwrap_or_else(|| self.config.protocol_version.clone());
        tracing::info!(session_id = %session.id, protocol_version = %version, "session initialized");
        Ok(json!({
            "protocolVersion": version,
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "methods": SUPPORTED_METHODS,
                "streaming": true,
                "tools": ["echo"],
            },
        }))
    }

    /// `message`/`run`: the tool-call path. Fast tool calls answer inline;
    /// everything else is delegated to the AI backend on a tracked,
    /// cancellable task while this handler returns so later envelopes on
    /// the same transport are not blocked.
    async fn handle_run(
        &self,
        transport: Arc<dyn Transport>,
        session: Session,
        request: JsonRpcRequest,
    ) {
        let id = request.id.clone();
        if session.state != SessionState::Initialized {
            self.respond_error(
                &transport,
                JsonRpcError::invalid_request(format!(
                    "'{}' is not valid in state '{}'",
                    request.method, session.state
                )),
                id,
            )
            .await;
            return;
        }

        let call = match RunParams::parse(request.params.as_ref()) {
            Ok(call) => call,
            Err(error) => {
                self.respond_error(&transport, error, id).await;
                return;
            }
        };

        // Built-in echo resolves without touching the backend.
        if let Some(result) = call.try_echo() {
            self.history.add_message(
                ConversationMessage::new(&session.id, Role::User, call.prompt.clone())
                    .with_tool_calls(call.tool_json()),
            );
            self.history.add_message(
                ConversationMessage::new(&session.id, Role::Assistant, result.clone())
                    .with_tool_results(json!([{ "content": result }])),
            );
            self.sessions.touch(&session.id);
            self.respond(&transport, Ok(json!({ "content": result })), id)
                .await;
            return;
        }

        let request_key = id.to_string();
        let token = match self.requests.track(&request_key, Some(&session.id)) {
            Ok(token) => token,
            Err(e) => {
                self.respond_error(&transport, JsonRpcError::invalid_request(e.to_string()), id)
                    .await;
                return;
            }
        };

        let mut user_message =
            ConversationMessage::new(&session.id, Role::User, call.prompt.clone());
        if call.tool.is_some() {
            user_message = user_message.with_tool_calls(call.tool_json());
        }
        self.history.add_message(user_message);

        match self.self_weak.upgrade() {
            Some(engine) => {
                let worker_key = request_key.clone();
                let worker = tokio::spawn(async move {
                    engine
                        .run_upstream(transport, session, call, request_key, token, id)
                        .await;
                });
                self.requests.bind_worker(&worker_key, worker);
            }
            // Engine teardown mid-request: release the tracker entry so the
            // deadline timer does not fire for work that never ran.
            None => {
                self.requests.complete(&request_key);
                self.respond_error(&transport, JsonRpcError::internal_error(), id)
                    .await;
            }
        }
    }

    /// Drive one upstream conversation turn to completion, streaming
    /// partial output as notifications and observing cancellation at
    /// bounded intervals
    async fn run_upstream(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        session: Session,
        call: RunParams,
        request_key: String,
        token: CancellationToken,
        id: Value,
    ) {
        let started = std::time::Instant::now();
        let handle = match self
            .ai
            .create_conversation(&call.prompt, call.agent.as_deref(), &session.context)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "upstream conversation failed");
                self.requests.complete(&request_key);
                self.respond(
                    &transport,
                    Ok(json!({ "content": format!("AI backend error: {e}"), "isError": true })),
                    id,
                )
                .await;
                return;
            }
        };

        let mut stream = self.ai.stream_answer(handle, token.clone());
        let mut answer = String::new();
        let mut upstream_error: Option<String> = None;
        let mut since_yield = 0usize;
        let outcome = loop {
            let event = tokio::select! {
                _ = token.cancelled() => break RunOutcome::Cancelled,
                event = stream.next() => event,
            };
            match event {
                None | Some(Ok(AnswerEvent::Done)) => break RunOutcome::Finished,
                Some(Ok(AnswerEvent::Tokens(tokens))) => {
                    answer.push_str(&tokens);
                    self.notify_partial(&transport, &id, "tokens", &tokens).await;
                }
                Some(Ok(AnswerEvent::ChainOfThought(thought))) => {
                    self.notify_partial(&transport, &id, "chainOfThought", &thought)
                        .await;
                }
                Some(Err(e)) => {
                    upstream_error = Some(e.to_string());
                    break RunOutcome::Finished;
                }
            }
            since_yield += 1;
            if since_yield >= self.config.yield_every {
                since_yield = 0;
                tokio::task::yield_now().await;
            }
        };
        drop(stream);

        match outcome {
            RunOutcome::Cancelled => {
                // The tracker entry is already gone (cancel removed it);
                // label the result so callers can tell this from a failure.
                let timed_out = started.elapsed() >= self.requests.timeout();
                tracing::info!(
                    session_id = %session.id,
                    request_id = %request_key,
                    timed_out,
                    "tool call cancelled"
                );
                self.respond(
                    &transport,
                    Ok(json!({
                        "content": "Request timed out or was cancelled",
                        "cancelled": true,
                        "timedOut": timed_out,
                    })),
                    id,
                )
                .await;
            }
            RunOutcome::Finished => {
                self.requests.complete(&request_key);
                self.sessions.touch(&session.id);
                match upstream_error {
                    Some(error) => {
                        // Backend failure is a tool-result error; the
                        // conversation continues.
                        self.respond(
                            &transport,
                            Ok(json!({ "content": format!("AI backend error: {error}"), "isError": true })),
                            id,
                        )
                        .await;
                    }
                    None => {
                        self.history.add_message(ConversationMessage::new(
                            &session.id,
                            Role::Assistant,
                            answer.clone(),
                        ));
                        self.respond(&transport, Ok(json!({ "content": answer })), id)
                            .await;
                    }
                }
            }
        }
    }

    /// `terminate`: cancels tracked work, clears history, deletes the
    /// session. The response goes out before the record (and with it the
    /// transport binding) is torn down.
    async fn handle_terminate(
        &self,
        transport: Arc<dyn Transport>,
        session: Session,
        id: Value,
    ) {
        if session.state == SessionState::Uninitialized {
            self.respond_error(
                &transport,
                JsonRpcError::invalid_request("terminate is not valid before initialize"),
                id,
            )
            .await;
            return;
        }

        let workers = self.requests.cancel_all_for_session(&session.id);
        let _ = self.sessions.set_state(&session.id, SessionState::Terminated);
        tracing::info!(
            session_id = %session.id,
            in_flight = workers.len(),
            "session terminating"
        );

        // Cancelled workers still owe their callers a cancellation-labelled
        // response; wait for each to flush before the session record (and
        // with it the transport) is torn down.
        for worker in workers {
            match tokio::time::timeout(WORKER_FLUSH_GRACE, worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(session_id = %session.id, error = %e, "cancelled worker failed");
                }
                Err(_) => {
                    tracing::warn!(
                        session_id = %session.id,
                        "cancelled worker did not settle before teardown"
                    );
                }
            }
        }

        self.respond(&transport, Ok(json!({ "terminated": true })), id)
            .await;

        self.history.delete_history(&session.id);
        self.sessions.delete_session(&session.id);
    }

    async fn notify_partial(
        &self,
        transport: &Arc<dyn Transport>,
        request_id: &Value,
        kind: &str,
        payload: &str,
    ) {
        let note = JsonRpcMessage::notification(
            "message/partial",
            Some(json!({
                "requestId": request_id,
                "kind": kind,
                "payload": payload,
            })),
        );
        if let Err(e) = transport.send(note).await {
            tracing::debug!(error = %e, "failed to push partial output");
        }
    }

    async fn respond(
        &self,
        transport: &Arc<dyn Transport>,
        outcome: Result<Value, JsonRpcError>,
        id: Value,
    ) {
        let message = match outcome {
            Ok(result) => JsonRpcMessage::response(result, id),
            Err(error) => JsonRpcMessage::error(error, id),
        };
        if let Err(e) = transport.send(message).await {
            tracing::warn!(
                session_id = %transport.session_id(),
                error = %e,
                "failed to write response"
            );
        }
    }

    async fn respond_error(
        &self,
        transport: &Arc<dyn Transport>,
        error: JsonRpcError,
        id: Value,
    ) {
        self.respond(transport, Err(error), id).await;
    }
}

enum RunOutcome {
    Finished,
    Cancelled,
}

/// Parsed `message`/`run` parameters
struct RunParams {
    prompt: String,
    agent: Option<String>,
    tool: Option<(String, Value)>,
}

impl RunParams {
    fn parse(params: Option<&Value>) -> Result<Self, JsonRpcError> {
        let Some(Value::Object(map)) = params else {
            return Err(JsonRpcError::invalid_params("params must be an object"));
        };

        let agent = map
            .get("agent")
            .and_then(Value::as_str)
            .map(str::to_string);
        let tool = match map.get("tool") {
            None => None,
            Some(Value::Object(tool)) => {
                let name = tool
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| JsonRpcError::invalid_params("tool.name must be a string"))?;
                let arguments = tool.get("arguments").cloned().unwrap_or(json!({}));
                Some((name.to_string(), arguments))
            }
            Some(_) => return Err(JsonRpcError::invalid_params("tool must be an object")),
        };

        let prompt = map
            .get("message")
            .or_else(|| map.get("prompt"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                tool.as_ref().and_then(|(_, arguments)| {
                    arguments
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
            })
            .ok_or_else(|| {
                JsonRpcError::invalid_params("expected a 'message', 'prompt' or tool argument")
            })?;

        Ok(Self { prompt, agent, tool })
    }

    /// Resolve the built-in echo tool without an upstream round trip
    fn try_echo(&self) -> Option<String> {
        match &self.tool {
            Some((name, arguments)) if name == "echo" => {
                let message = arguments
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or(&self.prompt);
                Some(format!("Echo: {message}"))
            }
            _ => None,
        }
    }

    fn tool_json(&self) -> Value {
        match &self.tool {
            Some((name, arguments)) => json!([{ "name": name, "arguments": arguments }]),
            None => json!([]),
        }
    }
}
