//! End-to-end tests for the JSON-RPC dispatcher over the pipe transport
//!
//! Run with: cargo test --test engine_integration_test

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use aibridge::ai::{AiClient, AnswerEvent, ScriptedAiClient};
use aibridge::engine::{EngineConfig, Middleware, ProtocolEngine};
use aibridge::history::ConversationHistory;
use aibridge::protocol::{JsonRpcError, JsonRpcRequest};
use aibridge::requests::RequestTracker;
use aibridge::session::{Session, SessionRegistry};
use aibridge::transport::{PipeTransport, Transport};

struct Bridge {
    engine: Arc<ProtocolEngine>,
    session_id: String,
    client_writer: DuplexStream,
    client_reader: BufReader<DuplexStream>,
}

/// Wire an engine to a pipe transport over in-memory streams and return the
/// client-side handles
async fn bridge_fixture(ai: Arc<dyn AiClient>, request_timeout: Duration) -> Bridge {
    bridge_fixture_with(ai, request_timeout, Vec::new()).await
}

async fn bridge_fixture_with(
    ai: Arc<dyn AiClient>,
    request_timeout: Duration,
    middleware: Vec<Arc<dyn Middleware>>,
) -> Bridge {
    let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
    let requests = RequestTracker::new(request_timeout);
    let history = Arc::new(ConversationHistory::new(100));
    let engine = ProtocolEngine::new(
        sessions,
        requests,
        history,
        ai,
        middleware,
        EngineConfig::default(),
    );

    let session = engine.sessions().create_session(HashMap::new());
    let (client_writer, server_reader) = duplex(16 * 1024);
    let (server_writer, client_reader) = duplex(16 * 1024);
    let transport = Arc::new(PipeTransport::new(&session.id, server_reader, server_writer));
    transport.set_close_hook(engine.disconnect_hook(&session.id));
    engine.attach(transport.clone() as Arc<dyn Transport>).await;
    Arc::clone(&transport).start().await.unwrap();

    Bridge {
        engine,
        session_id: session.id,
        client_writer,
        client_reader: BufReader::new(client_reader),
    }
}

async fn send(bridge: &mut Bridge, envelope: Value) {
    let mut line = envelope.to_string();
    line.push('\n');
    bridge.client_writer.write_all(line.as_bytes()).await.unwrap();
}

/// Read the next envelope off the pipe
async fn next_envelope(bridge: &mut Bridge) -> Value {
    let mut line = String::new();
    tokio::time::timeout(
        Duration::from_secs(5),
        bridge.client_reader.read_line(&mut line),
    )
    .await
    .expect("timed out waiting for an envelope")
    .unwrap();
    serde_json::from_str(&line).unwrap()
}

/// Read envelopes until the response (result or error) for `id` arrives,
/// collecting any `message/partial` notifications seen on the way
async fn await_response(bridge: &mut Bridge, id: &Value) -> (Value, Vec<Value>) {
    let mut partials = Vec::new();
    loop {
        let envelope = next_envelope(bridge).await;
        if envelope.get("method") == Some(&json!("message/partial")) {
            partials.push(envelope["params"].clone());
            continue;
        }
        assert_eq!(&envelope["id"], id, "response for unexpected id: {envelope}");
        return (envelope, partials);
    }
}

async fn initialize(bridge: &mut Bridge) -> Value {
    send(
        bridge,
        json!({"jsonrpc": "2.0", "method": "initialize", "params": {}, "id": 1}),
    )
    .await;
    let (response, _) = await_response(bridge, &json!(1)).await;
    response
}

#[tokio::test]
async fn test_initialize_handshake() {
    let mut bridge = bridge_fixture(
        Arc::new(ScriptedAiClient::acknowledging()),
        Duration::from_secs(60),
    )
    .await;

    let response = initialize(&mut bridge).await;
    assert_eq!(response["result"]["protocolVersion"], json!("2024-11-05"));
    assert_eq!(response["result"]["serverInfo"]["name"], json!("aibridge"));
    assert_eq!(response["result"]["capabilities"]["streaming"], json!(true));

    // a second initialize is rejected
    send(
        &mut bridge,
        json!({"jsonrpc": "2.0", "method": "initialize", "id": 2}),
    )
    .await;
    let (response, _) = await_response(&mut bridge, &json!(2)).await;
    assert_eq!(response["error"]["code"], json!(-32600));
}

#[tokio::test]
async fn test_initialize_echoes_requested_version() {
    let mut bridge = bridge_fixture(
        Arc::new(ScriptedAiClient::acknowledging()),
        Duration::from_secs(60),
    )
    .await;

    send(
        &mut bridge,
        json!({
            "jsonrpc": "2.0",
            "method": "initialize",
            "params": {"protocolVersion": "2025-01-01"},
            "id": 1
        }),
    )
    .await;
    let (response, _) = await_response(&mut bridge, &json!(1)).await;
    assert_eq!(response["result"]["protocolVersion"], json!("2025-01-01"));
}

#[tokio::test]
async fn test_run_before_initialize_is_rejected() {
    let mut bridge = bridge_fixture(
        Arc::new(ScriptedAiClient::acknowledging()),
        Duration::from_secs(60),
    )
    .await;

    send(
        &mut bridge,
        json!({"jsonrpc": "2.0", "method": "run", "params": {"message": "hi"}, "id": 1}),
    )
    .await;
    let (response, _) = await_response(&mut bridge, &json!(1)).await;
    assert_eq!(response["error"]["code"], json!(-32600));
}

#[tokio::test]
async fn test_unknown_method_is_rejected() {
    let mut bridge = bridge_fixture(
        Arc::new(ScriptedAiClient::acknowledging()),
        Duration::from_secs(60),
    )
    .await;
    initialize(&mut bridge).await;

    send(
        &mut bridge,
        json!({"jsonrpc": "2.0", "method": "frobnicate", "id": 2}),
    )
    .await;
    let (response, _) = await_response(&mut bridge, &json!(2)).await;
    assert_eq!(response["error"]["code"], json!(-32601));
    assert_eq!(
        response["error"]["data"]["supported"],
        json!(["initialize", "message", "run", "terminate"])
    );
}

#[tokio::test]
async fn test_echo_tool_resolves_without_backend() {
    let mut bridge = bridge_fixture(
        Arc::new(ScriptedAiClient::acknowledging()),
        Duration::from_secs(60),
    )
    .await;
    initialize(&mut bridge).await;

    send(
        &mut bridge,
        json!({
            "jsonrpc": "2.0",
            "method": "message",
            "params": {"tool": {"name": "echo", "arguments": {"message": "hi"}}},
            "id": 2
        }),
    )
    .await;
    let (response, partials) = await_response(&mut bridge, &json!(2)).await;
    assert_eq!(response["result"]["content"], json!("Echo: hi"));
    assert!(partials.is_empty());

    // both turn halves are recorded
    let history = bridge.engine.history().get_history(&bridge.session_id);
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "Echo: hi");
}

#[tokio::test]
async fn test_message_streams_partials_then_answer() {
    let ai = Arc::new(ScriptedAiClient::new(vec![
        AnswerEvent::ChainOfThought("thinking".to_string()),
        AnswerEvent::Tokens("Hello ".to_string()),
        AnswerEvent::Tokens("world".to_string()),
    ]));
    let mut bridge = bridge_fixture(ai, Duration::from_secs(60)).await;
    initialize(&mut bridge).await;

    send(
        &mut bridge,
        json!({"jsonrpc": "2.0", "method": "message", "params": {"message": "greet"}, "id": 2}),
    )
    .await;
    let (response, partials) = await_response(&mut bridge, &json!(2)).await;
    assert_eq!(response["result"]["content"], json!("Hello world"));
    assert_eq!(partials.len(), 3);
    assert_eq!(partials[0]["kind"], json!("chainOfThought"));
    assert_eq!(partials[1]["kind"], json!("tokens"));
    assert_eq!(partials[1]["payload"], json!("Hello "));
    assert_eq!(partials[1]["requestId"], json!(2));
}

#[tokio::test]
async fn test_slow_backend_times_out_with_label() {
    let ai = Arc::new(
        ScriptedAiClient::new(vec![AnswerEvent::Tokens("never".to_string())])
            .with_event_delay(Duration::from_secs(30)),
    );
    let mut bridge = bridge_fixture(ai, Duration::from_millis(100)).await;
    initialize(&mut bridge).await;

    send(
        &mut bridge,
        json!({"jsonrpc": "2.0", "method": "run", "params": {"message": "slow"}, "id": 2}),
    )
    .await;
    let (response, _) = await_response(&mut bridge, &json!(2)).await;
    assert_eq!(response["result"]["cancelled"], json!(true));
    assert_eq!(response["result"]["timedOut"], json!(true));
    assert!(bridge.engine.requests().is_empty());
}

#[tokio::test]
async fn test_terminate_deletes_session_and_rejects_further_requests() {
    let mut bridge = bridge_fixture(
        Arc::new(ScriptedAiClient::acknowledging()),
        Duration::from_secs(60),
    )
    .await;
    initialize(&mut bridge).await;

    send(&mut bridge, json!({"jsonrpc": "2.0", "method": "terminate", "id": 2})).await;
    let (response, _) = await_response(&mut bridge, &json!(2)).await;
    assert_eq!(response["result"]["terminated"], json!(true));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bridge.engine.sessions().get_session(&bridge.session_id).is_none());
    assert!(bridge.engine.history().get_history(&bridge.session_id).is_empty());
}

#[tokio::test]
async fn test_terminate_midcall_delivers_cancellation_result() {
    let ai = Arc::new(
        ScriptedAiClient::new(vec![AnswerEvent::Tokens("never".to_string())])
            .with_event_delay(Duration::from_secs(30)),
    );
    let mut bridge = bridge_fixture(ai, Duration::from_secs(60)).await;
    initialize(&mut bridge).await;

    send(
        &mut bridge,
        json!({"jsonrpc": "2.0", "method": "run", "params": {"message": "long job"}, "id": 2}),
    )
    .await;
    send(&mut bridge, json!({"jsonrpc": "2.0", "method": "terminate", "id": 3})).await;

    // the in-flight call resolves with a cancellation label before the
    // transport goes away; the terminate response follows it
    let (run_response, _) = await_response(&mut bridge, &json!(2)).await;
    assert_eq!(run_response["result"]["cancelled"], json!(true));
    assert_eq!(run_response["result"]["timedOut"], json!(false));

    let (term_response, _) = await_response(&mut bridge, &json!(3)).await;
    assert_eq!(term_response["result"]["terminated"], json!(true));

    assert!(bridge.engine.requests().is_empty());
    assert!(bridge.engine.sessions().get_session(&bridge.session_id).is_none());
}

/// Gate that only lets the handshake through, for exercising the
/// pre-dispatch rejection path
struct HandshakeOnlyGate;

#[async_trait]
impl Middleware for HandshakeOnlyGate {
    async fn before_dispatch(
        &self,
        _session: &Session,
        request: &JsonRpcRequest,
    ) -> Result<(), JsonRpcError> {
        if request.method == "initialize" {
            Ok(())
        } else {
            Err(JsonRpcError::new(-32000, "access denied by policy"))
        }
    }
}

#[tokio::test]
async fn test_middleware_rejection_short_circuits_dispatch() {
    let ai = Arc::new(ScriptedAiClient::acknowledging());
    let backend = Arc::clone(&ai);
    let mut bridge = bridge_fixture_with(
        ai,
        Duration::from_secs(60),
        vec![Arc::new(HandshakeOnlyGate)],
    )
    .await;
    initialize(&mut bridge).await;

    send(
        &mut bridge,
        json!({"jsonrpc": "2.0", "method": "run", "params": {"message": "hi"}, "id": 2}),
    )
    .await;
    let (response, _) = await_response(&mut bridge, &json!(2)).await;
    assert_eq!(response["error"]["code"], json!(-32000));
    assert_eq!(response["error"]["message"], json!("access denied by policy"));

    // dispatch never ran: nothing reached the backend or the history
    assert!(backend.prompts().is_empty());
    assert!(bridge.engine.history().get_history(&bridge.session_id).is_empty());
}

#[tokio::test]
async fn test_terminate_before_initialize_is_rejected() {
    let mut bridge = bridge_fixture(
        Arc::new(ScriptedAiClient::acknowledging()),
        Duration::from_secs(60),
    )
    .await;

    send(&mut bridge, json!({"jsonrpc": "2.0", "method": "terminate", "id": 1})).await;
    let (response, _) = await_response(&mut bridge, &json!(1)).await;
    assert_eq!(response["error"]["code"], json!(-32600));
    assert!(bridge.engine.sessions().get_session(&bridge.session_id).is_some());
}

#[tokio::test]
async fn test_malformed_line_gets_parse_error_and_session_survives() {
    let mut bridge = bridge_fixture(
        Arc::new(ScriptedAiClient::acknowledging()),
        Duration::from_secs(60),
    )
    .await;
    initialize(&mut bridge).await;

    bridge.client_writer.write_all(b"{oops\n").await.unwrap();
    let reply = next_envelope(&mut bridge).await;
    assert_eq!(reply["error"]["code"], json!(-32700));
    assert_eq!(reply["id"], Value::Null);

    // the same session keeps working
    send(
        &mut bridge,
        json!({
            "jsonrpc": "2.0",
            "method": "message",
            "params": {"tool": {"name": "echo", "arguments": {"message": "still here"}}},
            "id": 3
        }),
    )
    .await;
    let (response, _) = await_response(&mut bridge, &json!(3)).await;
    assert_eq!(response["result"]["content"], json!("Echo: still here"));
}

#[tokio::test]
async fn test_invalid_params_get_32602() {
    let mut bridge = bridge_fixture(
        Arc::new(ScriptedAiClient::acknowledging()),
        Duration::from_secs(60),
    )
    .await;
    initialize(&mut bridge).await;

    send(
        &mut bridge,
        json!({"jsonrpc": "2.0", "method": "message", "params": "not-an-object", "id": 2}),
    )
    .await;
    let (response, _) = await_response(&mut bridge, &json!(2)).await;
    assert_eq!(response["error"]["code"], json!(-32602));
}
