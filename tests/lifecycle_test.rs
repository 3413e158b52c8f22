//! Session TTL, request tracking and history retention working together
//!
//! Run with: cargo test --test lifecycle_test

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use aibridge::ai::ScriptedAiClient;
use aibridge::engine::{EngineConfig, ProtocolEngine};
use aibridge::history::{ConversationHistory, ConversationMessage, Role};
use aibridge::requests::RequestTracker;
use aibridge::session::{SessionPatch, SessionRegistry};

fn engine_with_ttl(ttl: Duration) -> Arc<ProtocolEngine> {
    ProtocolEngine::new(
        Arc::new(SessionRegistry::new(ttl)),
        RequestTracker::new(Duration::from_secs(60)),
        Arc::new(ConversationHistory::new(5)),
        Arc::new(ScriptedAiClient::acknowledging()),
        Vec::new(),
        EngineConfig::default(),
    )
}

#[tokio::test]
async fn test_ttl_sweep_cancels_work_and_drops_history() {
    let engine = engine_with_ttl(Duration::from_millis(50));
    let session = engine.sessions().create_session(HashMap::new());

    let token = engine
        .requests()
        .track("req-1", Some(&session.id))
        .unwrap();
    engine.history().add_message(ConversationMessage::new(
        &session.id,
        Role::User,
        "pending question",
    ));

    // Age the session past its TTL, then sweep.
    engine
        .sessions()
        .update_session(
            &session.id,
            SessionPatch {
                context: None,
                last_activity: Some(Utc::now() - chrono::Duration::seconds(10)),
            },
        )
        .unwrap();
    let swept = engine.sessions().sweep_expired();
    assert_eq!(swept, vec![session.id.clone()]);

    assert!(token.is_cancelled());
    assert!(engine.requests().is_empty());
    assert!(engine.history().get_history(&session.id).is_empty());
    assert!(engine.sessions().get_session(&session.id).is_none());
}

#[tokio::test]
async fn test_active_session_survives_sweep() {
    let engine = engine_with_ttl(Duration::from_secs(60));
    let session = engine.sessions().create_session(HashMap::new());
    engine.sessions().touch(&session.id);

    assert!(engine.sessions().sweep_expired().is_empty());
    assert!(engine.sessions().get_session(&session.id).is_some());
}

#[tokio::test]
async fn test_deadline_fires_exactly_once() {
    let tracker = RequestTracker::new(Duration::from_millis(30));
    let token = tracker.track("req-1", Some("sess-1")).unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(token.is_cancelled());
    assert!(!tracker.contains("req-1"));

    // both removal paths are no-ops once the entry is gone
    tracker.cancel("req-1");
    tracker.complete("req-1");
    assert!(tracker.is_empty());
}

#[tokio::test]
async fn test_completion_beats_the_deadline() {
    let tracker = RequestTracker::new(Duration::from_millis(100));
    let token = tracker.track("req-1", Some("sess-1")).unwrap();
    tracker.complete("req-1");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!token.is_cancelled());
    assert!(tracker.is_empty());
}

#[tokio::test]
async fn test_cancel_all_scopes_to_one_session() {
    let tracker = RequestTracker::new(Duration::from_secs(60));
    let a = tracker.track("req-a", Some("sess-1")).unwrap();
    let b = tracker.track("req-b", Some("sess-1")).unwrap();
    let other = tracker.track("req-c", Some("sess-2")).unwrap();

    tracker.cancel_all_for_session("sess-1");
    assert!(a.is_cancelled());
    assert!(b.is_cancelled());
    assert!(!other.is_cancelled());
    assert_eq!(tracker.len(), 1);
}

#[tokio::test]
async fn test_history_cap_evicts_oldest_first() {
    let history = ConversationHistory::new(5);
    for n in 1..=7 {
        history.add_message(ConversationMessage::new(
            "sess-1",
            Role::User,
            format!("m{n}"),
        ));
    }

    let messages = history.get_history("sess-1");
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[0].content, "m3");
    assert_eq!(messages[4].content, "m7");

    // other sessions are unaffected by the cap of this one
    history.add_message(ConversationMessage::new("sess-2", Role::User, "own ring"));
    assert_eq!(history.count_for("sess-2"), 1);
    assert_eq!(history.count_for("sess-1"), 5);
}

#[tokio::test]
async fn test_duplicate_request_ids_are_rejected() {
    let tracker = RequestTracker::new(Duration::from_secs(60));
    tracker.track("req-1", Some("sess-1")).unwrap();
    let err = tracker.track("req-1", Some("sess-1")).unwrap_err();
    assert_eq!(err.to_string(), "Request 'req-1' is already being tracked");
}

#[tokio::test]
async fn test_session_context_merges_across_updates() {
    let registry = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
    let session = registry.create_session(HashMap::from([(
        "transport".to_string(),
        json!("sse"),
    )]));

    registry
        .update_session(
            &session.id,
            SessionPatch {
                context: Some(HashMap::from([("user".to_string(), json!("alex"))])),
                last_activity: None,
            },
        )
        .unwrap();

    let updated = registry.get_session(&session.id).unwrap();
    assert_eq!(updated.context["transport"], json!("sse"));
    assert_eq!(updated.context["user"], json!("alex"));
    assert!(updated.last_activity >= session.last_activity);
}
