//! Scripted AI client
//!
//! Deterministic backend used by tests and offline runs: replays a fixed
//! event sequence with an optional per-event delay, and records the prompts
//! it was given. Honors cancellation between events like the real client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{AiClient, AnswerEvent, ConversationHandle};
use crate::error::UpstreamResult;

/// Replays a canned answer for every conversation
pub struct ScriptedAiClient {
    events: Vec<AnswerEvent>,
    event_delay: Duration,
    prompts: Arc<Mutex<Vec<String>>>,
    counter: AtomicU64,
}

impl ScriptedAiClient {
    /// Client that answers every prompt with the given events (a trailing
    /// `Done` is appended when missing)
    pub fn new(mut events: Vec<AnswerEvent>) -> Self {
        if events.last() != Some(&AnswerEvent::Done) {
            events.push(AnswerEvent::Done);
        }
        Self {
            events,
            event_delay: Duration::ZERO,
            prompts: Arc::new(Mutex::new(Vec::new())),
            counter: AtomicU64::new(0),
        }
    }

    /// Client that echoes a short acknowledgement, for local runs without a
    /// configured backend
    pub fn acknowledging() -> Self {
        Self::new(vec![AnswerEvent::Tokens(
            "No AI backend is configured; echoing your prompt back.".to_string(),
        )])
    }

    /// Pause between events, to simulate a slow upstream
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    /// Prompts seen so far, in order
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompt log lock poisoned").clone()
    }
}

#[async_trait]
impl AiClient for ScriptedAiClient {
    async fn create_conversation(
        &self,
        prompt: &str,
        _agent_ref: Option<&str>,
        _user_context: &HashMap<String, Value>,
    ) -> UpstreamResult<ConversationHandle> {
        self.prompts
            .lock()
            .expect("prompt log lock poisoned")
            .push(prompt.to_string());
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(ConversationHandle {
            conversation_id: format!("conv-{n}"),
            message_id: format!("msg-{n}"),
        })
    }

    fn stream_answer(
        &self,
        _handle: ConversationHandle,
        cancel: CancellationToken,
    ) -> BoxStream<'static, UpstreamResult<AnswerEvent>> {
        let events = self.events.clone();
        let delay = self.event_delay;
        Box::pin(async_stream::stream! {
            for event in events {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                } else if cancel.is_cancelled() {
                    return;
                }
                yield Ok(event);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_replays_events_and_appends_done() {
        let client = ScriptedAiClient::new(vec![
            AnswerEvent::ChainOfThought("thinking".to_string()),
            AnswerEvent::Tokens("hello".to_string()),
        ]);
        let handle = client
            .create_conversation("hi", None, &HashMap::new())
            .await
            .unwrap();

        let events: Vec<_> = client
            .stream_answer(handle, CancellationToken::new())
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                AnswerEvent::ChainOfThought("thinking".to_string()),
                AnswerEvent::Tokens("hello".to_string()),
                AnswerEvent::Done,
            ]
        );
        assert_eq!(client.prompts(), vec!["hi"]);
    }

    #[tokio::test]
    async fn test_cancellation_stops_slow_stream() {
        let client = ScriptedAiClient::new(vec![AnswerEvent::Tokens("never".to_string())])
            .with_event_delay(Duration::from_secs(30));
        let handle = client
            .create_conversation("hi", None, &HashMap::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let events: Vec<_> = client.stream_answer(handle, cancel).collect().await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_handles_are_unique_per_turn() {
        let client = ScriptedAiClient::acknowledging();
        let a = client
            .create_conversation("one", None, &HashMap::new())
            .await
            .unwrap();
        let b = client
            .create_conversation("two", None, &HashMap::new())
            .await
            .unwrap();
        assert_ne!(a, b);
    }
}
