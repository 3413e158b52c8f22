//! HTTP implementation of the AI client
//!
//! Speaks an SSE-style streaming endpoint: each frame is a `data:` line
//! holding `{"kind": "tokens"|"chainOfThought"|"error"|"done", "payload": …}`.
//! Frames are accumulated across chunk boundaries the same way the
//! provider clients in this ecosystem do it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{AiClient, AnswerEvent, ConversationHandle};
use crate::error::{UpstreamError, UpstreamResult};

/// How often the stream loop re-checks the cancel token while the upstream
/// is silent
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Reqwest-backed client for the conversational backend
pub struct HttpAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    default_agent: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationResponse {
    conversation_id: String,
    message_id: String,
}

#[derive(Deserialize)]
struct StreamFrame {
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl HttpAiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            default_agent: None,
        }
    }

    /// Set the bearer token sent with every call
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the agent used when a request names none
    pub fn with_default_agent(mut self, agent: impl Into<String>) -> Self {
        self.default_agent = Some(agent.into());
        self
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn parse_frame(data: &str) -> Option<UpstreamResult<AnswerEvent>> {
        if data.is_empty() || data == "[DONE]" {
            return None;
        }
        let frame: StreamFrame = match serde_json::from_str(data) {
            Ok(frame) => frame,
            Err(e) => {
                return Some(Err(UpstreamError::invalid_response(format!(
                    "malformed stream frame: {e}"
                ))))
            }
        };
        match frame.kind.as_str() {
            "tokens" => Some(Ok(AnswerEvent::Tokens(
                frame.payload.as_str().unwrap_or_default().to_string(),
            ))),
            "chainOfThought" => Some(Ok(AnswerEvent::ChainOfThought(
                frame.payload.as_str().unwrap_or_default().to_string(),
            ))),
            "done" => Some(Ok(AnswerEvent::Done)),
            "error" => Some(Err(UpstreamError::stream(
                frame
                    .payload
                    .as_str()
                    .unwrap_or("upstream reported an error")
                    .to_string(),
            ))),
            other => Some(Err(UpstreamError::invalid_response(format!(
                "unknown stream frame kind '{other}'"
            )))),
        }
    }
}

#[async_trait]
impl AiClient for HttpAiClient {
    async fn create_conversation(
        &self,
        prompt: &str,
        agent_ref: Option<&str>,
        user_context: &HashMap<String, Value>,
    ) -> UpstreamResult<ConversationHandle> {
        let agent = agent_ref.or(self.default_agent.as_deref());
        let body = json!({
            "prompt": prompt,
            "agentRef": agent,
            "userContext": user_context,
        });

        let response = self
            .authorize(self.http.post(format!("{}/conversations", self.base_url)))
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamError::request_failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CreateConversationResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::invalid_response(e.to_string()))?;
        Ok(ConversationHandle {
            conversation_id: parsed.conversation_id,
            message_id: parsed.message_id,
        })
    }

    fn stream_answer(
        &self,
        handle: ConversationHandle,
        cancel: CancellationToken,
    ) -> BoxStream<'static, UpstreamResult<AnswerEvent>> {
        let url = format!(
            "{}/conversations/{}/messages/{}/stream",
            self.base_url, handle.conversation_id, handle.message_id
        );
        let request = self.authorize(self.http.get(url));

        Box::pin(async_stream::stream! {
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    yield Err(UpstreamError::request_failed(e.to_string()));
                    return;
                }
            };
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                yield Err(UpstreamError::Status { status: status.as_u16(), body });
                return;
            }

            let mut bytes = response.bytes_stream();
            let mut line_buffer = String::new();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("answer stream cancelled, dropping upstream connection");
                        return;
                    }
                    // Re-arm the token check even when the upstream is
                    // silent between chunks.
                    _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => continue,
                    chunk = bytes.next() => chunk,
                };

                let chunk = match chunk {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        yield Err(UpstreamError::stream(e.to_string()));
                        return;
                    }
                    None => break,
                };
                let fragment = match std::str::from_utf8(chunk.as_ref()) {
                    Ok(fragment) => fragment,
                    Err(e) => {
                        yield Err(UpstreamError::invalid_response(format!(
                            "invalid UTF-8 in stream: {e}"
                        )));
                        return;
                    }
                };
                line_buffer.push_str(fragment);

                while let Some(pos) = line_buffer.find('\n') {
                    let line = line_buffer[..pos].trim_end_matches('\r').to_string();
                    line_buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    if let Some(event) = Self::parse_frame(data.trim()) {
                        let done = matches!(event, Ok(AnswerEvent::Done));
                        yield event;
                        if done {
                            return;
                        }
                    }
                }
            }

            // Flush a final unterminated frame, then signal completion even
            // if the upstream forgot its done marker.
            if let Some(data) = line_buffer.trim().strip_prefix("data:") {
                if let Some(event) = Self::parse_frame(data.trim()) {
                    let done = matches!(event, Ok(AnswerEvent::Done));
                    yield event;
                    if done {
                        return;
                    }
                }
            }
            yield Ok(AnswerEvent::Done);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_kinds() {
        let tokens = HttpAiClient::parse_frame(r#"{"kind":"tokens","payload":"hel"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(tokens, AnswerEvent::Tokens("hel".to_string()));

        let thought =
            HttpAiClient::parse_frame(r#"{"kind":"chainOfThought","payload":"hmm"}"#)
                .unwrap()
                .unwrap();
        assert_eq!(thought, AnswerEvent::ChainOfThought("hmm".to_string()));

        let done = HttpAiClient::parse_frame(r#"{"kind":"done"}"#).unwrap().unwrap();
        assert_eq!(done, AnswerEvent::Done);
    }

    #[test]
    fn test_parse_frame_error_and_noise() {
        let err = HttpAiClient::parse_frame(r#"{"kind":"error","payload":"backend down"}"#)
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Stream(_)));

        assert!(HttpAiClient::parse_frame("").is_none());
        assert!(HttpAiClient::parse_frame("[DONE]").is_none());

        let malformed = HttpAiClient::parse_frame("{oops").unwrap().unwrap_err();
        assert!(matches!(malformed, UpstreamError::InvalidResponse(_)));

        let unknown = HttpAiClient::parse_frame(r#"{"kind":"telemetry"}"#)
            .unwrap()
            .unwrap_err();
        assert!(matches!(unknown, UpstreamError::InvalidResponse(_)));
    }
}
