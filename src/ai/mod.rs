//! Upstream AI client collaborator
//!
//! The protocol engine only knows this seam: create a conversation, then
//! drain a finite, non-restartable stream of answer events. The HTTP
//! implementation talks to a remote backend; the scripted implementation
//! backs tests and offline runs.

pub mod http;
pub mod scripted;

pub use http::HttpAiClient;
pub use scripted::ScriptedAiClient;

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::UpstreamResult;

/// Identifies one in-progress answer on the upstream backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationHandle {
    pub conversation_id: String,
    pub message_id: String,
}

/// One item of a streamed answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerEvent {
    /// A batch of answer tokens
    Tokens(String),
    /// Intermediate reasoning the client may surface separately
    ChainOfThought(String),
    /// End of the answer; no further events follow
    Done,
}

/// Client for the conversational AI backend
#[async_trait]
pub trait AiClient: Send + Sync {
    /// Open a conversation turn for a prompt
    async fn create_conversation(
        &self,
        prompt: &str,
        agent_ref: Option<&str>,
        user_context: &HashMap<String, Value>,
    ) -> UpstreamResult<ConversationHandle>;

    /// Stream the answer for a turn. The stream is finite and not
    /// restartable; implementations must observe `cancel` at bounded
    /// intervals so a silent upstream cannot block cancellation.
    fn stream_answer(
        &self,
        handle: ConversationHandle,
        cancel: CancellationToken,
    ) -> BoxStream<'static, UpstreamResult<AnswerEvent>>;
}
