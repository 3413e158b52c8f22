//! Conversation history ring
//!
//! Bounded, per-session ordered log of exchanged messages. Append-only while
//! a session lives; when the configured cap is exceeded the oldest entries
//! are evicted FIFO. Owned independently of the session registry so the
//! protocol engine can read context without touching session records.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Who authored a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One entry in a session's conversation log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationMessage {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Value>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl ConversationMessage {
    /// Create a message with a fresh id and the current timestamp
    pub fn new(session_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: None,
            tool_results: None,
            metadata: HashMap::new(),
        }
    }

    /// Attach the tool invocation that produced this message
    pub fn with_tool_calls(mut self, tool_calls: Value) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    /// Attach tool results
    pub fn with_tool_results(mut self, tool_results: Value) -> Self {
        self.tool_results = Some(tool_results);
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Per-session bounded history store
pub struct ConversationHistory {
    rings: Mutex<HashMap<String, VecDeque<ConversationMessage>>>,
    max_messages: usize,
}

impl ConversationHistory {
    pub fn new(max_messages: usize) -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
            max_messages: max_messages.max(1),
        }
    }

    /// The configured per-session cap
    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Append a message, evicting oldest entries FIFO when the session's
    /// ring exceeds the cap. Returns the stored message.
    pub fn add_message(&self, message: ConversationMessage) -> ConversationMessage {
        let mut rings = self.rings.lock().expect("history lock poisoned");
        let ring = rings.entry(message.session_id.clone()).or_default();
        ring.push_back(message.clone());
        while ring.len() > self.max_messages {
            ring.pop_front();
        }
        message
    }

    /// Snapshot of a session's history, oldest first. Calling again returns
    /// the current snapshot, not a continuation.
    pub fn get_history(&self, session_id: &str) -> Vec<ConversationMessage> {
        self.rings
            .lock()
            .expect("history lock poisoned")
            .get(session_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Empty a session's ring but keep the entry. Returns false if the
    /// session had no history.
    pub fn clear_history(&self, session_id: &str) -> bool {
        let mut rings = self.rings.lock().expect("history lock poisoned");
        match rings.get_mut(session_id) {
            Some(ring) => {
                ring.clear();
                true
            }
            None => false,
        }
    }

    /// Remove a session's ring entirely. Returns false if nothing existed.
    pub fn delete_history(&self, session_id: &str) -> bool {
        self.rings
            .lock()
            .expect("history lock poisoned")
            .remove(session_id)
            .is_some()
    }

    /// Ids of every session with a history entry
    pub fn list_session_ids(&self) -> Vec<String> {
        self.rings
            .lock()
            .expect("history lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Number of messages stored for a session
    pub fn count_for(&self, session_id: &str) -> usize {
        self.rings
            .lock()
            .expect("history lock poisoned")
            .get(session_id)
            .map_or(0, VecDeque::len)
    }
}
