//! Session registry
//!
//! The only place session identity is minted or invalidated. A session is a
//! logical conversation context that can outlive any single transport
//! connection (SSE clients reconnect, HTTP-stream clients resume by header).
//! Expiry is TTL-based: a background sweeper deletes sessions whose
//! inactivity exceeds the configured TTL, through the same cleanup hook as
//! explicit deletion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};
use crate::transport::Transport;

/// Per-session protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, `initialize` not yet seen
    Uninitialized,
    /// Handshake done, `message`/`run` accepted
    Initialized,
    /// Terminal state; the record is deleted right after entering it
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initialized => write!(f, "initialized"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// One session record. Registry methods hand out clones; nobody holds a
/// live reference into the map.
#[derive(Clone)]
pub struct Session {
    /// Opaque unique id, minted on creation, immutable for process lifetime
    pub id: String,
    /// Open key/value context (transport kind, remote address, custom attributes)
    pub context: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: SessionState,
    /// Back-reference to the currently bound transport, if any
    pub transport: Option<Weak<dyn Transport>>,
}

impl Session {
    fn new(context: HashMap<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            context,
            created_at: now,
            last_activity: now,
            state: SessionState::Uninitialized,
            transport: None,
        }
    }

    /// The transport currently bound to this session, if still alive
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.as_ref().and_then(Weak::upgrade)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("created_at", &self.created_at)
            .field("last_activity", &self.last_activity)
            .finish()
    }
}

/// Fields merged into a session by `update_session`
#[derive(Default)]
pub struct SessionPatch {
    /// Context entries to merge (existing keys overwritten)
    pub context: Option<HashMap<String, Value>>,
    /// Explicit activity timestamp; when `None`, `last_activity` is
    /// refreshed to now
    pub last_activity: Option<DateTime<Utc>>,
}

/// Hook invoked for every deleted session (explicit or swept)
pub type CleanupHook = Arc<dyn Fn(&Session) + Send + Sync>;

/// Process-scoped session registry. Explicitly constructed and injected;
/// tests create isolated instances.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Duration,
    cleanup: Mutex<Option<CleanupHook>>,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
            cleanup: Mutex::new(None),
        }
    }

    /// Install the cleanup hook shared by explicit deletion and TTL sweeps
    pub fn set_cleanup_hook(&self, hook: CleanupHook) {
        *self.cleanup.lock().expect("cleanup lock poisoned") = Some(hook);
    }

    /// Mint a new session. The id is unique for the process lifetime and
    /// never reused.
    pub fn create_session(&self, context: HashMap<String, Value>) -> Session {
        let session = Session::new(context);
        tracing::info!(session_id = %session.id, "session created");
        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .insert(session.id.clone(), session.clone());
        session
    }

    /// Snapshot of a session record
    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .get(id)
            .cloned()
    }

    /// Merge patch fields into the record. `last_activity` is refreshed
    /// unless the patch pins it explicitly.
    pub fn update_session(&self, id: &str, patch: SessionPatch) -> SessionResult<()> {
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");
        let session = sessions.get_mut(id).ok_or_else(|| SessionError::NotFound {
            id: id.to_string(),
        })?;
        if let Some(context) = patch.context {
            session.context.extend(context);
        }
        session.last_activity = match patch.last_activity {
            Some(explicit) => explicit,
            None => Utc::now().max(session.last_activity),
        };
        Ok(())
    }

    /// Refresh `last_activity`; returns whether the session exists.
    /// The timestamp is monotonically non-decreasing.
    pub fn touch(&self, id: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");
        match sessions.get_mut(id) {
            Some(session) => {
                session.last_activity = Utc::now().max(session.last_activity);
                true
            }
            None => false,
        }
    }

    /// Validated protocol state transition
    pub fn set_state(&self, id: &str, to: SessionState) -> SessionResult<()> {
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");
        let session = sessions.get_mut(id).ok_or_else(|| SessionError::NotFound {
            id: id.to_string(),
        })?;
        let valid = matches!(
            (session.state, to),
            (SessionState::Uninitialized, SessionState::Initialized)
                | (SessionState::Initialized, SessionState::Terminated)
        );
        if !valid {
            return Err(SessionError::InvalidStateTransition {
                from: session.state.to_string(),
                to: to.to_string(),
            });
        }
        session.state = to;
        session.last_activity = Utc::now().max(session.last_activity);
        Ok(())
    }

    /// Bind (or clear) the transport back-reference
    pub fn bind_transport(
        &self,
        id: &str,
        transport: Option<Weak<dyn Transport>>,
    ) -> SessionResult<()> {
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");
        let session = sessions.get_mut(id).ok_or_else(|| SessionError::NotFound {
            id: id.to_string(),
        })?;
        session.transport = transport;
        Ok(())
    }

    /// Remove the record and run the cleanup hook. Returns whether a record
    /// existed.
    pub fn delete_session(&self, id: &str) -> bool {
        let removed = self
            .sessions
            .lock()
            .expect("session map lock poisoned")
            .remove(id);
        match removed {
            Some(session) => {
                tracing::info!(session_id = %id, "session deleted");
                self.run_cleanup(&session);
                true
            }
            None => false,
        }
    }

    /// Delete every session whose inactivity exceeds the TTL. Returns the
    /// swept ids.
    pub fn sweep_expired(&self) -> Vec<String> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let expired: Vec<Session> = {
            let mut sessions = self.sessions.lock().expect("session map lock poisoned");
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| now - s.last_activity > ttl)
                .map(|s| s.id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        let mut swept = Vec::with_capacity(expired.len());
        for session in &expired {
            tracing::info!(session_id = %session.id, "session expired, sweeping");
            self.run_cleanup(session);
            swept.push(session.id.clone());
        }
        swept
    }

    /// Spawn the fixed-interval sweeper task
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let swept = registry.sweep_expired();
                if !swept.is_empty() {
                    tracing::debug!(count = swept.len(), "ttl sweep complete");
                }
            }
        })
    }

    /// Delete all sessions (process shutdown)
    pub fn clear_all(&self) -> usize {
        let drained: Vec<Session> = {
            let mut sessions = self.sessions.lock().expect("session map lock poisoned");
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &drained {
            self.run_cleanup(session);
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn run_cleanup(&self, session: &Session) {
        let hook = self.cleanup.lock().expect("cleanup lock poisoned").clone();
        if let Some(hook) = hook {
            hook(session);
        }
    }
}
