//! In-flight request tracker
//!
//! Every long-running tool call registers here with a cancellation token and
//! a deadline. Exactly one of completion, explicit cancel (terminate or
//! disconnect) or deadline timeout removes the entry; the map never retains
//! a finished request and deadline timers are always cleared.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{RequestError, RequestResult};

/// Default per-request deadline
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

struct Tracked {
    token: CancellationToken,
    session_id: Option<String>,
    started_at: Instant,
    deadline: tokio::task::JoinHandle<()>,
    /// Handle of the task doing the work, once the caller has spawned it.
    /// Cancellation paths that must wait for the worker to flush its final
    /// response take this handle and await it.
    worker: Option<tokio::task::JoinHandle<()>>,
}

/// Process-scoped tracker for in-flight units of work
pub struct RequestTracker {
    inner: Mutex<HashMap<String, Tracked>>,
    timeout: Duration,
    /// Weak self-reference handed to deadline timer tasks
    self_weak: Weak<RequestTracker>,
}

impl RequestTracker {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            inner: Mutex::new(HashMap::new()),
            timeout,
            self_weak: Weak::clone(weak),
        })
    }

    /// The configured per-request deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a new in-flight request and arm its deadline timer.
    /// Returns the cancellation token the work must observe cooperatively.
    pub fn track(
        &self,
        request_id: &str,
        session_id: Option<&str>,
    ) -> RequestResult<CancellationToken> {
        let token = CancellationToken::new();
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        if inner.contains_key(request_id) {
            return Err(RequestError::DuplicateRequestId {
                id: request_id.to_string(),
            });
        }

        // The timer holds a weak reference so a dropped tracker does not
        // keep timer tasks alive.
        let deadline = {
            let tracker = Weak::clone(&self.self_weak);
            let request_id = request_id.to_string();
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(tracker) = tracker.upgrade() {
                    tracing::warn!(request_id = %request_id, timeout_secs = timeout.as_secs(), "request deadline fired");
                    tracker.cancel(&request_id);
                }
            })
        };

        inner.insert(
            request_id.to_string(),
            Tracked {
                token: token.clone(),
                session_id: session_id.map(str::to_string),
                started_at: Instant::now(),
                deadline,
                worker: None,
            },
        );
        Ok(token)
    }

    /// Attach the spawned worker task to a tracked request. A no-op when the
    /// entry is already gone (the work finished before the handle arrived);
    /// the dropped handle leaves the finished task detached.
    pub fn bind_worker(&self, request_id: &str, worker: tokio::task::JoinHandle<()>) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        if let Some(tracked) = inner.get_mut(request_id) {
            tracked.worker = Some(worker);
        }
    }

    /// Cancel one request: fires its token, clears its timer, removes the
    /// entry. Unknown ids are a logged no-op (the request already finished).
    pub fn cancel(&self, request_id: &str) -> bool {
        let removed = self
            .inner
            .lock()
            .expect("tracker lock poisoned")
            .remove(request_id);
        match removed {
            Some(tracked) => {
                tracked.deadline.abort();
                tracked.token.cancel();
                tracing::debug!(request_id = %request_id, "request cancelled");
                true
            }
            None => {
                tracing::warn!(request_id = %request_id, "cancel for unknown request id, ignoring");
                false
            }
        }
    }

    /// Normal termination path: removes the entry and clears the timer
    /// without firing the token. Returns whether an entry existed.
    pub fn complete(&self, request_id: &str) -> bool {
        let removed = self
            .inner
            .lock()
            .expect("tracker lock poisoned")
            .remove(request_id);
        match removed {
            Some(tracked) => {
                tracked.deadline.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every tracked request bound to a session. Invoked on
    /// `terminate` and on transport close. Returns the worker handles of the
    /// cancelled requests; a caller that must deliver final responses before
    /// tearing the transport down awaits them, everyone else drops them and
    /// the workers wind down detached.
    pub fn cancel_all_for_session(&self, session_id: &str) -> Vec<tokio::task::JoinHandle<()>> {
        let drained: Vec<Tracked> = {
            let mut inner = self.inner.lock().expect("tracker lock poisoned");
            let ids: Vec<String> = inner
                .iter()
                .filter(|(_, t)| t.session_id.as_deref() == Some(session_id))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| inner.remove(id)).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(
                session_id = %session_id,
                count = drained.len(),
                "cancelled in-flight requests for session"
            );
        }
        drained
            .into_iter()
            .filter_map(|tracked| {
                tracked.deadline.abort();
                tracked.token.cancel();
                tracked.worker
            })
            .collect()
    }

    /// How long a tracked request has been running
    pub fn elapsed(&self, request_id: &str) -> Option<Duration> {
        self.inner
            .lock()
            .expect("tracker lock poisoned")
            .get(request_id)
            .map(|t| t.started_at.elapsed())
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.inner
            .lock()
            .expect("tracker lock poisoned")
            .contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("tracker lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
