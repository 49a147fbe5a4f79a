use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Per-request context threaded explicitly into every service call.
///
/// Carries the correlation id that audit entries and log events attach to.
/// There is no ambient storage; callers pass the context by reference.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id, adopted from the caller or generated per request
    pub correlation_id: String,
    /// Session id used by the guardrails; defaults to the correlation id
    pub session_id: String,
    /// When the request entered the dispatcher
    pub started_at: DateTime<Utc>,
    /// Absolute deadline for the whole request, if any
    pub deadline: Option<DateTime<Utc>>,
}

impl RequestContext {
    /// Create a context with a fresh correlation id
    pub fn new() -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            session_id: id.clone(),
            correlation_id: id,
            started_at: Utc::now(),
            deadline: None,
        }
    }

    /// Create a context adopting the caller's correlation id
    pub fn with_correlation_id<S: Into<String>>(correlation_id: S) -> Self {
        let id = correlation_id.into();
        Self {
            session_id: id.clone(),
            correlation_id: id,
            started_at: Utc::now(),
            deadline: None,
        }
    }

    /// Attach a session id distinct from the correlation id
    pub fn with_session<S: Into<String>>(mut self, session_id: S) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Attach an absolute deadline
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Milliseconds elapsed since the request entered the dispatcher
    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Whether the request deadline has passed
    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| Utc::now() >= d).unwrap_or(false)
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
