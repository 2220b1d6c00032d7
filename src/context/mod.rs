//! Per-request context
//!
//! Every inbound request carries a [`RequestContext`] that is passed explicitly
//! through the router, balancer and forwarding client. It holds the trace id,
//! the request's deadline and a cancellation token.

use axum::http::HeaderMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Header used to propagate the trace id to and from backends
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct RequestContext {
    trace_id: String,
    started: Instant,
    /// `None` when the budget does not fit in an `Instant`
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl RequestContext {
    /// New context with a generated trace id and the given time budget
    pub fn new(budget: Duration) -> Self {
        Self::with_trace_id(Uuid::new_v4().to_string(), budget)
    }

    pub fn with_trace_id(trace_id: impl Into<String>, budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            trace_id: trace_id.into(),
            started,
            deadline: started.checked_add(budget),
            cancellation: CancellationToken::new(),
        }
    }

    /// Build a context for an inbound request, reusing its `x-request-id` when present.
    ///
    /// The context's token is a child of `parent`, so cancelling `parent`
    /// cancels every request derived from it.
    pub fn from_headers(headers: &HeaderMap, budget: Duration, parent: &CancellationToken) -> Self {
        let trace_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            cancellation: parent.child_token(),
            ..Self::with_trace_id(trace_id, budget)
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, "abc-123".parse().unwrap());

        let ctx = RequestContext::from_headers(
            &headers,
            Duration::from_secs(1),
            &CancellationToken::new(),
        );
        assert_eq!(ctx.trace_id(), "abc-123");
    }

    #[test]
    fn test_generated_trace_id() {
        let ctx = RequestContext::from_headers(
            &HeaderMap::new(),
            Duration::from_secs(1),
            &CancellationToken::new(),
        );
        assert!(Uuid::parse_str(ctx.trace_id()).is_ok());
    }

    #[test]
    fn test_deadline() {
        let ctx = RequestContext::new(Duration::from_secs(10));
        assert!(ctx.remaining() > Duration::ZERO);
        assert!(ctx.remaining() <= Duration::from_secs(10));

        let expired = RequestContext::new(Duration::ZERO);
        assert_eq!(expired.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_oversized_budget_does_not_overflow() {
        let ctx = RequestContext::new(Duration::from_secs(u64::MAX));
        assert_eq!(ctx.remaining(), Duration::MAX);
    }

    #[test]
    fn test_parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let ctx = RequestContext::from_headers(&HeaderMap::new(), Duration::from_secs(1), &parent);
        assert!(!ctx.is_cancelled());

        parent.cancel();
        assert!(ctx.is_cancelled());
    }
}
