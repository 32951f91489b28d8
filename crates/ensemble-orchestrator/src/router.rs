//! Response routing.
//!
//! The [`ResponseRouter`] fans chunks and lifecycle events out to session- and
//! agent-scoped subscribers. Every subscriber owns an unbounded queue, so a
//! slow reader never loses events; it only builds a backlog. Each request
//! writes through exactly one [`ResponseStream`], which stamps chunks with a
//! per-stream sequence number.

use ensemble_abstraction::StreamChunk;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ErrorKind, RuntimeError};
use crate::orchestration::{OrchestrationProgress, PlanStatus};
use crate::tools::ToolExecutionResult;

/// Default backlog per subscriber before a slow reader is reported.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Identifies one response stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StreamId {
    /// Session the stream belongs to
    pub session_id: String,
    /// Agent producing the stream
    pub agent_id: String,
    /// Request the stream answers
    pub request_id: String,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.session_id, self.agent_id, self.request_id)
    }
}

/// Failure report delivered to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEvent {
    /// Request that failed
    pub request_id: String,
    /// Classification
    pub kind: ErrorKind,
    /// Human readable message
    pub message: String,
}

impl ErrorEvent {
    /// Builds an event from a runtime error.
    pub fn from_error(request_id: impl Into<String>, error: &RuntimeError) -> Self {
        Self { request_id: request_id.into(), kind: error.kind(), message: error.to_string() }
    }
}

/// Everything a subscriber can receive.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouterEvent {
    /// A chunk written to a stream.
    Chunk { stream: StreamId, sequence: u64, chunk: StreamChunk },
    /// Plan progress.
    Progress(OrchestrationProgress),
    /// A plan reached its final status.
    PlanFinished { plan_id: String, status: PlanStatus },
    /// A request failed.
    Error(ErrorEvent),
    /// A tool call waits for a reviewer.
    ApprovalRequired { request_id: String, tool_name: String, reason: String },
    /// A tool call produced its result.
    ToolFinished { stream: StreamId, result: ToolExecutionResult },
    /// A stream was closed; nothing more follows on it.
    StreamClosed { stream: StreamId },
}

/// Router side of one subscription.
struct Subscriber {
    sender: mpsc::UnboundedSender<RouterEvent>,
    backlog: Arc<AtomicUsize>,
}

type Channels = RwLock<HashMap<String, Vec<Subscriber>>>;

/// Fan-out hub for response streams.
pub struct ResponseRouter {
    capacity: usize,
    sessions: Channels,
    agents: Channels,
}

impl fmt::Debug for ResponseRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseRouter")
            .field("capacity", &self.capacity)
            .field("sessions", &self.sessions.try_read().map(|s| s.len()).unwrap_or(0))
            .field("agents", &self.agents.try_read().map(|a| a.len()).unwrap_or(0))
            .finish()
    }
}

impl ResponseRouter {
    /// Creates a router that warns once a subscriber has `capacity` unread
    /// events. Nothing is dropped past that point.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sessions: RwLock::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
        }
    }

    fn subscribe_to(&self, channels: &Channels, key: &str, scope: &'static str) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));

        let mut map = channels.write().unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, subscribers| {
            subscribers.retain(|s| !s.sender.is_closed());
            !subscribers.is_empty()
        });
        map.entry(key.to_string())
            .or_default()
            .push(Subscriber { sender, backlog: Arc::clone(&backlog) });
        debug!(scope, key, "Subscriber attached");
        Subscription { receiver, backlog, scope, key: key.to_string() }
    }

    /// Subscribes to every event of a session.
    pub fn subscribe_session(&self, session_id: &str) -> Subscription {
        self.subscribe_to(&self.sessions, session_id, "session")
    }

    /// Subscribes to every chunk an agent produces, across sessions.
    pub fn subscribe_agent(&self, agent_id: &str) -> Subscription {
        self.subscribe_to(&self.agents, agent_id, "agent")
    }

    fn send(&self, channels: &Channels, key: &str, event: &RouterEvent) {
        let map = channels.read().unwrap_or_else(PoisonError::into_inner);
        let Some(subscribers) = map.get(key) else {
            return;
        };
        for subscriber in subscribers {
            // A dropped subscription is pruned on the next subscribe
            if subscriber.sender.send(event.clone()).is_err() {
                continue;
            }
            let backlog = subscriber.backlog.fetch_add(1, Ordering::AcqRel) + 1;
            if backlog == self.capacity {
                warn!(key, backlog, "Subscriber is falling behind");
            }
        }
    }

    fn publish_session(&self, session_id: &str, event: RouterEvent) {
        self.send(&self.sessions, session_id, &event);
    }

    fn publish_stream(&self, stream: &StreamId, event: RouterEvent) {
        self.send(&self.agents, &stream.agent_id, &event);
        self.publish_session(&stream.session_id, event);
    }

    /// Opens the single writer for a request.
    pub fn open_stream(
        self: &Arc<Self>,
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> ResponseStream {
        let id = StreamId {
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            request_id: request_id.into(),
        };
        debug!(stream = %id, "Stream opened");
        ResponseStream { id, router: Arc::clone(self), sequence: 0, closed: false }
    }

    /// Publishes plan progress to a session.
    pub fn publish_progress(&self, session_id: &str, progress: OrchestrationProgress) {
        self.publish_session(session_id, RouterEvent::Progress(progress));
    }

    /// Publishes a failure to a session.
    pub fn publish_error(&self, session_id: &str, error: ErrorEvent) {
        debug!(session_id, request_id = %error.request_id, kind = %error.kind, "Publishing error");
        self.publish_session(session_id, RouterEvent::Error(error));
    }

    /// Asks a session's reviewers to decide on a tool call.
    pub fn publish_approval_required(
        &self,
        session_id: &str,
        request_id: &str,
        tool_name: &str,
        reason: &str,
    ) {
        self.publish_session(
            session_id,
            RouterEvent::ApprovalRequired {
                request_id: request_id.to_string(),
                tool_name: tool_name.to_string(),
                reason: reason.to_string(),
            },
        );
    }

    /// Announces the final status of a plan.
    pub fn publish_plan_finished(&self, session_id: &str, plan_id: &str, status: PlanStatus) {
        self.publish_session(
            session_id,
            RouterEvent::PlanFinished { plan_id: plan_id.to_string(), status },
        );
    }
}

impl Default for ResponseRouter {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

/// Single-producer writer for one request's response.
///
/// Not `Clone`. Dropping an open stream closes it.
pub struct ResponseStream {
    id: StreamId,
    router: Arc<ResponseRouter>,
    sequence: u64,
    closed: bool,
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("id", &self.id)
            .field("sequence", &self.sequence)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ResponseStream {
    /// Returns the stream identifier.
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    /// Returns the number of chunks written so far.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns `true` once closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Writes a chunk.
    ///
    /// # Returns
    /// Returns `false` if the stream is closed; the chunk is dropped.
    pub fn write(&mut self, chunk: StreamChunk) -> bool {
        if self.closed {
            warn!(stream = %self.id, chunk = %chunk.response_type(), "Write after close dropped");
            return false;
        }
        let sequence = self.sequence;
        self.sequence += 1;
        self.router
            .publish_stream(&self.id, RouterEvent::Chunk { stream: self.id.clone(), sequence, chunk });
        true
    }

    /// Writes a tool result.
    ///
    /// # Returns
    /// Returns `false` if the stream is closed.
    pub fn write_tool_result(&mut self, result: ToolExecutionResult) -> bool {
        if self.closed {
            warn!(stream = %self.id, "Tool result after close dropped");
            return false;
        }
        self.router
            .publish_stream(&self.id, RouterEvent::ToolFinished { stream: self.id.clone(), result });
        true
    }

    /// Closes the stream. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!(stream = %self.id, chunks = self.sequence, "Stream closed");
        self.router.publish_stream(&self.id, RouterEvent::StreamClosed { stream: self.id.clone() });
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Receiving end of a session or agent channel.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<RouterEvent>,
    backlog: Arc<AtomicUsize>,
    scope: &'static str,
    key: String,
}

impl Subscription {
    /// Waits for the next event.
    ///
    /// Every event published after the subscription was made is delivered,
    /// in publish order.
    ///
    /// # Returns
    /// `None` once the router is gone.
    pub async fn recv(&mut self) -> Option<RouterEvent> {
        let event = self.receiver.recv().await?;
        self.backlog.fetch_sub(1, Ordering::AcqRel);
        Some(event)
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<RouterEvent> {
        let event = self.receiver.try_recv().ok()?;
        self.backlog.fetch_sub(1, Ordering::AcqRel);
        Some(event)
    }

    /// Returns the number of events published but not yet read.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!(scope = self.scope, key = %self.key, unread = self.backlog(), "Subscriber detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(subscription: &mut Subscription) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        while let Some(event) = subscription.try_recv() {
            if let RouterEvent::Chunk { chunk, .. } = event {
                out.push(chunk);
            }
        }
        out
    }

    #[test]
    fn test_every_subscriber_sees_chunks_in_order() {
        let router = Arc::new(ResponseRouter::default());
        let mut first = router.subscribe_session("s1");
        let mut second = router.subscribe_session("s1");
        let mut by_agent = router.subscribe_agent("coder");

        let mut stream = router.open_stream("s1", "coder", "r1");
        for text in ["A", "B", "C"] {
            assert!(stream.write(StreamChunk::text(text)));
        }
        stream.close();

        let expected: Vec<StreamChunk> = ["A", "B", "C"].into_iter().map(StreamChunk::text).collect();
        assert_eq!(chunks(&mut first), expected);
        assert_eq!(chunks(&mut second), expected);
        assert_eq!(chunks(&mut by_agent), expected);
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let router = Arc::new(ResponseRouter::default());
        let mut sub = router.subscribe_session("s1");
        let mut stream = router.open_stream("s1", "coder", "r1");
        stream.write(StreamChunk::text("A"));
        stream.write(StreamChunk::Complete);

        let sequences: Vec<u64> = std::iter::from_fn(|| sub.try_recv())
            .filter_map(|e| match e {
                RouterEvent::Chunk { sequence, .. } => Some(sequence),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![0, 1]);
        assert_eq!(stream.sequence(), 2);
    }

    #[test]
    fn test_close_is_idempotent_and_drops_late_writes() {
        let router = Arc::new(ResponseRouter::default());
        let mut sub = router.subscribe_session("s1");
        let mut stream = router.open_stream("s1", "coder", "r1");

        stream.close();
        stream.close();
        assert!(!stream.write(StreamChunk::text("late")));

        let events: Vec<RouterEvent> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], RouterEvent::StreamClosed { .. }));
    }

    #[test]
    fn test_drop_closes_stream() {
        let router = Arc::new(ResponseRouter::default());
        let mut sub = router.subscribe_session("s1");
        {
            let mut stream = router.open_stream("s1", "coder", "r1");
            stream.write(StreamChunk::text("A"));
        }

        let events: Vec<RouterEvent> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert!(matches!(events.last(), Some(RouterEvent::StreamClosed { .. })));
    }

    #[test]
    fn test_sessions_are_isolated() {
        let router = Arc::new(ResponseRouter::default());
        let mut other = router.subscribe_session("s2");
        let mut stream = router.open_stream("s1", "coder", "r1");
        stream.write(StreamChunk::text("A"));

        assert!(other.try_recv().is_none());
    }

    #[test]
    fn test_slow_subscriber_receives_everything_past_capacity() {
        let router = Arc::new(ResponseRouter::new(2));
        let mut sub = router.subscribe_session("s1");
        let mut stream = router.open_stream("s1", "coder", "r1");
        for text in ["A", "B", "C", "D"] {
            stream.write(StreamChunk::text(text));
        }
        assert_eq!(sub.backlog(), 4);

        let expected: Vec<StreamChunk> = ["A", "B", "C", "D"].into_iter().map(StreamChunk::text).collect();
        assert_eq!(chunks(&mut sub), expected);
        assert_eq!(sub.backlog(), 0);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let router = Arc::new(ResponseRouter::default());
        drop(router.subscribe_session("s1"));
        let mut kept = router.subscribe_session("s1");

        let mut stream = router.open_stream("s1", "coder", "r1");
        assert!(stream.write(StreamChunk::text("A")));
        assert_eq!(chunks(&mut kept), vec![StreamChunk::text("A")]);
        assert_eq!(router.sessions.read().unwrap()["s1"].len(), 1);
    }

    #[tokio::test]
    async fn test_error_event_reaches_session() {
        let router = ResponseRouter::default();
        let mut sub = router.subscribe_session("s1");
        router.publish_error(
            "s1",
            ErrorEvent::from_error("r1", &RuntimeError::AgentBusy("coder".to_string())),
        );

        match sub.recv().await {
            Some(RouterEvent::Error(event)) => {
                assert_eq!(event.kind, ErrorKind::AgentBusy);
                assert_eq!(event.request_id, "r1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
