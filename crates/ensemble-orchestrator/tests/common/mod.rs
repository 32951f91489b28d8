//! Shared fixtures for orchestrator integration tests.
//!
//! Agents are served by [`MockBackend`], whose behaviour is picked by the
//! descriptor's `mode` setting so a single factory can serve a whole test.

#![allow(dead_code)]

use async_trait::async_trait;
use ensemble_orchestrator::{
    AgentBackend, AgentDescriptor, AgentFactory, AgentKind, BackendConfig, BackendError,
    BuildResult, ChunkStream, RouterEvent, StreamChunk, Subscription,
};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long helpers wait for an event before giving up.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters shared between a test and every backend its factory builds.
#[derive(Debug, Default)]
pub struct Counters {
    pub builds: AtomicUsize,
    pub inits: AtomicUsize,
    pub sends: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Behaviour selected through the `mode` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Streams the `reply` setting (comma separated) then `Complete`.
    Reply,
    /// Streams an error chunk.
    Fail,
    /// Streams the first reply chunk, then waits for cancellation.
    Hang,
    /// Initialization fails.
    FailInit,
    /// Replies normally; shutdown fails.
    FailShutdown,
}

impl Mode {
    fn parse(value: Option<&String>) -> Self {
        match value.map(String::as_str) {
            Some("fail") => Self::Fail,
            Some("hang") => Self::Hang,
            Some("fail_init") => Self::FailInit,
            Some("fail_shutdown") => Self::FailShutdown,
            _ => Self::Reply,
        }
    }
}

/// Scriptable backend.
pub struct MockBackend {
    mode: Mode,
    reply: Vec<String>,
    init_delay: Duration,
    counters: Arc<Counters>,
}

impl MockBackend {
    fn new(descriptor: &AgentDescriptor, counters: Arc<Counters>) -> Self {
        let reply = descriptor
            .settings
            .get("reply")
            .map_or_else(|| vec!["ok".to_string()], |r| r.split(',').map(str::to_string).collect());
        let init_delay = descriptor
            .settings
            .get("init_delay_ms")
            .and_then(|ms| ms.parse().ok())
            .map_or(Duration::ZERO, Duration::from_millis);
        Self { mode: Mode::parse(descriptor.settings.get("mode")), reply, init_delay, counters }
    }
}

#[async_trait]
impl AgentBackend for MockBackend {
    async fn initialize(&self, _config: &BackendConfig) -> Result<(), BackendError> {
        self.counters.inits.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.init_delay).await;
        if self.mode == Mode::FailInit {
            return Err(BackendError::Initialization("mock refused to start".to_string()));
        }
        Ok(())
    }

    async fn send(&self, _message: &str, cancel: CancellationToken) -> Result<ChunkStream, BackendError> {
        self.counters.sends.fetch_add(1, Ordering::SeqCst);
        let mut texts: Vec<Result<StreamChunk, BackendError>> =
            self.reply.iter().map(|t| Ok(StreamChunk::text(t.clone()))).collect();

        Ok(match self.mode {
            Mode::Fail => stream::iter(vec![
                Ok(StreamChunk::text("partial")),
                Ok(StreamChunk::error("mock", "step exploded")),
                Ok(StreamChunk::Complete),
            ])
            .boxed(),
            Mode::Hang => {
                texts.truncate(1);
                stream::iter(texts)
                    .chain(stream::once(async move {
                        cancel.cancelled().await;
                        Err(BackendError::Cancelled)
                    }))
                    .boxed()
            }
            _ => {
                texts.push(Ok(StreamChunk::Complete));
                stream::iter(texts).boxed()
            }
        })
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.mode == Mode::FailShutdown {
            return Err(BackendError::Shutdown("mock refused to stop".to_string()));
        }
        Ok(())
    }
}

/// Factory whose `claude-cli` kind builds mock backends.
pub fn mock_factory(counters: &Arc<Counters>) -> AgentFactory {
    let counters = Arc::clone(counters);
    AgentFactory::new().with_backend(AgentKind::ClaudeCli, move |d: &AgentDescriptor| -> BuildResult {
        counters.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockBackend::new(d, Arc::clone(&counters))))
    })
}

/// Descriptor for a mock agent in the given mode.
pub fn mock_agent(id: &str, mode: &str) -> AgentDescriptor {
    AgentDescriptor::new(id, AgentKind::ClaudeCli).with_setting("mode", mode)
}

/// Reads events until `stop` matches one, returning everything read.
///
/// # Panics
/// Panics if no matching event arrives within [`EVENT_TIMEOUT`].
pub async fn collect_until<F>(subscription: &mut Subscription, mut stop: F) -> Vec<RouterEvent>
where
    F: FnMut(&RouterEvent) -> bool,
{
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(EVENT_TIMEOUT, subscription.recv())
            .await
            .expect("timed out waiting for event")
            .expect("router dropped");
        let done = stop(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Reads events until the stream for `request_id` closes.
pub async fn collect_stream(subscription: &mut Subscription, request_id: &str) -> Vec<RouterEvent> {
    collect_until(subscription, |event| {
        matches!(event, RouterEvent::StreamClosed { stream } if stream.request_id == request_id)
    })
    .await
}

/// Text deltas from `events`, in order.
pub fn texts(events: &[RouterEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            RouterEvent::Chunk { chunk: StreamChunk::TextDelta { text }, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}
