//! Agent factory.
//!
//! Builds and initializes handles for a requested [`AgentKind`]. The table of
//! registered builders is the single source of truth for both
//! [`AgentFactory::available_kinds`] and [`AgentFactory::create`], so a kind is
//! advertised exactly when it can be constructed.

use chrono::{DateTime, Utc};
use ensemble_abstraction::{AgentBackend, BackendError};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::backends::{CliBackend, HttpBackend};
use crate::descriptor::{AgentDescriptor, AgentKind};
use crate::error::{Result, RuntimeError};
use crate::handle::AgentHandle;
use crate::lifecycle::AgentState;

/// Return type of a backend builder.
pub type BuildResult = std::result::Result<Arc<dyn AgentBackend>, BackendError>;

/// Constructs the backend for one agent kind.
pub trait BackendBuilder: Send + Sync {
    /// Builds an uninitialized backend for the descriptor.
    ///
    /// # Errors
    /// Returns a `BackendError` if the descriptor cannot be served.
    fn build(&self, descriptor: &AgentDescriptor) -> BuildResult;
}

impl<F> BackendBuilder for F
where
    F: Fn(&AgentDescriptor) -> BuildResult + Send + Sync,
{
    fn build(&self, descriptor: &AgentDescriptor) -> BuildResult {
        self(descriptor)
    }
}

/// Record of a handle this factory produced.
#[derive(Debug, Clone)]
pub struct CreatedAgent {
    /// Agent identifier.
    pub agent_id: String,
    /// Agent kind.
    pub kind: AgentKind,
    /// When the handle was created.
    pub created_at: DateTime<Utc>,
    handle: Weak<AgentHandle>,
}

impl CreatedAgent {
    /// Returns the handle if it is still alive and not disposed.
    pub fn live_handle(&self) -> Option<Arc<AgentHandle>> {
        self.handle.upgrade().filter(|h| h.state() != AgentState::Disposed)
    }
}

/// Factory for agent handles.
pub struct AgentFactory {
    builders: BTreeMap<AgentKind, Arc<dyn BackendBuilder>>,
    created: RwLock<Vec<CreatedAgent>>,
}

impl fmt::Debug for AgentFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentFactory")
            .field("kinds", &self.available_kinds())
            .field("created", &self.created.try_read().map(|c| c.len()).unwrap_or(0))
            .finish()
    }
}

impl AgentFactory {
    /// Creates a factory with no registered kinds.
    #[must_use]
    pub fn new() -> Self {
        Self { builders: BTreeMap::new(), created: RwLock::new(Vec::new()) }
    }

    /// Creates a factory with the CLI and HTTP backends registered.
    #[must_use]
    pub fn with_default_backends() -> Self {
        Self::new()
            .with_backend(AgentKind::ClaudeCli, |descriptor: &AgentDescriptor| -> BuildResult {
                Ok(Arc::new(CliBackend::new(descriptor)?))
            })
            .with_backend(AgentKind::HttpProvider, |descriptor: &AgentDescriptor| -> BuildResult {
                Ok(Arc::new(HttpBackend::new(descriptor)?))
            })
    }

    /// Registers (or replaces) the builder for a kind.
    #[must_use]
    pub fn with_backend(mut self, kind: AgentKind, builder: impl BackendBuilder + 'static) -> Self {
        self.register(kind, builder);
        self
    }

    /// Registers (or replaces) the builder for a kind.
    pub fn register(&mut self, kind: AgentKind, builder: impl BackendBuilder + 'static) {
        if self.builders.insert(kind, Arc::new(builder)).is_some() {
            warn!(kind = %kind, "Backend builder replaced");
        }
    }

    /// Returns the kinds this factory can construct.
    pub fn available_kinds(&self) -> Vec<AgentKind> {
        self.builders.keys().copied().collect()
    }

    /// Returns `true` if the kind can be constructed.
    pub fn supports(&self, kind: AgentKind) -> bool {
        self.builders.contains_key(&kind)
    }

    /// Builds and initializes a handle.
    ///
    /// # Errors
    /// `UnsupportedKind` if no builder is registered for the descriptor's kind,
    /// `InitializationFailed` if the backend cannot be built or initialized.
    pub async fn create(&self, descriptor: &AgentDescriptor) -> Result<Arc<AgentHandle>> {
        let builder = self
            .builders
            .get(&descriptor.kind)
            .ok_or(RuntimeError::UnsupportedKind(descriptor.kind))?;

        debug!(agent_id = %descriptor.id, kind = %descriptor.kind, "Creating agent");

        let backend = builder.build(descriptor).map_err(|e| RuntimeError::InitializationFailed {
            agent_id: descriptor.id.clone(),
            reason: e.to_string(),
        })?;
        let handle = Arc::new(AgentHandle::new(descriptor.clone(), backend));

        if let Err(e) = handle.initialize().await {
            if let Err(shutdown) = handle.dispose().await {
                warn!(agent_id = %descriptor.id, error = %shutdown, "Cleanup after failed initialization failed");
            }
            return Err(e);
        }

        let mut created = self.created.write().await;
        created.retain(|c| c.handle.strong_count() > 0);
        created.push(CreatedAgent {
            agent_id: descriptor.id.clone(),
            kind: descriptor.kind,
            created_at: handle.created_at(),
            handle: Arc::downgrade(&handle),
        });
        drop(created);

        Ok(handle)
    }

    /// Returns the handles this factory created that are still referenced,
    /// in creation order. Records of dropped handles are forgotten.
    pub async fn created(&self) -> Vec<CreatedAgent> {
        self.created.read().await.iter().filter(|c| c.handle.strong_count() > 0).cloned().collect()
    }

    /// Returns the number of created handles that are still referenced.
    pub async fn created_count(&self) -> usize {
        self.created.read().await.iter().filter(|c| c.handle.strong_count() > 0).count()
    }
}

impl Default for AgentFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ensemble_abstraction::{BackendConfig, ChunkStream};
    use tokio_util::sync::CancellationToken;

    struct StubBackend {
        init_error: Option<String>,
    }

    #[async_trait]
    impl AgentBackend for StubBackend {
        async fn initialize(&self, _config: &BackendConfig) -> std::result::Result<(), BackendError> {
            match &self.init_error {
                Some(reason) => Err(BackendError::Initialization(reason.clone())),
                None => Ok(()),
            }
        }

        async fn send(
            &self,
            _message: &str,
            _cancel: CancellationToken,
        ) -> std::result::Result<ChunkStream, BackendError> {
            Err(BackendError::Other("not used".to_string()))
        }

        async fn shutdown(&self) -> std::result::Result<(), BackendError> {
            Ok(())
        }
    }

    fn stub(init_error: Option<&str>) -> impl BackendBuilder {
        let init_error = init_error.map(str::to_string);
        move |_: &AgentDescriptor| -> BuildResult {
            Ok(Arc::new(StubBackend { init_error: init_error.clone() }))
        }
    }

    #[tokio::test]
    async fn test_create_registered_kind() {
        let factory = AgentFactory::new().with_backend(AgentKind::ClaudeCli, stub(None));
        let handle =
            factory.create(&AgentDescriptor::new("coder", AgentKind::ClaudeCli)).await.unwrap();

        assert_eq!(handle.id(), "coder");
        assert_eq!(handle.state(), AgentState::Ready);
        assert_eq!(factory.created_count().await, 1);
        let created = factory.created().await;
        assert_eq!(created[0].agent_id, "coder");
        assert!(created[0].live_handle().is_some());
    }

    #[tokio::test]
    async fn test_dropped_handles_are_not_tracked() {
        let factory = AgentFactory::new().with_backend(AgentKind::ClaudeCli, stub(None));
        for _ in 0..10 {
            let handle =
                factory.create(&AgentDescriptor::new("coder", AgentKind::ClaudeCli)).await.unwrap();
            handle.dispose().await.unwrap();
        }
        let kept =
            factory.create(&AgentDescriptor::new("reviewer", AgentKind::ClaudeCli)).await.unwrap();

        assert_eq!(factory.created.read().await.len(), 1);
        assert_eq!(factory.created_count().await, 1);
        let created = factory.created().await;
        assert_eq!(created[0].agent_id, "reviewer");
        assert!(Arc::ptr_eq(&created[0].live_handle().unwrap(), &kept));

        drop(kept);
        assert!(factory.created().await.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_unsupported() {
        let factory = AgentFactory::new().with_backend(AgentKind::ClaudeCli, stub(None));
        let err = factory
            .create(&AgentDescriptor::new("reviewer", AgentKind::HttpProvider))
            .await
            .unwrap_err();

        assert!(matches!(err, RuntimeError::UnsupportedKind(AgentKind::HttpProvider)));
        assert_eq!(factory.created_count().await, 0);
    }

    #[tokio::test]
    async fn test_initialization_failure_is_typed() {
        let factory =
            AgentFactory::new().with_backend(AgentKind::ClaudeCli, stub(Some("not logged in")));
        let err =
            factory.create(&AgentDescriptor::new("coder", AgentKind::ClaudeCli)).await.unwrap_err();

        match err {
            RuntimeError::InitializationFailed { agent_id, reason } => {
                assert_eq!(agent_id, "coder");
                assert!(reason.contains("not logged in"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(factory.created_count().await, 0);
    }

    #[tokio::test]
    async fn test_available_kinds_match_constructible_kinds() {
        let factory = AgentFactory::new().with_backend(AgentKind::HttpProvider, stub(None));
        assert_eq!(factory.available_kinds(), vec![AgentKind::HttpProvider]);

        for kind in [AgentKind::ClaudeCli, AgentKind::HttpProvider] {
            let result = factory.create(&AgentDescriptor::new("a", kind)).await;
            assert_eq!(factory.supports(kind), result.is_ok());
        }
    }

    #[test]
    fn test_default_backends_cover_every_kind() {
        let factory = AgentFactory::with_default_backends();
        assert_eq!(factory.available_kinds(), vec![AgentKind::ClaudeCli, AgentKind::HttpProvider]);
    }
}
