//! Agent registry.
//!
//! Process-wide cache from agent identifier to live [`AgentHandle`]. Creation
//! is single-flight: concurrent callers asking for the same unseen identifier
//! share one in-flight creation, and only the first caller's descriptor
//! function ever runs.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use chrono::{DateTime, Utc};

use crate::descriptor::{AgentDescriptor, AgentKind};
use crate::error::{Result, RuntimeError};
use crate::factory::AgentFactory;
use crate::handle::AgentHandle;
use crate::lifecycle::AgentState;
use crate::store::DescriptorStore;

type Creation = Shared<BoxFuture<'static, Result<Arc<AgentHandle>>>>;

enum Slot {
    Ready(Arc<AgentHandle>),
    Pending(Creation),
}

enum Lookup {
    Live(Arc<AgentHandle>),
    Stale(Arc<AgentHandle>),
    InFlight(Creation),
    Vacant,
}

/// Snapshot of a registered agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    /// The agent's unique ID.
    pub id: String,
    /// The agent's kind.
    pub kind: AgentKind,
    /// Current handle state.
    pub state: AgentState,
    /// When the handle was created.
    pub created_at: DateTime<Utc>,
}

/// Registry for live agent handles.
pub struct AgentRegistry {
    factory: Arc<AgentFactory>,
    slots: RwLock<HashMap<String, Slot>>,
    closed: AtomicBool,
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agent_count", &self.slots.try_read().map(|s| s.len()).unwrap_or(0))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl AgentRegistry {
    /// Creates an empty registry that builds handles through `factory`.
    #[must_use]
    pub fn new(factory: Arc<AgentFactory>) -> Self {
        Self { factory, slots: RwLock::new(HashMap::new()), closed: AtomicBool::new(false) }
    }

    /// Returns the factory backing this registry.
    pub fn factory(&self) -> &Arc<AgentFactory> {
        &self.factory
    }

    /// Looks up a live handle. In-flight creations are not visible.
    pub async fn find(&self, id: &str) -> Option<Arc<AgentHandle>> {
        match self.slots.read().await.get(id) {
            Some(Slot::Ready(handle)) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    /// Returns the cached handle for `id`, creating it on a miss.
    ///
    /// On a miss `descriptor_fn` is invoked to obtain the descriptor and the
    /// factory builds the handle. Concurrent callers for the same identifier
    /// wait on that single creation; their own `descriptor_fn` is never
    /// called. A failed creation is reported to every waiter and the slot is
    /// cleared so a later call may retry. Cached handles in `Error` state are
    /// replaced.
    ///
    /// # Errors
    /// Any error from `descriptor_fn` or the factory, or `AgentDisposed` if the
    /// registry has been disposed or the entry was removed mid-creation.
    pub async fn get_or_create<F, Fut>(&self, id: &str, descriptor_fn: F) -> Result<Arc<AgentHandle>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AgentDescriptor>> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RuntimeError::AgentDisposed(id.to_string()));
        }

        let (creation, stale) = {
            let mut slots = self.slots.write().await;
            // dispose_all may have drained the map while we waited for the lock
            if self.closed.load(Ordering::SeqCst) {
                return Err(RuntimeError::AgentDisposed(id.to_string()));
            }
            let lookup = match slots.get(id) {
                Some(Slot::Ready(handle)) if handle.state().is_unusable() => {
                    Lookup::Stale(Arc::clone(handle))
                }
                Some(Slot::Ready(handle)) => Lookup::Live(Arc::clone(handle)),
                Some(Slot::Pending(creation)) => Lookup::InFlight(creation.clone()),
                None => Lookup::Vacant,
            };

            match lookup {
                Lookup::Live(handle) => return Ok(handle),
                Lookup::InFlight(creation) => {
                    debug!(agent_id = %id, "Joining in-flight creation");
                    (creation, None)
                }
                Lookup::Stale(_) | Lookup::Vacant => {
                    let stale = match lookup {
                        Lookup::Stale(handle) => Some(handle),
                        _ => None,
                    };
                    let creation = self.start_creation(id, descriptor_fn());
                    slots.insert(id.to_string(), Slot::Pending(creation.clone()));
                    (creation, stale)
                }
            }
        };

        if let Some(stale) = stale {
            debug!(agent_id = %id, state = %stale.state(), "Replacing unusable handle");
            if let Err(e) = stale.dispose().await {
                warn!(agent_id = %id, error = %e, "Failed to dispose replaced handle");
            }
        }

        let result = creation.clone().await;
        self.finish_creation(id, &creation, result).await
    }

    /// Returns the handle for `id`, loading its descriptor from `store` on a miss.
    ///
    /// # Errors
    /// `AgentNotFound` if the store has no descriptor, otherwise as
    /// [`get_or_create`](Self::get_or_create).
    pub async fn get_or_load(
        &self,
        id: &str,
        store: &Arc<dyn DescriptorStore>,
    ) -> Result<Arc<AgentHandle>> {
        let store = Arc::clone(store);
        let agent_id = id.to_string();
        self.get_or_create(id, move || async move {
            let descriptor = store.load_descriptor(&agent_id).await?;
            descriptor.ok_or(RuntimeError::AgentNotFound(agent_id))
        })
        .await
    }

    fn start_creation<Fut>(&self, id: &str, descriptor: Fut) -> Creation
    where
        Fut: Future<Output = Result<AgentDescriptor>> + Send + 'static,
    {
        let factory = Arc::clone(&self.factory);
        let agent_id = id.to_string();
        debug!(agent_id = %agent_id, "Starting agent creation");

        async move {
            let descriptor = descriptor.await?;
            if descriptor.id != agent_id {
                return Err(RuntimeError::InitializationFailed {
                    agent_id,
                    reason: format!("descriptor is for agent '{}'", descriptor.id),
                });
            }
            factory.create(&descriptor).await
        }
        .boxed()
        .shared()
    }

    async fn finish_creation(
        &self,
        id: &str,
        creation: &Creation,
        result: Result<Arc<AgentHandle>>,
    ) -> Result<Arc<AgentHandle>> {
        let mut slots = self.slots.write().await;
        let current = slots.get(id);
        let ours = matches!(current, Some(Slot::Pending(c)) if c.ptr_eq(creation));

        match result {
            Ok(handle) if ours && !self.closed.load(Ordering::SeqCst) => {
                info!(agent_id = %id, kind = %handle.kind(), "Agent registered");
                slots.insert(id.to_string(), Slot::Ready(Arc::clone(&handle)));
                Ok(handle)
            }
            Ok(handle) => {
                if !ours && matches!(current, Some(Slot::Ready(h)) if Arc::ptr_eq(h, &handle)) {
                    // Another waiter already installed it
                    return Ok(handle);
                }
                if ours {
                    slots.remove(id);
                }
                drop(slots);
                warn!(agent_id = %id, "Agent removed or registry closed while being created; disposing");
                if let Err(e) = handle.dispose().await {
                    warn!(agent_id = %id, error = %e, "Failed to dispose orphaned handle");
                }
                Err(RuntimeError::AgentDisposed(id.to_string()))
            }
            Err(e) => {
                if ours {
                    slots.remove(id);
                }
                warn!(agent_id = %id, error = %e, "Agent creation failed");
                Err(e)
            }
        }
    }

    /// Removes and disposes a handle.
    ///
    /// Disposal failures are logged, never returned. Removing an identifier
    /// whose creation is in flight makes that creation dispose its handle.
    ///
    /// # Returns
    /// Returns `true` if an entry was removed.
    pub async fn remove(&self, id: &str) -> bool {
        let slot = self.slots.write().await.remove(id);
        match slot {
            Some(Slot::Ready(handle)) => {
                if let Err(e) = handle.dispose().await {
                    warn!(agent_id = %id, error = %e, "Disposal failed during removal");
                }
                debug!(agent_id = %id, "Agent removed");
                true
            }
            Some(Slot::Pending(_)) => {
                debug!(agent_id = %id, "Removed agent with creation in flight");
                true
            }
            None => {
                warn!(agent_id = %id, "Attempted to remove non-existent agent");
                false
            }
        }
    }

    /// Disposes every live handle concurrently and closes the registry.
    ///
    /// Individual disposal errors (and panics) are logged and swallowed.
    ///
    /// # Returns
    /// The number of handles disposed.
    pub async fn dispose_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let handles: Vec<Arc<AgentHandle>> = self
            .slots
            .write()
            .await
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Ready(handle) => Some(handle),
                Slot::Pending(_) => None,
            })
            .collect();

        let tasks = handles.into_iter().map(|handle| {
            tokio::spawn(async move {
                let id = handle.id().to_string();
                (id, handle.dispose().await)
            })
        });

        let mut disposed = 0;
        for joined in futures::future::join_all(tasks).await {
            disposed += 1;
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => warn!(agent_id = %id, error = %e, "Disposal failed during shutdown"),
                Err(e) => warn!(error = %e, "Disposal task panicked during shutdown"),
            }
        }

        info!(count = disposed, "Agent registry disposed");
        disposed
    }

    /// Returns `true` once [`dispose_all`](Self::dispose_all) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Lists all live handles.
    pub async fn list(&self) -> Vec<AgentInfo> {
        let slots = self.slots.read().await;
        let mut agents: Vec<AgentInfo> = slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(handle) => Some(AgentInfo {
                    id: handle.id().to_string(),
                    kind: handle.kind(),
                    state: handle.state(),
                    created_at: handle.created_at(),
                }),
                Slot::Pending(_) => None,
            })
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Returns the number of live handles.
    pub async fn count(&self) -> usize {
        self.slots.read().await.values().filter(|slot| matches!(slot, Slot::Ready(_))).count()
    }
}
