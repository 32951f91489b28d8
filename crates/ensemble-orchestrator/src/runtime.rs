//! Runtime facade.
//!
//! [`AgentRuntime`] is what transports talk to. It owns exactly one
//! [`AgentRegistry`] and wires the tool pipeline, approval gate and
//! orchestration engine around it. Every submitted request runs on its own
//! task and reports through the [`ResponseRouter`]; the `submit_*` calls only
//! hand back a request identifier.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::descriptor::AgentKind;
use crate::error::{Result, RuntimeError};
use crate::factory::AgentFactory;
use crate::handle::SendOutcome;
use crate::orchestration::{OrchestrationEngine, OrchestrationPlan, PlanOutcome};
use crate::registry::{AgentInfo, AgentRegistry};
use crate::router::{ErrorEvent, ResponseRouter, Subscription};
use crate::store::{DescriptorStore, InMemoryStore, PlanStore};
use crate::tools::{
    ApprovalDecision, ApprovalGate, ApprovalPolicy, PendingApproval, Tool, ToolCall, ToolPipeline,
    ToolRegistry,
};

/// Identifier returned by every `submit_*` call.
pub type RequestId = String;

type Requests = Arc<Mutex<HashMap<RequestId, CancellationToken>>>;

/// Removes a request from the active set when its task ends, panics included.
struct RequestGuard {
    requests: Requests,
    request_id: RequestId,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.request_id);
    }
}

/// Builder for [`AgentRuntime`].
///
/// Anything not supplied is derived from the [`RuntimeConfig`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    factory: Option<AgentFactory>,
    tools: ToolRegistry,
    descriptors: Option<Arc<dyn DescriptorStore>>,
    plan_store: Option<Arc<dyn PlanStore>>,
    policy: Option<Arc<dyn ApprovalPolicy>>,
}

impl RuntimeBuilder {
    /// Uses `factory` instead of the built-in backends.
    #[must_use]
    pub fn with_factory(mut self, factory: AgentFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Registers a tool agents may call.
    #[must_use]
    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tools.register(tool);
        self
    }

    /// Loads descriptors from `store` instead of the configured `[[agents]]`.
    #[must_use]
    pub fn with_descriptor_store(mut self, store: Arc<dyn DescriptorStore>) -> Self {
        self.descriptors = Some(store);
        self
    }

    /// Persists plans and outcomes to `store`.
    #[must_use]
    pub fn with_plan_store(mut self, store: Arc<dyn PlanStore>) -> Self {
        self.plan_store = Some(store);
        self
    }

    /// Overrides the configured approval policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn ApprovalPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Builds the runtime.
    ///
    /// # Errors
    /// Returns `Config` if the configuration is invalid or asks for a policy
    /// its environment forbids.
    pub fn build(self) -> Result<AgentRuntime> {
        let config = self.config;
        config.validate()?;

        let policy = match self.policy {
            Some(policy) => policy,
            None => config.approval_policy()?,
        };

        let factory = Arc::new(self.factory.unwrap_or_else(AgentFactory::with_default_backends));
        let registry = Arc::new(AgentRegistry::new(factory));
        let router = Arc::new(ResponseRouter::new(config.router.channel_capacity));
        let gate = Arc::new(ApprovalGate::new(config.approval_timeout()));

        let memory = Arc::new(InMemoryStore::with_descriptors(config.agents.iter().cloned()));
        let descriptors = self
            .descriptors
            .unwrap_or_else(|| Arc::clone(&memory) as Arc<dyn DescriptorStore>);
        let plan_store = self.plan_store.unwrap_or_else(|| memory as Arc<dyn PlanStore>);

        let tool_count = self.tools.len();
        let pipeline = ToolPipeline::new(Arc::new(self.tools), Arc::clone(&gate), Arc::clone(&router))
            .with_policy(policy)
            .with_config(config.pipeline_config())
            .with_agents(Arc::clone(&registry), Arc::clone(&descriptors));
        let engine = OrchestrationEngine::new(
            Arc::clone(&registry),
            Arc::clone(&descriptors),
            Arc::clone(&router),
            config.engine_config(),
        )
        .with_plan_store(plan_store);

        info!(
            environment = %config.environment,
            policy = pipeline.policy().name(),
            tools = tool_count,
            agents = config.agents.len(),
            "Agent runtime ready"
        );

        Ok(AgentRuntime {
            config,
            registry,
            router,
            gate,
            descriptors,
            pipeline: Arc::new(pipeline),
            engine: Arc::new(engine),
            requests: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }
}

/// Entry point for transports and subscribers.
pub struct AgentRuntime {
    config: RuntimeConfig,
    registry: Arc<AgentRegistry>,
    router: Arc<ResponseRouter>,
    gate: Arc<ApprovalGate>,
    descriptors: Arc<dyn DescriptorStore>,
    pipeline: Arc<ToolPipeline>,
    engine: Arc<OrchestrationEngine>,
    requests: Requests,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("environment", &self.config.environment)
            .field("registry", &self.registry)
            .field("active_requests", &self.active_requests())
            .field("shutting_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl AgentRuntime {
    /// Starts building a runtime from `config`.
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            factory: None,
            tools: ToolRegistry::new(),
            descriptors: None,
            plan_store: None,
            policy: None,
        }
    }

    /// Builds a runtime with everything derived from `config`.
    ///
    /// # Errors
    /// See [`RuntimeBuilder::build`].
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<ResponseRouter> {
        &self.router
    }

    /// Agent kinds this runtime can build.
    pub fn available_kinds(&self) -> Vec<AgentKind> {
        self.registry.factory().available_kinds()
    }

    /// Live agents, sorted by id.
    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        self.registry.list().await
    }

    /// Number of requests still running.
    pub fn active_requests(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Tool calls waiting for a reviewer.
    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.gate.pending()
    }

    /// Subscribes to every event for a session.
    pub fn subscribe(&self, session_id: &str) -> Subscription {
        self.router.subscribe_session(session_id)
    }

    /// Subscribes to every stream an agent writes, across sessions.
    pub fn subscribe_agent(&self, agent_id: &str) -> Subscription {
        self.router.subscribe_agent(agent_id)
    }

    /// Sends `content` to an agent, creating it on first use.
    ///
    /// Chunks arrive on the session's subscriptions; a failure arrives as an
    /// error event before the stream closes.
    ///
    /// # Errors
    /// Returns `ShuttingDown` once [`shutdown`](Self::shutdown) has begun.
    pub fn submit_message(
        &self,
        agent_id: impl Into<String>,
        session_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<RequestId> {
        let agent_id = agent_id.into();
        let session_id = session_id.into();
        let content = content.into();
        let registry = Arc::clone(&self.registry);
        let descriptors = Arc::clone(&self.descriptors);
        let router = Arc::clone(&self.router);

        self.spawn_request(move |request_id, cancel| async move {
            let mut stream = router.open_stream(&session_id, &agent_id, &request_id);
            let result: Result<SendOutcome> = async {
                let handle = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                    handle = registry.get_or_load(&agent_id, &descriptors) => handle?,
                };
                handle
                    .send(&content, &cancel, |chunk| {
                        stream.write(chunk);
                    })
                    .await
            }
            .await;

            match result {
                Ok(outcome) => {
                    debug!(request_id = %request_id, chunks = outcome.chunks, "Message delivered");
                }
                Err(e) => {
                    warn!(request_id = %request_id, agent_id = %agent_id, error = %e, "Message failed");
                    router.publish_error(&session_id, ErrorEvent::from_error(&request_id, &e));
                }
            }
            stream.close();
        })
    }

    /// Runs a tool call through validation, approval and execution.
    ///
    /// # Errors
    /// Returns `ShuttingDown` once [`shutdown`](Self::shutdown) has begun.
    pub fn submit_tool_call(&self, call: ToolCall) -> Result<RequestId> {
        let pipeline = Arc::clone(&self.pipeline);
        self.spawn_request(move |request_id, cancel| async move {
            match pipeline.run(&request_id, &call, &cancel).await {
                Ok(result) => {
                    debug!(request_id = %request_id, success = result.is_success(), "Tool call finished");
                }
                Err(e) => debug!(request_id = %request_id, error = %e, "Tool call stopped"),
            }
        })
    }

    /// Resolves a pending approval.
    ///
    /// # Errors
    /// Returns `UnknownApprovalRequest` if nothing is waiting on `request_id`.
    pub fn submit_approval_decision(&self, request_id: &str, decision: ApprovalDecision) -> Result<()> {
        self.gate.decide(request_id, decision)
    }

    /// Starts a plan. Progress and the final status go to the plan's session.
    ///
    /// # Errors
    /// Returns `PlanLocked` if the plan already ran, or `ShuttingDown`.
    pub fn submit_plan(&self, plan: OrchestrationPlan) -> Result<RequestId> {
        if plan.is_locked() {
            return Err(RuntimeError::PlanLocked(plan.id));
        }
        let engine = Arc::clone(&self.engine);
        let router = Arc::clone(&self.router);
        self.spawn_request(move |request_id, cancel| async move {
            if let Err(e) = engine.execute(&plan, &request_id, &cancel).await {
                warn!(request_id = %request_id, plan_id = %plan.id, error = %e, "Plan rejected");
                router.publish_error(&plan.session_id, ErrorEvent::from_error(&request_id, &e));
            }
        })
    }

    /// Runs a plan on the caller's task and returns its outcome.
    ///
    /// # Errors
    /// Returns `PlanLocked` if the plan already ran, or `ShuttingDown`.
    pub async fn execute_plan(&self, plan: &OrchestrationPlan) -> Result<PlanOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(RuntimeError::ShuttingDown);
        }
        let cancel = self.shutdown.child_token();
        self.engine.execute(plan, &Uuid::new_v4().to_string(), &cancel).await
    }

    /// Cancels a running request. Returns `false` if it already finished.
    pub fn cancel(&self, request_id: &str) -> bool {
        let token = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(request_id)
            .cloned();
        match token {
            Some(token) => {
                info!(request_id, "Cancelling request");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stops accepting work, cancels every request, waits for their tasks and
    /// disposes every agent. Returns the number of agents disposed.
    pub async fn shutdown(&self) -> usize {
        if self.shutdown.is_cancelled() {
            debug!("Runtime already shutting down");
        }
        info!(active_requests = self.active_requests(), "Shutting down agent runtime");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let disposed = self.registry.dispose_all().await;
        info!(disposed, "Agent runtime stopped");
        disposed
    }

    fn spawn_request<F, Fut>(&self, work: F) -> Result<RequestId>
    where
        F: FnOnce(RequestId, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(RuntimeError::ShuttingDown);
        }

        let request_id = Uuid::new_v4().to_string();
        let cancel = self.shutdown.child_token();
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id.clone(), cancel.clone());

        let guard = RequestGuard { requests: Arc::clone(&self.requests), request_id: request_id.clone() };
        let task = work(request_id.clone(), cancel);
        self.tasks.spawn(async move {
            let _guard = guard;
            task.await;
        });
        Ok(request_id)
    }
}
