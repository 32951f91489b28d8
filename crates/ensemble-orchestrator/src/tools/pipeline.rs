// Tool execution pipeline
//
// validate -> approve -> execute -> result. Every stage reports to the call's
// response stream; a failing stage stops the pipeline and is published as an
// error event on the session. When agents are attached, the originating agent
// is held Busy for the execute stage.

use ensemble_abstraction::StreamChunk;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, RuntimeError};
use crate::handle::AgentHandle;
use crate::registry::AgentRegistry;
use crate::router::{ErrorEvent, ResponseRouter, ResponseStream};
use crate::store::DescriptorStore;

use super::approval::{ApprovalGate, ApprovalPolicy, ManualApprovalPolicy, PolicyDecision};
use super::registry::ToolRegistry;
use super::tool::{Tool, ToolCall, ToolContext, ToolExecutionResult};
use super::validation;

/// Default wall-clock limit for one tool execution.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Wall-clock limit for the execute stage
    pub execution_timeout: Duration,
    /// Working directory handed to tools
    pub working_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { execution_timeout: DEFAULT_EXECUTION_TIMEOUT, working_dir: PathBuf::from(".") }
    }
}

/// Where the originating agent of a call is resolved.
struct AgentSource {
    registry: Arc<AgentRegistry>,
    descriptors: Arc<dyn DescriptorStore>,
}

/// Runs tool calls through validation, approval and execution.
pub struct ToolPipeline {
    tools: Arc<ToolRegistry>,
    policy: Arc<dyn ApprovalPolicy>,
    gate: Arc<ApprovalGate>,
    router: Arc<ResponseRouter>,
    agents: Option<AgentSource>,
    config: PipelineConfig,
}

impl fmt::Debug for ToolPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolPipeline")
            .field("tools", &self.tools.names())
            .field("policy", &self.policy.name())
            .field("binds_agents", &self.agents.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ToolPipeline {
    /// Creates a pipeline with the manual approval policy.
    pub fn new(tools: Arc<ToolRegistry>, gate: Arc<ApprovalGate>, router: Arc<ResponseRouter>) -> Self {
        Self {
            tools,
            policy: Arc::new(ManualApprovalPolicy),
            gate,
            router,
            agents: None,
            config: PipelineConfig::default(),
        }
    }

    /// Holds each call's agent `Busy` while the tool executes, so a call and a
    /// send never run against the same agent at once.
    #[must_use]
    pub fn with_agents(mut self, registry: Arc<AgentRegistry>, descriptors: Arc<dyn DescriptorStore>) -> Self {
        self.agents = Some(AgentSource { registry, descriptors });
        self
    }

    /// Replaces the approval policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn ApprovalPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the pipeline settings.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the active approval policy.
    pub fn policy(&self) -> &Arc<dyn ApprovalPolicy> {
        &self.policy
    }

    /// Runs one call.
    ///
    /// Timeouts, cancellation during execution and handler failures produce a
    /// failed [`ToolExecutionResult`], not an error.
    ///
    /// # Errors
    /// `ValidationFailed`, `ApprovalDenied`, `ApprovalTimedOut`, or `Cancelled`
    /// while waiting for approval. With agents attached, `AgentNotFound` or
    /// `AgentBusy` when the originating agent cannot be held. Nothing past the
    /// failing stage runs.
    pub async fn run(
        &self,
        request_id: &str,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ToolExecutionResult> {
        let mut stream = self.router.open_stream(&call.session_id, &call.agent_id, request_id);

        let outcome: Result<ToolExecutionResult> = async {
            let tool = self.prepare(request_id, call, cancel, &mut stream).await?;
            let agent = self.resolve_agent(call, cancel).await?;
            let _lease = agent.as_deref().map(AgentHandle::try_reserve).transpose()?;
            Ok(self.execute(tool, call, cancel, &mut stream).await)
        }
        .await;

        let result = match outcome {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(request_id, tool = %call.tool_name, error = %e, "Tool call rejected");
                self.router.publish_error(&call.session_id, ErrorEvent::from_error(request_id, &e));
                Err(e)
            }
        };

        if let Ok(result) = &result {
            if let Some(error) = result.error() {
                let error = match error {
                    "timeout" => RuntimeError::ExecutionTimeout {
                        operation: format!("tool '{}'", call.tool_name),
                        limit: self.config.execution_timeout,
                    },
                    "cancelled" => RuntimeError::Cancelled,
                    other => RuntimeError::ToolFailed {
                        tool: call.tool_name.clone(),
                        reason: other.to_string(),
                    },
                };
                self.router.publish_error(&call.session_id, ErrorEvent::from_error(request_id, &error));
            }
            stream.write_tool_result(result.clone());
        }
        stream.close();
        result
    }

    async fn prepare<'a>(
        &'a self,
        request_id: &str,
        call: &ToolCall,
        cancel: &CancellationToken,
        stream: &mut ResponseStream,
    ) -> Result<&'a Tool> {
        let tool = validation::validate(&self.tools, call)?;
        debug!(request_id, tool = %call.tool_name, "Tool call validated");

        match self.policy.evaluate(call) {
            PolicyDecision::Approved => {
                debug!(request_id, policy = self.policy.name(), "Tool call approved by policy");
            }
            PolicyDecision::Denied { reason } => {
                return Err(RuntimeError::ApprovalDenied { tool: call.tool_name.clone(), reason });
            }
            PolicyDecision::NeedsManualApproval { reason } => {
                let waiter = self.gate.register(request_id, call)?;
                self.router.publish_approval_required(
                    &call.session_id,
                    request_id,
                    &call.tool_name,
                    &reason,
                );
                stream.write(StreamChunk::status(format!("awaiting approval: {reason}")));
                waiter.wait(cancel).await?;
                debug!(request_id, tool = %call.tool_name, "Tool call approved by reviewer");
            }
        }

        Ok(tool)
    }

    async fn resolve_agent(
        &self,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<AgentHandle>>> {
        let Some(agents) = &self.agents else {
            return Ok(None);
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(RuntimeError::Cancelled),
            handle = agents.registry.get_or_load(&call.agent_id, &agents.descriptors) => handle.map(Some),
        }
    }

    async fn execute(
        &self,
        tool: &Tool,
        call: &ToolCall,
        cancel: &CancellationToken,
        stream: &mut ResponseStream,
    ) -> ToolExecutionResult {
        let token = cancel.child_token();
        let (context, mut progress) =
            ToolContext::new(self.config.working_dir.clone(), token.clone(), call);
        let context = context.with_data("call_id", call.id.clone());
        let started = Instant::now();

        let execution = tool.handler.execute(call, &context);
        tokio::pin!(execution);
        let deadline = tokio::time::sleep(self.config.execution_timeout);
        tokio::pin!(deadline);

        let result = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    token.cancel();
                    break ToolExecutionResult::cancelled();
                }
                () = &mut deadline => {
                    token.cancel();
                    warn!(tool = %call.tool_name, limit = ?self.config.execution_timeout, "Tool execution timed out");
                    break ToolExecutionResult::timeout();
                }
                Some(message) = progress.recv() => {
                    stream.write(StreamChunk::status(message));
                }
                outcome = &mut execution => {
                    break match outcome {
                        Ok(output) => ToolExecutionResult::success(output),
                        Err(e) => ToolExecutionResult::failure(e.to_string(), None),
                    };
                }
            }
        };

        while let Ok(message) = progress.try_recv() {
            stream.write(StreamChunk::status(message));
        }

        let elapsed = started.elapsed();
        info!(
            tool = %call.tool_name,
            call_id = %call.id,
            success = result.is_success(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Tool call finished"
        );
        result
            .with_elapsed(elapsed)
            .with_metadata("tool", call.tool_name.clone())
            .with_metadata("call_id", call.id.clone())
    }
}
