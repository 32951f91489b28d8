//! Tool approval.
//!
//! An [`ApprovalPolicy`] decides each call up front. Calls that need a human
//! go through the [`ApprovalGate`], which parks the call until a reviewer
//! decision arrives, the wait times out, or the call is cancelled.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Environment;
use crate::error::{Result, RuntimeError};

use super::tool::ToolCall;

/// Default time a call waits for a reviewer.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Verdict of an approval policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Run without asking.
    Approved,
    /// Refuse outright.
    Denied {
        /// Why the call was refused
        reason: String,
    },
    /// Ask a reviewer.
    NeedsManualApproval {
        /// What the reviewer is shown
        reason: String,
    },
}

/// A reviewer's answer to an approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Let the call run.
    Approve,
    /// Refuse the call.
    Deny {
        /// Reported back to the session
        reason: String,
    },
}

/// Strategy deciding whether a tool call may run.
pub trait ApprovalPolicy: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Evaluates a call.
    fn evaluate(&self, call: &ToolCall) -> PolicyDecision;
}

/// Sends every call to a reviewer. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualApprovalPolicy;

impl ApprovalPolicy for ManualApprovalPolicy {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn evaluate(&self, call: &ToolCall) -> PolicyDecision {
        PolicyDecision::NeedsManualApproval {
            reason: format!("tool '{}' requires approval", call.tool_name),
        }
    }
}

/// Allow and deny lists with a manual fallback.
///
/// Patterns are exact tool names, or a prefix followed by `*`. Deny wins over
/// allow.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedPolicy {
    allow: BTreeSet<String>,
    deny: BTreeSet<String>,
}

impl RuleBasedPolicy {
    /// Creates a policy from allow and deny patterns.
    pub fn new<A, D>(allow: A, deny: D) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self {
            allow: allow.into_iter().map(Into::into).collect(),
            deny: deny.into_iter().map(Into::into).collect(),
        }
    }

    fn find<'a>(patterns: &'a BTreeSet<String>, tool: &str) -> Option<&'a str> {
        patterns
            .iter()
            .find(|pattern| match pattern.strip_suffix('*') {
                Some(prefix) => tool.starts_with(prefix),
                None => pattern.as_str() == tool,
            })
            .map(String::as_str)
    }
}

impl ApprovalPolicy for RuleBasedPolicy {
    fn name(&self) -> &'static str {
        "rules"
    }

    fn evaluate(&self, call: &ToolCall) -> PolicyDecision {
        if let Some(pattern) = Self::find(&self.deny, &call.tool_name) {
            return PolicyDecision::Denied { reason: format!("matched deny rule '{pattern}'") };
        }
        if Self::find(&self.allow, &call.tool_name).is_some() {
            return PolicyDecision::Approved;
        }
        PolicyDecision::NeedsManualApproval {
            reason: format!("no rule matches tool '{}'", call.tool_name),
        }
    }
}

/// Approves everything. Refuses to exist in production.
#[derive(Debug, Clone, Copy)]
pub struct AutoApprovePolicy {
    _private: (),
}

impl AutoApprovePolicy {
    /// # Errors
    /// Returns `Config` for [`Environment::Production`].
    pub fn new(environment: Environment) -> Result<Self> {
        if environment == Environment::Production {
            return Err(RuntimeError::Config(
                "auto approval is not allowed in production".to_string(),
            ));
        }
        warn!(environment = %environment, "Auto approval enabled; every tool call will run unreviewed");
        Ok(Self { _private: () })
    }
}

impl ApprovalPolicy for AutoApprovePolicy {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn evaluate(&self, _call: &ToolCall) -> PolicyDecision {
        PolicyDecision::Approved
    }
}

/// A parked call, as seen by reviewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingApproval {
    /// Request the decision is for
    pub request_id: String,
    /// Tool waiting to run
    pub tool_name: String,
    /// Session that issued the call
    pub session_id: String,
}

struct Waiting {
    info: PendingApproval,
    resolver: oneshot::Sender<ApprovalDecision>,
}

/// Rendezvous between parked tool calls and reviewer decisions.
pub struct ApprovalGate {
    pending: Mutex<HashMap<String, Waiting>>,
    timeout: Duration,
}

impl fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("pending", &self.pending.try_lock().map(|p| p.len()).unwrap_or(0))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ApprovalGate {
    /// Creates a gate whose waits give up after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { pending: Mutex::new(HashMap::new()), timeout }
    }

    /// Returns the configured wait limit.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Parks a call. Register before announcing the request so an early
    /// decision is not lost.
    ///
    /// # Errors
    /// Returns `ValidationFailed` if the request ID is already waiting.
    pub fn register(&self, request_id: &str, call: &ToolCall) -> Result<ApprovalWaiter<'_>> {
        let (resolver, receiver) = oneshot::channel();
        let info = PendingApproval {
            request_id: request_id.to_string(),
            tool_name: call.tool_name.clone(),
            session_id: call.session_id.clone(),
        };

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.contains_key(request_id) {
            return Err(RuntimeError::ValidationFailed(vec![format!(
                "request '{request_id}' is already awaiting approval"
            )]));
        }
        pending.insert(request_id.to_string(), Waiting { info, resolver });
        debug!(request_id, tool = %call.tool_name, "Awaiting approval");

        Ok(ApprovalWaiter {
            gate: self,
            request_id: request_id.to_string(),
            tool_name: call.tool_name.clone(),
            receiver: Some(receiver),
        })
    }

    /// Delivers a reviewer decision.
    ///
    /// # Errors
    /// Returns `UnknownApprovalRequest` if nothing waits under that ID.
    pub fn decide(&self, request_id: &str, decision: ApprovalDecision) -> Result<()> {
        let waiting = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(request_id)
            .ok_or_else(|| RuntimeError::UnknownApprovalRequest(request_id.to_string()))?;

        info!(request_id, tool = %waiting.info.tool_name, decision = ?decision, "Approval decided");
        waiting
            .resolver
            .send(decision)
            .map_err(|_| RuntimeError::UnknownApprovalRequest(request_id.to_string()))
    }

    /// Lists parked calls.
    pub fn pending(&self) -> Vec<PendingApproval> {
        let mut list: Vec<PendingApproval> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|w| w.info.clone())
            .collect();
        list.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        list
    }

    fn forget(&self, request_id: &str) {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(request_id);
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new(DEFAULT_APPROVAL_TIMEOUT)
    }
}

/// A registered wait. Dropping it withdraws the request.
pub struct ApprovalWaiter<'a> {
    gate: &'a ApprovalGate,
    request_id: String,
    tool_name: String,
    receiver: Option<oneshot::Receiver<ApprovalDecision>>,
}

impl ApprovalWaiter<'_> {
    /// Waits for the decision.
    ///
    /// # Errors
    /// `ApprovalDenied` on denial, `ApprovalTimedOut` when the gate's limit
    /// passes, `Cancelled` if `cancel` fires first.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<()> {
        let Some(receiver) = self.receiver.take() else {
            return Err(RuntimeError::UnknownApprovalRequest(self.request_id.clone()));
        };
        let limit = self.gate.timeout;

        let decision = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            decision = tokio::time::timeout(limit, receiver) => decision,
        };

        match decision {
            Ok(Ok(ApprovalDecision::Approve)) => Ok(()),
            Ok(Ok(ApprovalDecision::Deny { reason })) => {
                Err(RuntimeError::ApprovalDenied { tool: self.tool_name.clone(), reason })
            }
            Ok(Err(_)) => Err(RuntimeError::UnknownApprovalRequest(self.request_id.clone())),
            Err(_) => {
                warn!(request_id = %self.request_id, tool = %self.tool_name, "Approval timed out");
                Err(RuntimeError::ApprovalTimedOut { tool: self.tool_name.clone(), waited: limit })
            }
        }
    }
}

impl Drop for ApprovalWaiter<'_> {
    fn drop(&mut self) {
        self.gate.forget(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn call(tool: &str) -> ToolCall {
        ToolCall::new(tool, "coder", "s1")
    }

    #[test]
    fn test_manual_policy_always_asks() {
        assert!(matches!(
            ManualApprovalPolicy.evaluate(&call("read_file")),
            PolicyDecision::NeedsManualApproval { .. }
        ));
    }

    #[test]
    fn test_rule_policy_deny_wins() {
        let policy = RuleBasedPolicy::new(["read_*", "git_status"], ["read_secrets"]);

        assert_eq!(policy.evaluate(&call("read_file")), PolicyDecision::Approved);
        assert_eq!(policy.evaluate(&call("git_status")), PolicyDecision::Approved);
        assert!(matches!(policy.evaluate(&call("read_secrets")), PolicyDecision::Denied { .. }));
        assert!(matches!(
            policy.evaluate(&call("write_file")),
            PolicyDecision::NeedsManualApproval { .. }
        ));
    }

    #[test]
    fn test_auto_approve_rejected_in_production() {
        assert!(matches!(AutoApprovePolicy::new(Environment::Production), Err(RuntimeError::Config(_))));
        let policy = AutoApprovePolicy::new(Environment::Development).unwrap();
        assert_eq!(policy.evaluate(&call("rm_rf")), PolicyDecision::Approved);
    }

    #[tokio::test]
    async fn test_gate_delivers_approval() {
        let gate = Arc::new(ApprovalGate::new(Duration::from_secs(5)));
        let waiter = gate.register("r1", &call("write_file")).unwrap();
        assert_eq!(gate.pending().len(), 1);

        gate.decide("r1", ApprovalDecision::Approve).unwrap();
        waiter.wait(&CancellationToken::new()).await.unwrap();
        assert!(gate.pending().is_empty());
    }

    #[tokio::test]
    async fn test_gate_delivers_denial() {
        let gate = ApprovalGate::new(Duration::from_secs(5));
        let waiter = gate.register("r1", &call("write_file")).unwrap();
        gate.decide("r1", ApprovalDecision::Deny { reason: "not today".to_string() }).unwrap();

        let err = waiter.wait(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ApprovalDenied { ref reason, .. } if reason == "not today"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_times_out() {
        let gate = ApprovalGate::new(Duration::from_secs(60));
        let waiter = gate.register("r1", &call("write_file")).unwrap();

        let err = waiter.wait(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ApprovalTimedOut { waited, .. } if waited == Duration::from_secs(60)));
        assert!(gate.pending().is_empty());
        assert!(matches!(
            gate.decide("r1", ApprovalDecision::Approve),
            Err(RuntimeError::UnknownApprovalRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_gate_wait_cancelled() {
        let gate = ApprovalGate::default();
        let waiter = gate.register("r1", &call("write_file")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(waiter.wait(&cancel).await, Err(RuntimeError::Cancelled)));
        assert!(gate.pending().is_empty());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let gate = ApprovalGate::default();
        let _waiter = gate.register("r1", &call("write_file")).unwrap();
        assert!(gate.register("r1", &call("write_file")).is_err());
    }

    #[test]
    fn test_unknown_request_decision() {
        let gate = ApprovalGate::default();
        assert!(matches!(
            gate.decide("missing", ApprovalDecision::Approve),
            Err(RuntimeError::UnknownApprovalRequest(_))
        ));
    }
}
