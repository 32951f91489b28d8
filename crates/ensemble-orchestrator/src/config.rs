// Runtime configuration
//
// Loaded from TOML. Every section is optional; the document may also nest the
// whole configuration under an [ensemble] table.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::descriptor::AgentDescriptor;
use crate::error::{Result, RuntimeError};
use crate::orchestration::{EngineConfig, FailurePolicy};
use crate::tools::{
    ApprovalPolicy, AutoApprovePolicy, ManualApprovalPolicy, PipelineConfig, RuleBasedPolicy,
};

/// Environment variable that overrides `environment`.
pub const ENVIRONMENT_VAR: &str = "ENSEMBLE_ENV";

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Development => write!(f, "development"),
        }
    }
}

impl FromStr for Environment {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            other => Err(RuntimeError::Config(format!("unknown environment '{other}'"))),
        }
    }
}

/// How tool calls are approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Every call waits for a reviewer.
    #[default]
    Manual,
    /// Allow and deny lists, reviewer for the rest.
    Rules,
    /// Approve everything (development only).
    Auto,
}

/// `[approval]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSettings {
    pub mode: ApprovalMode,
    /// Tool patterns approved without asking (rules mode)
    pub allow: Vec<String>,
    /// Tool patterns always refused (rules mode)
    pub deny: Vec<String>,
    /// Seconds a call waits for a reviewer
    pub timeout_secs: u64,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self { mode: ApprovalMode::Manual, allow: Vec::new(), deny: Vec::new(), timeout_secs: 60 }
    }
}

/// `[tools]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    /// Seconds a tool may run
    pub execution_timeout_secs: u64,
    /// Directory tools run in
    pub working_dir: PathBuf,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self { execution_timeout_secs: 30, working_dir: PathBuf::from(".") }
    }
}

/// `[orchestration]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationSettings {
    pub failure_policy: FailurePolicy,
    /// Run consecutive steps of a parallel group concurrently
    pub parallel_fan_out: bool,
    /// Seconds one plan step may take
    pub step_timeout_secs: u64,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::AbortRemaining,
            parallel_fan_out: false,
            step_timeout_secs: 300,
        }
    }
}

/// `[router]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Events buffered per subscriber channel
    pub channel_capacity: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self { channel_capacity: crate::router::DEFAULT_CHANNEL_CAPACITY }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub environment: Environment,
    pub approval: ApprovalSettings,
    pub tools: ToolSettings,
    pub orchestration: OrchestrationSettings,
    pub router: RouterSettings,
    /// Agents known to the runtime
    pub agents: Vec<AgentDescriptor>,
}

impl RuntimeConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file and apply the `ENSEMBLE_ENV` override.
    ///
    /// # Arguments
    /// * `path` - Path to the TOML configuration file
    ///
    /// # Errors
    /// Returns `Config` if the file cannot be read, parsed or validated.
    pub fn load_from_toml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Loading runtime configuration");
        Self::from_toml_str(&content)?
            .with_environment_override(std::env::var(ENVIRONMENT_VAR).ok().as_deref())
    }

    /// Parse configuration from a TOML string
    ///
    /// # Arguments
    /// * `toml_content` - TOML content (may nest everything under [ensemble])
    ///
    /// # Errors
    /// Returns `Config` if the content cannot be parsed or fails validation.
    pub fn from_toml_str(toml_content: &str) -> Result<Self> {
        let toml: toml::Value = toml::from_str(toml_content)
            .map_err(|e| RuntimeError::Config(format!("Failed to parse TOML: {e}")))?;

        let config_value = match toml.get("ensemble") {
            Some(section) => section.clone(),
            None => toml,
        };

        let config: Self = config_value.try_into().map_err(|e: toml::de::Error| {
            RuntimeError::Config(format!("Failed to deserialize runtime config: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Applies an environment override (the value of `ENSEMBLE_ENV`) and re-validates.
    ///
    /// # Errors
    /// Returns `Config` for an unknown environment name or if the result is invalid.
    pub fn with_environment_override(mut self, value: Option<&str>) -> Result<Self> {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            self.environment = value.parse()?;
            debug!(environment = %self.environment, "Environment overridden");
        }
        self.validate()?;
        Ok(self)
    }

    /// Checks the configuration for contradictions.
    ///
    /// # Errors
    /// Returns `Config` listing every problem found.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.approval.mode == ApprovalMode::Auto && self.environment == Environment::Production {
            problems.push("approval mode 'auto' is not allowed in production".to_string());
        }
        if self.approval.timeout_secs == 0 {
            problems.push("approval.timeout_secs must be greater than 0".to_string());
        }
        if self.tools.execution_timeout_secs == 0 {
            problems.push("tools.execution_timeout_secs must be greater than 0".to_string());
        }
        if self.orchestration.step_timeout_secs == 0 {
            problems.push("orchestration.step_timeout_secs must be greater than 0".to_string());
        }
        if self.router.channel_capacity == 0 {
            problems.push("router.channel_capacity must be greater than 0".to_string());
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                problems.push("agent id must not be empty".to_string());
            } else if !seen.insert(agent.id.as_str()) {
                problems.push(format!("duplicate agent id '{}'", agent.id));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::Config(problems.join("; ")))
        }
    }

    /// Builds the configured approval policy.
    ///
    /// # Errors
    /// Returns `Config` for auto approval in production.
    pub fn approval_policy(&self) -> Result<Arc<dyn ApprovalPolicy>> {
        Ok(match self.approval.mode {
            ApprovalMode::Manual => Arc::new(ManualApprovalPolicy),
            ApprovalMode::Rules => Arc::new(RuleBasedPolicy::new(
                self.approval.allow.iter().cloned(),
                self.approval.deny.iter().cloned(),
            )),
            ApprovalMode::Auto => Arc::new(AutoApprovePolicy::new(self.environment)?),
        })
    }

    /// Time a tool call waits for a reviewer.
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval.timeout_secs)
    }

    /// Settings for the tool pipeline.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            execution_timeout: Duration::from_secs(self.tools.execution_timeout_secs),
            working_dir: self.tools.working_dir.clone(),
        }
    }

    /// Settings for the orchestration engine.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            failure_policy: self.orchestration.failure_policy,
            parallel_fan_out: self.orchestration.parallel_fan_out,
            step_timeout: Duration::from_secs(self.orchestration.step_timeout_secs),
            ..EngineConfig::default()
        }
    }
}
