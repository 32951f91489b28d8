//! Agent descriptors.
//!
//! A descriptor is the configuration-time description of an agent. It is
//! immutable once a handle has been built from it.

use ensemble_abstraction::BackendConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// The closed set of agent kinds the runtime knows about.
///
/// Adding a kind means adding a variant here and registering a builder for it
/// in the [`AgentFactory`](crate::factory::AgentFactory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    /// A Claude-like agent driven through a local CLI process.
    ClaudeCli,
    /// An agent backed by a remote HTTP provider.
    HttpProvider,
}

impl AgentKind {
    /// Returns the stable name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClaudeCli => "claude-cli",
            Self::HttpProvider => "http-provider",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude-cli" => Ok(Self::ClaudeCli),
            "http-provider" => Ok(Self::HttpProvider),
            other => Err(format!("unknown agent kind '{other}'")),
        }
    }
}

/// Description of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Globally unique agent identifier.
    pub id: String,
    /// Which backend drives the agent.
    pub kind: AgentKind,
    /// Human-readable name.
    #[serde(default)]
    pub display_name: String,
    /// Working directory for the agent.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Provider-specific settings.
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

impl AgentDescriptor {
    /// Creates a descriptor with default working directory and no settings.
    pub fn new(id: impl Into<String>, kind: AgentKind) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            kind,
            working_dir: default_working_dir(),
            settings: HashMap::new(),
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Adds a provider-specific setting.
    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Builds the configuration handed to the backend on initialization.
    #[must_use]
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            agent_id: self.id.clone(),
            working_dir: self.working_dir.clone(),
            settings: self.settings.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in [AgentKind::ClaudeCli, AgentKind::HttpProvider] {
            assert_eq!(kind.as_str().parse::<AgentKind>().unwrap(), kind);
        }
        assert!("gemini".parse::<AgentKind>().is_err());
    }

    #[test]
    fn test_descriptor_from_toml_defaults() {
        let descriptor: AgentDescriptor = toml::from_str(
            r#"
            id = "reviewer"
            kind = "http-provider"
            "#,
        )
        .unwrap();

        assert_eq!(descriptor.kind, AgentKind::HttpProvider);
        assert_eq!(descriptor.working_dir, PathBuf::from("."));
        assert!(descriptor.settings.is_empty());
    }

    #[test]
    fn test_backend_config_copies_settings() {
        let descriptor = AgentDescriptor::new("coder", AgentKind::ClaudeCli)
            .with_working_dir("/tmp/work")
            .with_setting("command", "claude");
        let config = descriptor.backend_config();

        assert_eq!(config.agent_id, "coder");
        assert_eq!(config.working_dir, PathBuf::from("/tmp/work"));
        assert_eq!(config.get("command"), Some("claude"));
    }
}
