use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

// ---------------------------------------------------------------------------
// Enumerated options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Merge,
    Rebase,
    Squash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Surface the error and pause the queue until acknowledged.
    Abort,
    /// Delete the branch and return the task to UNCLAIMED.
    ResetTask,
    /// Leave the task COMPLETED for manual intervention.
    Hold,
}

// ---------------------------------------------------------------------------
// OrchestratorConfig
// ---------------------------------------------------------------------------

/// Runtime knobs for one project's orchestrator. The key set is closed:
/// unknown keys are rejected on load and on config writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_agents: u32,
    #[serde(default = "default_true")]
    pub auto_merge: bool,
    #[serde(default = "default_merge_strategy")]
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub ff_only: bool,
    #[serde(default = "default_spawn_interval")]
    pub auto_spawn_interval_s: u64,
    #[serde(default = "default_heartbeat_ttl")]
    pub heartbeat_ttl_s: u64,
    #[serde(default = "default_spawn_timeout")]
    pub spawn_timeout_s: u64,
    #[serde(default = "default_merge_timeout")]
    pub merge_timeout_s: u64,
    #[serde(default = "default_starvation_ttl")]
    pub starvation_ttl_s: u64,
    #[serde(default = "default_conflict_policy")]
    pub conflict_policy: ConflictPolicy,
    #[serde(default = "default_status_dir")]
    pub status_dir: String,
    #[serde(default = "default_max_spawn_retries")]
    pub max_spawn_retries: u32,
    #[serde(default = "default_mainline")]
    pub mainline_branch: String,
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_s: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: default_max_concurrent(),
            auto_merge: true,
            merge_strategy: default_merge_strategy(),
            ff_only: false,
            auto_spawn_interval_s: default_spawn_interval(),
            heartbeat_ttl_s: default_heartbeat_ttl(),
            spawn_timeout_s: default_spawn_timeout(),
            merge_timeout_s: default_merge_timeout(),
            starvation_ttl_s: default_starvation_ttl(),
            conflict_policy: default_conflict_policy(),
            status_dir: default_status_dir(),
            max_spawn_retries: default_max_spawn_retries(),
            mainline_branch: default_mainline(),
            agent_command: default_agent_command(),
            shutdown_grace_s: default_shutdown_grace(),
        }
    }
}

fn default_max_concurrent() -> u32 {
    4
}
fn default_true() -> bool {
    true
}
fn default_merge_strategy() -> MergeStrategy {
    MergeStrategy::Merge
}
fn default_spawn_interval() -> u64 {
    30
}
fn default_heartbeat_ttl() -> u64 {
    120
}
fn default_spawn_timeout() -> u64 {
    30
}
fn default_merge_timeout() -> u64 {
    120
}
fn default_starvation_ttl() -> u64 {
    300
}
fn default_conflict_policy() -> ConflictPolicy {
    ConflictPolicy::Hold
}
fn default_status_dir() -> String {
    "/tmp/splitmind-status".to_string()
}
fn default_max_spawn_retries() -> u32 {
    3
}
fn default_mainline() -> String {
    "main".to_string()
}
fn default_agent_command() -> String {
    "claude".to_string()
}
fn default_shutdown_grace() -> u64 {
    30
}

impl OrchestratorConfig {
    /// Load from `~/.splitmind/config.toml`, falling back to defaults when
    /// the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: OrchestratorConfig =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: impl Into<PathBuf>) -> Result<(), ConfigError> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(&path, text).map_err(|e| ConfigError::Io(e.to_string()))
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".splitmind")
            .join("config.toml")
    }

    /// Range checks for the closed option set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let range = |field: &str, value: u64, lo: u64, hi: u64| {
            if value < lo || value > hi {
                Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: format!("{value} is outside {lo}..={hi}"),
                })
            } else {
                Ok(())
            }
        };
        range(
            "max_concurrent_agents",
            self.max_concurrent_agents as u64,
            1,
            20,
        )?;
        range("auto_spawn_interval_s", self.auto_spawn_interval_s, 10, 600)?;
        range("heartbeat_ttl_s", self.heartbeat_ttl_s, 1, 3600)?;
        range("spawn_timeout_s", self.spawn_timeout_s, 1, 600)?;
        range("merge_timeout_s", self.merge_timeout_s, 1, 3600)?;
        range("starvation_ttl_s", self.starvation_ttl_s, 1, 86_400)?;
        if self.mainline_branch.is_empty() {
            return Err(ConfigError::Invalid {
                field: "mainline_branch".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.agent_command.is_empty() {
            return Err(ConfigError::Invalid {
                field: "agent_command".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_s)
    }
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_s)
    }
    pub fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_s)
    }
    pub fn starvation_ttl(&self) -> Duration {
        Duration::from_secs(self.starvation_ttl_s)
    }
    pub fn spawn_interval(&self) -> Duration {
        Duration::from_secs(self.auto_spawn_interval_s)
    }
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_s)
    }

    /// UP_NEXT reservation depth: one scheduling step of lookahead.
    pub fn lookahead(&self) -> u32 {
        self.max_concurrent_agents
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = OrchestratorConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.max_concurrent_agents, 4);
        assert_eq!(cfg.merge_strategy, MergeStrategy::Merge);
        assert_eq!(cfg.conflict_policy, ConflictPolicy::Hold);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let mut cfg = OrchestratorConfig::default();
        cfg.max_concurrent_agents = 0;
        assert!(cfg.validate().is_err());
        cfg.max_concurrent_agents = 21;
        assert!(cfg.validate().is_err());
        cfg.max_concurrent_agents = 20;
        assert!(cfg.validate().is_ok());

        cfg.auto_spawn_interval_s = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = "max_concurrent_agents = 2\nshiny_new_knob = true\n";
        let parsed: Result<OrchestratorConfig, _> = toml::from_str(text);
        assert!(parsed.is_err());
    }

    #[test]
    fn toml_round_trip() {
        let cfg = OrchestratorConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: OrchestratorConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: OrchestratorConfig =
            toml::from_str("max_concurrent_agents = 2\nconflict_policy = \"reset_task\"\n")
                .unwrap();
        assert_eq!(cfg.max_concurrent_agents, 2);
        assert_eq!(cfg.conflict_policy, ConflictPolicy::ResetTask);
        assert_eq!(cfg.heartbeat_ttl_s, 120);
    }
}
