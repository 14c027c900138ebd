//! Configuration parsing for the orchestrator.
//!
//! `key=value` file format, same idiom as the teacher's `bin/loop`-flavored
//! parser: blank lines and `#` comments are skipped, unknown keys warn but
//! don't fail, typed setters validate as they go. Precedence: CLI flag path
//! > `<repo>/.norma/config` > defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Budgets the iteration controller is bounded by (spec Section 3:
/// `AgentRequest.budgets`).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct Budgets {
    pub max_iterations: u32,
    pub max_wall_time_minutes: Option<u32>,
    pub max_failed_checks: Option<u32>,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_wall_time_minutes: None,
            max_failed_checks: None,
        }
    }
}

/// Orchestrator configuration (spec Sections 4.5, 4.6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the host source repository.
    pub repo_root: PathBuf,
    /// `.norma` directory under `repo_root` (locks, runs, tasks).
    pub norma_dir: PathBuf,

    /// Budgets applied to every run.
    pub budgets: Budgets,

    /// Base branch worktrees are created from when the task branch doesn't
    /// yet exist (spec Section 4.1: `MountWorktree(path, branch, base)`).
    pub base_branch: Option<String>,

    /// Per-role agent command lines, e.g. `["claude-agent", "--role", "plan"]`.
    pub plan_cmd: Vec<String>,
    pub do_cmd: Vec<String>,
    pub check_cmd: Vec<String>,
    pub act_cmd: Vec<String>,

    /// Number of attempts per step before giving up (spec Section 4.6: 3).
    pub max_attempts: u32,
    /// Linear backoff base in seconds: attempt `n` sleeps `n * backoff_base_sec`.
    pub retry_backoff_base_sec: u32,

    /// Mirror agent stdout/stderr to the orchestrator's own stdout/stderr
    /// (spec Section 4.5: "when a debug mode is enabled").
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            norma_dir: PathBuf::from(".norma"),
            budgets: Budgets::default(),
            base_branch: None,
            plan_cmd: Vec::new(),
            do_cmd: Vec::new(),
            check_cmd: Vec::new(),
            act_cmd: Vec::new(),
            max_attempts: 3,
            retry_backoff_base_sec: 1,
            debug: false,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "repo_root" => self.repo_root = PathBuf::from(value),
            "norma_dir" => self.norma_dir = PathBuf::from(value),
            "base_branch" => self.base_branch = Some(value.to_string()),
            "max_iterations" => {
                self.budgets.max_iterations = Self::parse_int(key, value)?;
            }
            "max_wall_time_minutes" => {
                self.budgets.max_wall_time_minutes = Some(Self::parse_int(key, value)?);
            }
            "max_failed_checks" => {
                self.budgets.max_failed_checks = Some(Self::parse_int(key, value)?);
            }
            "plan_cmd" => self.plan_cmd = Self::split_cmd(value),
            "do_cmd" => self.do_cmd = Self::split_cmd(value),
            "check_cmd" => self.check_cmd = Self::split_cmd(value),
            "act_cmd" => self.act_cmd = Self::split_cmd(value),
            "max_attempts" => self.max_attempts = Self::parse_int(key, value)?,
            "retry_backoff_base_sec" => self.retry_backoff_base_sec = Self::parse_int(key, value)?,
            "debug" => self.debug = Self::parse_bool(key, value)?,
            _ => {
                eprintln!("warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn split_cmd(value: &str) -> Vec<String> {
        value.split_whitespace().map(|s| s.to_string()).collect()
    }

    fn parse_int(key: &str, value: &str) -> Result<u32, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Agent command for a given role.
    pub fn cmd_for(&self, role: crate::types::StepRole) -> &[String] {
        match role {
            crate::types::StepRole::Plan => &self.plan_cmd,
            crate::types::StepRole::Do => &self.do_cmd,
            crate::types::StepRole::Check => &self.check_cmd,
            crate::types::StepRole::Act => &self.act_cmd,
        }
    }

    /// Resolve relative paths against the repo root.
    pub fn resolve_paths(&mut self) {
        if self.norma_dir.is_relative() {
            self.norma_dir = self.repo_root.join(&self.norma_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepRole;

    #[test]
    fn default_has_sane_budgets() {
        let config = Config::default();
        assert_eq!(config.budgets.max_iterations, 10);
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn parses_key_value_lines() {
        let mut config = Config::default();
        config
            .parse_content(
                "max_iterations=5\n\
                 base_branch=main\n\
                 plan_cmd=agent --role plan\n\
                 debug=true\n\
                 # a comment\n\
                 \n",
            )
            .unwrap();

        assert_eq!(config.budgets.max_iterations, 5);
        assert_eq!(config.base_branch.as_deref(), Some("main"));
        assert_eq!(config.cmd_for(StepRole::Plan), ["agent", "--role", "plan"]);
        assert!(config.debug);
    }

    #[test]
    fn rejects_malformed_line() {
        let mut config = Config::default();
        let err = config.parse_content("not-a-kv-line").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLine(_)));
    }

    #[test]
    fn rejects_bad_bool() {
        let mut config = Config::default();
        let err = config.parse_content("debug=maybe").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBool { .. }));
    }

    #[test]
    fn unquotes_quoted_values() {
        let mut config = Config::default();
        config
            .parse_content("base_branch=\"release/1.0\"")
            .unwrap();
        assert_eq!(config.base_branch.as_deref(), Some("release/1.0"));
    }

    #[test]
    fn resolve_paths_anchors_norma_dir() {
        let mut config = Config {
            repo_root: PathBuf::from("/repo"),
            ..Config::default()
        };
        config.resolve_paths();
        assert_eq!(config.norma_dir, PathBuf::from("/repo/.norma"));
    }
}
