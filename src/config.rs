//! Bridge configuration loading.
//!
//! Reads `toolbridge.yaml` and resolves environment variables before
//! parsing. A minimal file only names the worker command:
//!
//! ```yaml
//! worker:
//!   command: node
//!   args: ["server.js"]
//! model:
//!   model: gpt-4o
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::inference::ModelConfig;
use crate::mcp_client::errors::BridgeError;

/// File name searched for when no explicit path is given.
pub const CONFIG_FILE_NAME: &str = "toolbridge.yaml";

/// Env var that points at a config file.
pub const CONFIG_ENV_VAR: &str = "TOOLBRIDGE_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level configuration (mirrors `toolbridge.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub worker: WorkerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

/// How to launch and talk to the worker process.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Name used in logs and errors.
    #[serde(default = "default_worker_name")]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Substrings that mark the worker as ready when seen on stdout or
    /// stderr. An empty list means ready as soon as the process spawns.
    #[serde(default = "default_readiness_markers")]
    pub readiness_markers: Vec<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub restart: RestartConfig,
}

fn default_worker_name() -> String {
    "worker".to_string()
}
fn default_readiness_markers() -> Vec<String> {
    vec!["MCP server ready".to_string(), "Server ready".to_string()]
}
fn default_request_timeout_ms() -> u64 {
    30_000
}

impl WorkerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// What happens after the worker exits unexpectedly.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RestartConfig {
    /// One restart per crash after a constant delay, forever.
    Fixed {
        #[serde(default = "default_restart_delay_ms")]
        delay_ms: u64,
    },
    /// Doubling delay per consecutive crash; gives up past the limit.
    Backoff {
        #[serde(default = "default_restart_delay_ms")]
        delay_ms: u64,
        #[serde(default = "default_max_delay_ms")]
        max_delay_ms: u64,
        #[serde(default = "default_max_consecutive_crashes")]
        max_consecutive_crashes: u32,
    },
}

fn default_restart_delay_ms() -> u64 {
    5_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_max_consecutive_crashes() -> u32 {
    5
}

impl Default for RestartConfig {
    fn default() -> Self {
        RestartConfig::Fixed {
            delay_ms: default_restart_delay_ms(),
        }
    }
}

impl RestartConfig {
    /// Delay before restarting after the `consecutive_crashes`-th crash in a
    /// row (1-based), or `None` when no further restart should happen.
    pub fn delay_for(&self, consecutive_crashes: u32) -> Option<Duration> {
        match *self {
            RestartConfig::Fixed { delay_ms } => Some(Duration::from_millis(delay_ms)),
            RestartConfig::Backoff {
                delay_ms,
                max_delay_ms,
                max_consecutive_crashes,
            } => {
                if consecutive_crashes > max_consecutive_crashes {
                    return None;
                }
                let shift = consecutive_crashes.saturating_sub(1).min(20);
                let delay = delay_ms.saturating_mul(1u64 << shift).min(max_delay_ms);
                Some(Duration::from_millis(delay))
            }
        }
    }
}

/// Conversation loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Tool-executing rounds allowed per turn.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    /// Replaces the built-in system prompt preamble. The tool list is
    /// always appended.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// When set, only these tools are offered to the model.
    #[serde(default)]
    pub enabled_tools: Option<Vec<String>>,
}

fn default_max_tool_rounds() -> usize {
    6
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            system_prompt: None,
            enabled_tools: None,
        }
    }
}

impl AgentConfig {
    pub fn enabled_tool_set(&self) -> Option<HashSet<String>> {
        self.enabled_tools
            .as_ref()
            .map(|names| names.iter().cloned().collect())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Order: `TOOLBRIDGE_CONFIG`, then `toolbridge.yaml` in `start` or any
/// ancestor directory.
pub fn find_config_path(start: &Path) -> Result<PathBuf, BridgeError> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points at a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(BridgeError::ConfigError {
        reason: format!("could not find {CONFIG_FILE_NAME}"),
    })
}

/// Load and parse a config file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_config(path: &Path) -> Result<BridgeConfig, BridgeError> {
    let raw = std::fs::read_to_string(path).map_err(|e| BridgeError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_config(&raw)
}

/// Parse config text (after interpolation) and validate it.
pub fn parse_config(raw: &str) -> Result<BridgeConfig, BridgeError> {
    let interpolated = interpolate_env_vars(raw);

    let mut config: BridgeConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| BridgeError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    if config.worker.command.trim().is_empty() {
        return Err(BridgeError::ConfigError {
            reason: "worker.command must not be empty".into(),
        });
    }
    config.worker.command = expand_tilde(&config.worker.command);
    config.worker.cwd = config.worker.cwd.as_deref().map(expand_tilde);

    config
        .model
        .validate()
        .map_err(|e| BridgeError::ConfigError {
            reason: e.to_string(),
        })?;

    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TOOLBRIDGE_NONEXISTENT_VAR__");
        let result = interpolate_env_vars("${__TOOLBRIDGE_NONEXISTENT_VAR__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TOOLBRIDGE_TEST_VAR__", "/custom/path");
        let result = interpolate_env_vars("dir: ${__TOOLBRIDGE_TEST_VAR__:-/fallback}");
        assert_eq!(result, "dir: /custom/path");
        std::env::remove_var("__TOOLBRIDGE_TEST_VAR__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with $dollar but no braces";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/workers");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/workers"));
        assert_eq!(expand_tilde("/abs/path"), "/abs/path");
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config("worker:\n  command: node\n").unwrap();
        assert_eq!(config.worker.name, "worker");
        assert_eq!(
            config.worker.readiness_markers,
            vec!["MCP server ready", "Server ready"]
        );
        assert_eq!(config.worker.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.worker.restart, RestartConfig::default());
        assert_eq!(config.model.model, "gpt-4");
        assert_eq!(config.agent.max_tool_rounds, 6);
        assert!(config.agent.enabled_tool_set().is_none());
    }

    #[test]
    fn test_full_config() {
        std::env::set_var("__TOOLBRIDGE_TEST_DRIVE_TOKEN__", "secret");
        let yaml = r#"
worker:
  name: google-toolkit
  command: python3
  args: ["mcp_toolkit.py"]
  env:
    GOOGLE_ACCESS_TOKEN: "${__TOOLBRIDGE_TEST_DRIVE_TOKEN__}"
  readiness_markers: []
  request_timeout_ms: 5000
  restart:
    mode: backoff
    delay_ms: 1000
    max_delay_ms: 8000
    max_consecutive_crashes: 3
model:
  model: gpt-4o
  base_url: http://localhost:8080/v1
agent:
  max_tool_rounds: 2
  enabled_tools: [drive_search_files, gmail_send_message]
"#;
        let config = parse_config(yaml).unwrap();
        std::env::remove_var("__TOOLBRIDGE_TEST_DRIVE_TOKEN__");

        assert_eq!(config.worker.name, "google-toolkit");
        assert_eq!(config.worker.env["GOOGLE_ACCESS_TOKEN"], "secret");
        assert!(config.worker.readiness_markers.is_empty());
        assert_eq!(
            config.worker.restart,
            RestartConfig::Backoff {
                delay_ms: 1000,
                max_delay_ms: 8000,
                max_consecutive_crashes: 3
            }
        );
        assert_eq!(config.agent.max_tool_rounds, 2);
        let enabled = config.agent.enabled_tool_set().unwrap();
        assert!(enabled.contains("gmail_send_message"));
    }

    #[test]
    fn test_missing_or_empty_command_is_rejected() {
        assert!(parse_config("model:\n  model: gpt-4\n").is_err());
        assert!(matches!(
            parse_config("worker:\n  command: \"  \"\n"),
            Err(BridgeError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_invalid_model_section_is_rejected() {
        let yaml = "worker:\n  command: node\nmodel:\n  base_url: ftp://nope\n";
        assert!(matches!(parse_config(yaml), Err(BridgeError::ConfigError { .. })));
    }

    #[test]
    fn test_fixed_restart_delay_is_constant() {
        let policy = RestartConfig::Fixed { delay_ms: 5000 };
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for(50), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_backoff_doubles_caps_and_gives_up() {
        let policy = RestartConfig::Backoff {
            delay_ms: 1000,
            max_delay_ms: 5000,
            max_consecutive_crashes: 4,
        };
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(2000)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(4000)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_millis(5000)));
        assert_eq!(policy.delay_for(5), None);
    }

    #[test]
    fn test_find_config_walks_upward() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "worker:\n  command: node\n").unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        std::env::remove_var(CONFIG_ENV_VAR);
        let found = find_config_path(&nested).unwrap();
        assert_eq!(found, dir.path().join(CONFIG_FILE_NAME));
        assert!(load_config(&found).is_ok());
    }
}
