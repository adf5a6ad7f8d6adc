//! Harness configuration.
//!
//! Loaded from YAML (every field optional) and then overlaid with a small set
//! of environment variables. Constants that drive memory evolution and the
//! conclusion heuristics live here so experiments can vary them without a
//! rebuild.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::change_aware::ChangeAwareConfig;
use crate::error::{Error, Result};

/// Upper bound on backend retries regardless of configuration.
pub const MAX_BACKEND_RETRIES: u32 = 3;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// SQLite database file
    pub database_path: String,
    /// Directory receiving run reports
    pub output_dir: String,
    /// Reasoning backend connection
    pub backend: BackendConfig,
    /// Optional external memory service
    pub external_memory: ExternalMemoryConfig,
    /// Memory lifecycle constants
    pub lifecycle: LifecycleConfig,
    /// Conclusion heuristics
    pub conclusion: ConclusionThresholds,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            database_path: "memlab.db".to_string(),
            output_dir: "outputs".to_string(),
            backend: BackendConfig::default(),
            external_memory: ExternalMemoryConfig::default(),
            lifecycle: LifecycleConfig::default(),
            conclusion: ConclusionThresholds::default(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from an optional YAML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(expand_path(&path.to_string_lossy()))?;
                Self::from_yaml(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Overlay values from the environment (the lookup is injectable for tests).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MEMLAB_DATABASE") {
            self.database_path = v;
        }
        if let Some(v) = lookup("MEMLAB_BACKEND_URL") {
            self.backend.base_url = v;
        }
        if let Some(v) = lookup("MEMLAB_BACKEND_API_KEY") {
            self.backend.api_key = v;
        }
        if let Some(v) = lookup("MEMLAB_EXTERNAL_MEMORY_URL") {
            self.external_memory.base_url = v;
        }
        if let Some(n) = lookup("MEMLAB_BACKEND_MAX_RETRIES").and_then(|v| v.trim().parse().ok()) {
            self.backend.max_retries = n;
        }
    }

    /// Database path with `~` and environment variables expanded.
    pub fn database_path(&self) -> PathBuf {
        expand_path(&self.database_path)
    }

    /// Report directory with `~` and environment variables expanded.
    pub fn output_dir(&self) -> PathBuf {
        expand_path(&self.output_dir)
    }
}

fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(raw),
    }
}

/// Call mode of the prompt-execution backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppMode {
    /// Single workflow invocation with prompt and query as workflow inputs
    Workflow,
    /// Completion endpoint, falling back to chat
    Completion,
    /// Chat endpoint, tried after completion
    #[default]
    Chat,
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppMode::Workflow => write!(f, "workflow"),
            AppMode::Completion => write!(f, "completion"),
            AppMode::Chat => write!(f, "chat"),
        }
    }
}

impl FromStr for AppMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "workflow" => Ok(AppMode::Workflow),
            "completion" => Ok(AppMode::Completion),
            "chat" | "" => Ok(AppMode::Chat),
            other => Err(Error::Config(format!("unknown app mode: {}", other))),
        }
    }
}

/// Reasoning backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: String,
    pub app_mode: AppMode,
    /// `blocking` is the only mode whose responses are parsed
    pub response_mode: String,
    pub workflow_system_key: String,
    pub workflow_query_key: String,
    /// Output field to read from workflow results; guessed when absent
    pub workflow_output_key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            app_mode: AppMode::default(),
            response_mode: "blocking".to_string(),
            workflow_system_key: "system".to_string(),
            workflow_query_key: "query".to_string(),
            workflow_output_key: None,
            timeout_secs: 120,
            max_retries: 1,
        }
    }
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    pub fn with_app_mode(mut self, mode: AppMode) -> Self {
        self.app_mode = mode;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Retries actually attempted, capped at [`MAX_BACKEND_RETRIES`].
    pub fn effective_retries(&self) -> u32 {
        self.max_retries.min(MAX_BACKEND_RETRIES)
    }
}

/// External memory service settings. An empty `base_url` disables the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalMemoryConfig {
    pub base_url: String,
    pub top_k: usize,
    pub user_prefix: String,
    pub timeout_secs: u64,
}

impl Default for ExternalMemoryConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            top_k: 5,
            user_prefix: "memlab".to_string(),
            timeout_secs: 10,
        }
    }
}

impl ExternalMemoryConfig {
    pub fn enabled(&self) -> bool {
        !self.base_url.trim().is_empty()
    }
}

/// Constants of the rule lifecycle: ranking, penalties, promotion gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Rules returned per retrieval
    pub retrieval_limit: usize,
    /// Confidence removed per implicated failure
    pub penalty_step: f64,
    /// Confidence added per verified success
    pub verify_step: f64,
    /// Confidence added when a consolidation repeats an existing lesson
    pub consolidation_step: f64,
    /// Failures after which a rule is deprecated
    pub deprecation_failures: i64,
    /// Confidence assumed when the reflection omits it
    pub default_confidence: f64,
    /// Recent trials examined by the promotion gate
    pub validation_window: usize,
    /// Comparable trials required before the gate can pass
    pub validation_min_comparable: usize,
    /// Highest tolerated predicted/actual disagreement rate
    pub validation_max_disagreement: f64,
    /// Below this many local rules the external service may be consulted
    pub external_fallback_min_hits: usize,
    /// ...provided none of them reaches this confidence
    pub external_fallback_confidence: f64,
    /// Case logs shown to the raw-case policy
    pub case_log_limit: usize,
    /// Change detection for the competition policy
    pub change_aware: ChangeAwareConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            retrieval_limit: 5,
            penalty_step: 0.05,
            verify_step: 0.01,
            consolidation_step: 0.02,
            deprecation_failures: 3,
            default_confidence: 0.8,
            validation_window: 20,
            validation_min_comparable: 5,
            validation_max_disagreement: 0.10,
            external_fallback_min_hits: 2,
            external_fallback_confidence: 0.65,
            case_log_limit: 3,
            change_aware: ChangeAwareConfig::default(),
        }
    }
}

/// Fixed heuristics used when synthesizing a conclusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConclusionThresholds {
    /// p-value below which a difference counts as significant
    pub significance: f64,
    /// Minimum flag-sequence length for a trend test
    pub min_trend_rounds: usize,
    /// z multiplier for confidence intervals
    pub z: f64,
}

impl Default for ConclusionThresholds {
    fn default() -> Self {
        Self {
            significance: 0.05,
            min_trend_rounds: 10,
            z: 1.96,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.lifecycle.retrieval_limit, 5);
        assert_eq!(config.lifecycle.deprecation_failures, 3);
        assert_eq!(config.conclusion.min_trend_rounds, 10);
        assert_eq!(config.backend.app_mode, AppMode::Chat);
        assert!(!config.external_memory.enabled());
    }

    #[test]
    fn test_partial_yaml() {
        let raw = r#"
database_path: /tmp/lab.db
backend:
  base_url: http://localhost:5001/v1
  app_mode: workflow
lifecycle:
  penalty_step: 0.1
"#;
        let config = HarnessConfig::from_yaml(raw).unwrap();
        assert_eq!(config.database_path, "/tmp/lab.db");
        assert_eq!(config.backend.app_mode, AppMode::Workflow);
        assert_eq!(config.backend.workflow_system_key, "system");
        assert_eq!(config.lifecycle.penalty_step, 0.1);
        assert_eq!(config.lifecycle.verify_step, 0.01);
        assert_eq!(config.output_dir, "outputs");
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = HarnessConfig::from_yaml("backend: [1, 2").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MEMLAB_BACKEND_URL", "http://backend"),
            ("MEMLAB_EXTERNAL_MEMORY_URL", "http://memos"),
            ("MEMLAB_BACKEND_MAX_RETRIES", "9"),
        ]
        .into_iter()
        .collect();

        let mut config = HarnessConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.backend.base_url, "http://backend");
        assert!(config.external_memory.enabled());
        assert_eq!(config.backend.max_retries, 9);
        assert_eq!(config.backend.effective_retries(), MAX_BACKEND_RETRIES);
    }

    #[test]
    fn test_app_mode_parse() {
        assert_eq!("Workflow".parse::<AppMode>().unwrap(), AppMode::Workflow);
        assert_eq!("".parse::<AppMode>().unwrap(), AppMode::Chat);
        assert!("agent".parse::<AppMode>().is_err());
    }
}
