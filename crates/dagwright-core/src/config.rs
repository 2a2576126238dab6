use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DagError, Result};
use crate::types::STDOUT_KEY;

/// Top-level dagwright configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: ExecutionConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Output key routed into downstream `stdin`.
    #[serde(default = "default_primary_output_key")]
    pub primary_output_key: String,
    /// Timeout for command nodes that do not set their own.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: f64,
    /// Iteration ceiling for while loops that do not set their own.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Capacity of the event bus broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            primary_output_key: default_primary_output_key(),
            command_timeout_secs: default_command_timeout(),
            max_iterations: default_max_iterations(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl ExecutionConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.command_timeout_secs.max(0.0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_primary_output_key() -> String { STDOUT_KEY.to_string() }
fn default_command_timeout() -> f64 { 30.0 }
fn default_max_iterations() -> usize { 100 }
fn default_event_capacity() -> usize { 256 }
fn default_log_filter() -> String { "dagwright=info,warn".to_string() }

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| DagError::ConfigNotFound(path.display().to_string()))?;

        tracing::debug!(path = %path.display(), "Loading engine config");
        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| DagError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.engine.primary_output_key.is_empty() {
            return Err(DagError::Config("primary_output_key must not be empty".into()));
        }
        if !self.engine.command_timeout_secs.is_finite() || self.engine.command_timeout_secs < 0.0 {
            return Err(DagError::Config(format!(
                "command_timeout_secs must be a non-negative number, got {}",
                self.engine.command_timeout_secs
            )));
        }
        if self.engine.event_capacity == 0 {
            return Err(DagError::Config("event_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_DAGWRIGHT_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_DAGWRIGHT_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_DAGWRIGHT_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_DAGWRIGHT_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_DAGWRIGHT_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = EngineConfig::parse("").unwrap();
        assert_eq!(config.engine.primary_output_key, "stdout");
        assert_eq!(config.engine.command_timeout_secs, 30.0);
        assert_eq!(config.engine.max_iterations, 100);
        assert_eq!(config.engine.event_capacity, 256);
        assert_eq!(config.log.filter, "dagwright=info,warn");
    }

    #[test]
    fn test_partial_engine_section() {
        let config = EngineConfig::parse(
            r#"
[engine]
command_timeout_secs = 2.5
"#,
        )
        .unwrap();
        assert_eq!(config.engine.command_timeout(), Duration::from_millis(2500));
        assert_eq!(config.engine.max_iterations, 100);
    }

    #[test]
    fn test_rejects_negative_timeout() {
        let err = EngineConfig::parse("[engine]\ncommand_timeout_secs = -1.0\n").unwrap_err();
        assert!(matches!(err, DagError::Config(_)));
    }

    #[test]
    fn test_rejects_empty_output_key() {
        let err = EngineConfig::parse("[engine]\nprimary_output_key = \"\"\n").unwrap_err();
        assert!(err.to_string().contains("primary_output_key"));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config =
            EngineConfig::load_or_default(Path::new("/nonexistent/dagwright.toml")).unwrap();
        assert_eq!(config.engine.max_iterations, 100);
    }
}
