//! Completion model configuration.
//!
//! The `model:` section of `toolbridge.yaml`. Every field has a default, so
//! an empty section targets `gpt-4` on the OpenAI endpoint.

use std::time::Duration;

use serde::Deserialize;

use super::errors::InferenceError;
use super::types::CompletionOptions;

/// Runtime configuration for the completion service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Base URL of an OpenAI-compatible API, without `/chat/completions`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the env var holding the bearer token.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_model() -> String {
    "gpt-4".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ModelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The bearer token, if the configured env var is set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }

    /// Sampling settings for one completion call.
    pub fn completion_options(&self) -> CompletionOptions {
        CompletionOptions {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    /// Reject values the endpoint would refuse anyway.
    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.model.trim().is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "model name must not be empty".into(),
            });
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(InferenceError::ConfigError {
                reason: format!("base_url must be an http(s) URL, got '{}'", self.base_url),
            });
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(InferenceError::ConfigError {
                reason: format!("temperature {} is outside 0.0..=2.0", self.temperature),
            });
        }
        if self.max_tokens == 0 {
            return Err(InferenceError::ConfigError {
                reason: "max_tokens must be positive".into(),
            });
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_section_uses_defaults() {
        let config: ModelConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, ModelConfig::default());
        assert_eq!(config.model, "gpt-4");
        assert_eq!(config.max_tokens, 2000);
        assert!((config.temperature - 0.7).abs() < f32::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_section_overrides() {
        let yaml = r#"
            model: gpt-4o-mini
            base_url: "http://localhost:11434/v1"
            temperature: 0.2
        "#;
        let config: ModelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.api_key_env, "OPENAI_API_KEY");
        let options = config.completion_options();
        assert_eq!(options.model, "gpt-4o-mini");
        assert_eq!(options.max_tokens, 2000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ModelConfig::default();
        config.base_url = "localhost:8080".into();
        assert!(config.validate().is_err());

        let mut config = ModelConfig::default();
        config.temperature = 3.5;
        assert!(config.validate().is_err());

        let mut config = ModelConfig::default();
        config.max_tokens = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_key_ignores_blank_values() {
        let config = ModelConfig {
            api_key_env: "__TOOLBRIDGE_TEST_BLANK_KEY__".into(),
            ..ModelConfig::default()
        };
        std::env::set_var("__TOOLBRIDGE_TEST_BLANK_KEY__", "  ");
        assert!(config.api_key().is_none());
        std::env::set_var("__TOOLBRIDGE_TEST_BLANK_KEY__", "sk-test");
        assert_eq!(config.api_key().as_deref(), Some("sk-test"));
        std::env::remove_var("__TOOLBRIDGE_TEST_BLANK_KEY__");
    }
}
