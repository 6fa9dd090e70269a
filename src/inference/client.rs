//! OpenAI-compatible completion client.
//!
//! [`CompletionService`] is the seam the conversation loop talks to;
//! [`CompletionClient`] implements it with a single non-streaming
//! `POST {base_url}/chat/completions`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use uuid::Uuid;

use super::config::ModelConfig;
use super::errors::InferenceError;
use super::types::{
    ChatCompletionRequest, ChatMessage, CompletionOptions, CompletionResponse,
    FunctionCallResponse, TokenUsage, ToolCallResponse, ToolDefinition,
};

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── CompletionService ───────────────────────────────────────────────────────

/// A chat completion backend.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Run one completion. `tools` may be empty, in which case no tool
    /// list is offered to the model.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse, InferenceError>;
}

// ─── CompletionClient ────────────────────────────────────────────────────────

/// HTTP client for an OpenAI-compatible chat completions endpoint.
pub struct CompletionClient {
    http: HttpClient,
    config: ModelConfig,
    api_key: Option<String>,
}

impl CompletionClient {
    /// Build a client from the model section. Does NOT check connectivity;
    /// that happens on the first request.
    pub fn from_config(config: ModelConfig) -> Result<Self, InferenceError> {
        config.validate()?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let api_key = config.api_key();
        if api_key.is_none() {
            tracing::warn!(
                env_var = %config.api_key_env,
                "no API key configured, sending unauthenticated requests"
            );
        }

        Ok(Self {
            http,
            config,
            api_key,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl CompletionService for CompletionClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse, InferenceError> {
        let url = self.endpoint();
        let body = build_request(messages, tools, options);

        // Request metadata only; the body can be huge.
        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = tools.len(),
            max_tokens = body.max_tokens,
            "completion request"
        );

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: self.config.request_timeout_secs,
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "completion request rejected");
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| InferenceError::ResponseParse {
                reason: format!("failed to read response body: {e}"),
            })?;

        let parsed = parse_completion_response(&body_text)?;
        tracing::info!(
            prompt_tokens = parsed.usage.prompt_tokens,
            completion_tokens = parsed.usage.completion_tokens,
            tool_calls = parsed.tool_calls.len(),
            has_content = parsed.content.is_some(),
            "completion response"
        );
        Ok(parsed)
    }
}

/// Assemble the request body. `tool_choice: "auto"` is only sent alongside
/// a non-empty tool list.
pub fn build_request(
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
    options: &CompletionOptions,
) -> ChatCompletionRequest {
    let tools = (!tools.is_empty()).then(|| tools.to_vec());
    ChatCompletionRequest {
        model: options.model.clone(),
        messages: messages.to_vec(),
        tool_choice: tools.as_ref().map(|_| "auto".to_string()),
        tools,
        temperature: options.temperature,
        max_tokens: options.max_tokens,
        stream: false,
    }
}

/// Parse a non-streaming chat completion body.
pub fn parse_completion_response(body: &str) -> Result<CompletionResponse, InferenceError> {
    #[derive(Deserialize)]
    struct Response {
        #[serde(default)]
        choices: Vec<Choice>,
        #[serde(default)]
        usage: Option<TokenUsage>,
    }

    #[derive(Deserialize)]
    struct Choice {
        message: Message,
    }

    #[derive(Deserialize)]
    struct Message {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        tool_calls: Option<Vec<RawToolCall>>,
    }

    #[derive(Deserialize)]
    struct RawToolCall {
        #[serde(default)]
        id: Option<String>,
        function: FunctionCallResponse,
    }

    let resp: Response = serde_json::from_str(body).map_err(|e| InferenceError::ResponseParse {
        reason: format!("invalid completion JSON: {e}"),
    })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| InferenceError::ResponseParse {
            reason: "empty choices array".into(),
        })?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCallResponse {
            id: tc
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("call_{}", Uuid::new_v4())),
            r#type: "function".to_string(),
            function: tc.function,
        })
        .collect();

    Ok(CompletionResponse {
        content: choice.message.content.filter(|c| !c.is_empty()),
        tool_calls,
        usage: resp.usage.unwrap_or_default(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> CompletionOptions {
        ModelConfig::default().completion_options()
    }

    #[test]
    fn test_build_request_without_tools_omits_tool_choice() {
        let req = build_request(&[ChatMessage::user("hello")], &[], &options());
        assert!(req.tools.is_none());
        assert!(req.tool_choice.is_none());
        assert_eq!(req.model, "gpt-4");
        assert!(!req.stream);
    }

    #[test]
    fn test_build_request_with_tools_sets_auto() {
        let def = crate::mcp_client::ToolDefinition::new(
            "drive_search_files",
            "Search",
            serde_json::json!({"type": "object"}),
        );
        let tools = vec![ToolDefinition::from(&def)];
        let req = build_request(&[ChatMessage::user("find my notes")], &tools, &options());
        assert_eq!(req.tool_choice.as_deref(), Some("auto"));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["tools"][0]["function"]["name"], "drive_search_files");
        assert_eq!(json["max_tokens"], 2000);
    }

    #[test]
    fn test_parse_text_response_with_usage() {
        let body = r#"{
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 21, "completion_tokens": 4, "total_tokens": 25}
        }"#;
        let resp = parse_completion_response(body).unwrap();
        assert_eq!(resp.content.as_deref(), Some("Hello!"));
        assert!(!resp.has_tool_calls());
        assert_eq!(resp.usage.prompt_tokens, 21);
        assert_eq!(resp.usage.completion_tokens, 4);
    }

    #[test]
    fn test_parse_tool_call_response() {
        let body = r#"{
            "choices": [{"message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [
                    {"id": "call_a", "type": "function", "function": {"name": "gmail_list_messages", "arguments": "{\"maxResults\":5}"}},
                    {"type": "function", "function": {"name": "calendar_list_events", "arguments": ""}}
                ]
            }}]
        }"#;
        let resp = parse_completion_response(body).unwrap();
        assert!(resp.content.is_none());
        assert_eq!(resp.tool_calls.len(), 2);
        assert_eq!(resp.tool_calls[0].id, "call_a");
        assert_eq!(resp.tool_calls[0].function.arguments, "{\"maxResults\":5}");
        assert!(resp.tool_calls[1].id.starts_with("call_"));
        assert_eq!(resp.usage, TokenUsage::default());
    }

    #[test]
    fn test_parse_empty_content_is_none() {
        let body = r#"{"choices": [{"message": {"content": ""}}]}"#;
        assert!(parse_completion_response(body).unwrap().content.is_none());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_completion_response(r#"{"choices": []}"#),
            Err(InferenceError::ResponseParse { .. })
        ));
        assert!(matches!(
            parse_completion_response("<html>bad gateway</html>"),
            Err(InferenceError::ResponseParse { .. })
        ));
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let config = ModelConfig {
            base_url: "http://localhost:8080/v1/".into(),
            ..ModelConfig::default()
        };
        let client = CompletionClient::from_config(config).unwrap();
        assert_eq!(client.endpoint(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_from_config_rejects_invalid_section() {
        let config = ModelConfig {
            model: " ".into(),
            ..ModelConfig::default()
        };
        assert!(matches!(
            CompletionClient::from_config(config),
            Err(InferenceError::ConfigError { .. })
        ));
    }
}
