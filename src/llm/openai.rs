//! OpenAI chat-completions client.
//!
//! [`OpenAiProvider`] implements [`LlmClient`] against the chat completions
//! endpoint. Requests are sent through `curl` as a subprocess, with the
//! request body piped on stdin. Structured replies use forced tool calls.
//!
//! # Example
//!
//! ```rust,ignore
//! use devloop::llm::{ChatMessage, LlmClient, OpenAiProvider};
//!
//! let provider = OpenAiProvider::new("gpt-4o").with_api_key_env("OPENAI_API_KEY");
//! let reply = provider.chat(&[ChatMessage::user("Hello!")]).await?;
//! ```

use crate::llm::{ChatMessage, FunctionSpec, LlmClient};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Sampling temperature used for every oracle call.
pub const TEMPERATURE: f32 = 0.7;

// =============================================================================
// OpenAI API Errors
// =============================================================================

/// Errors specific to OpenAI API interactions.
#[derive(Error, Debug)]
pub enum OpenAiApiError {
    /// Rate limit exceeded.
    #[error("Rate limit exceeded: {message}")]
    RateLimited { message: String },

    /// Authentication failed - check API key.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// API key not found in environment.
    #[error("API key not found in environment variable '{env_var}'")]
    ApiKeyNotFound { env_var: String },

    /// Invalid request - check prompt/parameters.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Server error - may be transient.
    #[error("Server error: {message}")]
    ServerError { message: String },

    /// Network/connection error.
    #[error("Connection error: {message}")]
    ConnectionError { message: String },

    /// Timeout waiting for response.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Invalid response from API.
    #[error("Invalid API response: {message}")]
    InvalidResponse { message: String },
}

impl OpenAiApiError {
    /// Check if retrying the same request could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::AuthenticationFailed { .. } | Self::ApiKeyNotFound { .. }
        )
    }

    /// Classify an `error` object returned in a response body.
    pub fn from_error_body(error_type: &str, message: &str) -> Self {
        let lower = message.to_lowercase();
        if error_type.contains("rate_limit") || lower.contains("rate limit") {
            Self::RateLimited {
                message: message.to_string(),
            }
        } else if error_type.contains("authentication")
            || error_type.contains("invalid_api_key")
            || lower.contains("api key")
        {
            Self::AuthenticationFailed {
                message: message.to_string(),
            }
        } else if error_type.contains("server_error") || lower.contains("overloaded") {
            Self::ServerError {
                message: message.to_string(),
            }
        } else {
            Self::InvalidRequest {
                message: message.to_string(),
            }
        }
    }
}

// =============================================================================
// OpenAI API Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
struct ToolDefinition<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a FunctionSpec,
}

/// Request body for the chat completions API.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

/// Response from the chat completions API.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

// =============================================================================
// OpenAI Provider
// =============================================================================

/// OpenAI chat-completions provider.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    model: String,
    api_key_env: String,
    timeout_secs: u64,
    api_base: String,
}

impl OpenAiProvider {
    /// Default timeout for requests.
    pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

    /// Default API base URL.
    pub const DEFAULT_API_BASE: &'static str = "https://api.openai.com/v1";

    /// Default API key environment variable.
    pub const DEFAULT_API_KEY_ENV: &'static str = "OPENAI_API_KEY";

    /// Create a provider for the given model id.
    #[must_use]
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            api_key_env: Self::DEFAULT_API_KEY_ENV.to_string(),
            timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
            api_base: Self::DEFAULT_API_BASE.to_string(),
        }
    }

    /// Set the environment variable name for the API key.
    #[must_use]
    pub fn with_api_key_env(mut self, env_var: &str) -> Self {
        self.api_key_env = env_var.to_string();
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Set a custom API base URL (for proxies or compatible servers).
    #[must_use]
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// Completions endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    fn get_api_key(&self) -> Result<String, OpenAiApiError> {
        env::var(&self.api_key_env).map_err(|_| OpenAiApiError::ApiKeyNotFound {
            env_var: self.api_key_env.clone(),
        })
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        function: Option<&FunctionSpec>,
    ) -> Result<String, OpenAiApiError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: TEMPERATURE,
            tools: function.map(|f| {
                vec![ToolDefinition {
                    kind: "function",
                    function: f,
                }]
            }),
            tool_choice: function.map(|f| {
                serde_json::json!({"type": "function", "function": {"name": f.name}})
            }),
        };
        serde_json::to_string(&request).map_err(|e| OpenAiApiError::InvalidRequest {
            message: format!("Failed to serialize request: {}", e),
        })
    }

    /// POST `body` to the completions endpoint and parse the reply.
    async fn execute(&self, body: String) -> Result<ChatCompletionResponse, OpenAiApiError> {
        let api_key = self.get_api_key()?;
        let url = self.endpoint();

        debug!(
            "Sending request to {} ({} bytes body)",
            self.model,
            body.len()
        );

        let mut child = tokio::process::Command::new("curl")
            .args([
                "-s",
                "-X",
                "POST",
                &url,
                "-H",
                &format!("Authorization: Bearer {}", api_key),
                "-H",
                "Content-Type: application/json",
                "--data-binary",
                "@-",
                "--max-time",
                &self.timeout_secs.to_string(),
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OpenAiApiError::ConnectionError {
                message: format!("Failed to execute curl: {}", e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(body.as_bytes())
                .await
                .map_err(|e| OpenAiApiError::ConnectionError {
                    message: format!("Failed to write request body: {}", e),
                })?;
            drop(stdin);
        }

        let grace = Duration::from_secs(self.timeout_secs.saturating_add(5));
        let output = match tokio::time::timeout(grace, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(OpenAiApiError::ConnectionError {
                    message: format!("curl failed: {}", e),
                })
            }
            Err(_) => {
                return Err(OpenAiApiError::Timeout {
                    timeout_secs: self.timeout_secs,
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // curl exit code 28 is "operation timed out"
            if output.status.code() == Some(28) || stderr.contains("timed out") {
                return Err(OpenAiApiError::Timeout {
                    timeout_secs: self.timeout_secs,
                });
            }
            return Err(OpenAiApiError::ConnectionError {
                message: format!("curl failed: {}", stderr.trim()),
            });
        }

        parse_response(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse a completions response body, surfacing embedded API errors.
fn parse_response(body: &str) -> Result<ChatCompletionResponse, OpenAiApiError> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("Unknown error");
            let error_type = error
                .get("type")
                .or_else(|| error.get("code"))
                .and_then(|t| t.as_str())
                .unwrap_or("");
            return Err(OpenAiApiError::from_error_body(error_type, message));
        }
    }

    serde_json::from_str(body).map_err(|e| OpenAiApiError::InvalidResponse {
        message: format!("Failed to parse response: {} - Body: {}", e, body),
    })
}

/// Text content of the first choice.
fn first_content(response: ChatCompletionResponse) -> Result<String, OpenAiApiError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| OpenAiApiError::InvalidResponse {
            message: "response has no message content".to_string(),
        })
}

/// Parsed arguments of the first tool call to `name`.
fn first_function_arguments(
    response: ChatCompletionResponse,
    name: &str,
) -> Result<serde_json::Value, OpenAiApiError> {
    let call = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.tool_calls.into_iter().find(|t| t.function.name == name))
        .ok_or_else(|| OpenAiApiError::InvalidResponse {
            message: format!("response has no call to '{}'", name),
        })?;

    serde_json::from_str(&call.function.arguments).map_err(|e| OpenAiApiError::InvalidResponse {
        message: format!("arguments of '{}' are not valid JSON: {}", name, e),
    })
}

#[async_trait]
impl LlmClient for OpenAiProvider {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = self.request_body(messages, None)?;
        let response = self.execute(body).await?;
        Ok(first_content(response)?)
    }

    async fn call_function(
        &self,
        messages: &[ChatMessage],
        function: &FunctionSpec,
    ) -> Result<serde_json::Value> {
        let body = self.request_body(messages, Some(function))?;
        let response = self.execute(body).await?;
        Ok(first_function_arguments(response, &function.name)?)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let provider = OpenAiProvider::new("gpt-4o").with_api_base("http://localhost:8080/v1/");
        assert_eq!(provider.endpoint(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_missing_api_key() {
        let provider =
            OpenAiProvider::new("gpt-4o").with_api_key_env("DEVLOOP_TEST_KEY_THAT_DOES_NOT_EXIST");
        let err = provider.get_api_key().unwrap_err();
        assert!(matches!(err, OpenAiApiError::ApiKeyNotFound { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_request_body_forces_function() {
        let provider = OpenAiProvider::new("gpt-4o");
        let spec = FunctionSpec {
            name: "PackagesNeeded".to_string(),
            description: "A list of packages needed.".to_string(),
            parameters: json!({"type": "object"}),
        };
        let body = provider
            .request_body(&[ChatMessage::user("hi")], Some(&spec))
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["model"], "gpt-4o");
        assert_eq!(value["tools"][0]["type"], "function");
        assert_eq!(value["tools"][0]["function"]["name"], "PackagesNeeded");
        assert_eq!(value["tool_choice"]["function"]["name"], "PackagesNeeded");
        assert_eq!(value["messages"][0]["role"], "user");
    }

    #[test]
    fn test_request_body_plain_chat_has_no_tools() {
        let provider = OpenAiProvider::new("gpt-4o");
        let body = provider.request_body(&[ChatMessage::user("hi")], None).unwrap();
        assert!(!body.contains("tools"));
        assert!(!body.contains("tool_choice"));
    }

    #[test]
    fn test_parse_text_response() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"print('hi')"}}]}"#;
        let response = parse_response(body).unwrap();
        assert_eq!(first_content(response).unwrap(), "print('hi')");
    }

    #[test]
    fn test_parse_function_response() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":null,
            "tool_calls":[{"id":"1","type":"function","function":{"name":"PackagesNeeded",
            "arguments":"{\"packages\":[\"requests\"]}"}}]}}]}"#;
        let response = parse_response(body).unwrap();
        let args = first_function_arguments(response, "PackagesNeeded").unwrap();
        assert_eq!(args, json!({"packages": ["requests"]}));
    }

    #[test]
    fn test_parse_function_response_wrong_name() {
        let body = r#"{"choices":[{"message":{"content":null,
            "tool_calls":[{"function":{"name":"Other","arguments":"{}"}}]}}]}"#;
        let response = parse_response(body).unwrap();
        assert!(first_function_arguments(response, "PackagesNeeded").is_err());
    }

    #[test]
    fn test_parse_error_body() {
        let body = r#"{"error":{"message":"Rate limit reached for gpt-4","type":"rate_limit_exceeded"}}"#;
        let err = parse_response(body).unwrap_err();
        assert!(matches!(err, OpenAiApiError::RateLimited { .. }));
        assert!(err.is_retryable());

        let body = r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error","code":"invalid_api_key"}}"#;
        let err = parse_response(body).unwrap_err();
        assert!(matches!(err, OpenAiApiError::AuthenticationFailed { .. }));
    }

    #[test]
    fn test_parse_garbage_is_invalid_response() {
        let err = parse_response("<html>502</html>").unwrap_err();
        assert!(matches!(err, OpenAiApiError::InvalidResponse { .. }));
    }
}
