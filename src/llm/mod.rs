//! LLM client abstraction used by the oracles.
//!
//! The [`LlmClient`] trait is the transport seam: oracles build chat
//! messages, the client turns them into text or into the JSON arguments of
//! a forced function call. It is:
//!
//! - **Object-safe**: used as `Arc<dyn LlmClient>`
//! - **Thread-safe**: `Send + Sync`, shared by concurrent generation tasks
//! - **Async-first**: every call awaits the remote model
//!
//! Retrying is not the client's job; see [`crate::retry`].
//!
//! # Example
//!
//! ```rust,ignore
//! use devloop::llm::{ChatMessage, LlmClient, OpenAiProvider};
//!
//! let client = OpenAiProvider::new("gpt-4o");
//! let reply = client.chat(&[ChatMessage::user("Hello!")]).await?;
//! ```

pub mod openai;

pub use openai::{OpenAiApiError, OpenAiProvider};

use crate::config::DevloopConfig;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// One message of a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A function the model is forced to call, described by a JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    /// Function name.
    pub name: String,
    /// What the function represents.
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

/// Abstraction for LLM calls.
///
/// # Errors
///
/// Implementations return an error when the model is unreachable, the
/// request is rejected, or the reply cannot be parsed.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a conversation and return the assistant's text.
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String>;

    /// Send a conversation, force a call to `function`, and return its
    /// parsed arguments.
    async fn call_function(
        &self,
        messages: &[ChatMessage],
        function: &FunctionSpec,
    ) -> Result<serde_json::Value>;

    /// Model identifier, for logs.
    fn model_name(&self) -> &str;
}

/// Create the LLM client described by `config`.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn create_llm_client(config: &DevloopConfig) -> Result<Arc<dyn LlmClient>> {
    config.validate()?;
    let client = OpenAiProvider::new(&config.model)
        .with_api_key_env(&config.api_key_env)
        .with_api_base(&config.api_base)
        .with_timeout(config.request_timeout_secs);
    Ok(Arc::new(client))
}

/// Mock LLM client for testing.
///
/// Text replies and function replies are served from separate queues; once
/// a queue is empty the last configured fallback is returned. Thread-safe
/// for use from concurrent tasks.
///
/// # Example
///
/// ```
/// use devloop::llm::{ChatMessage, LlmClient, MockLlmClient};
///
/// # tokio_test_block(async {
/// let client = MockLlmClient::new().with_response("plan text");
/// let reply = client.chat(&[ChatMessage::user("hi")]).await.unwrap();
/// assert_eq!(reply, "plan text");
/// assert_eq!(client.call_count(), 1);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<String>>,
    fallback_response: String,
    function_responses: Mutex<VecDeque<serde_json::Value>>,
    fallback_function: Option<serde_json::Value>,
    error: Option<String>,
    fail_count: AtomicU32,
    fail_error: Option<String>,
    call_count: AtomicU32,
    last_messages: Mutex<Vec<ChatMessage>>,
}

impl MockLlmClient {
    /// Create a new mock client with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fallback text response.
    #[must_use]
    pub fn with_response(mut self, response: &str) -> Self {
        self.fallback_response = response.to_string();
        self
    }

    /// Queue a text response served before the fallback.
    #[must_use]
    pub fn with_queued_response(self, response: &str) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(response.to_string());
        self
    }

    /// Set the fallback function-call arguments.
    #[must_use]
    pub fn with_function_response(mut self, value: serde_json::Value) -> Self {
        self.fallback_function = Some(value);
        self
    }

    /// Queue function-call arguments served before the fallback.
    #[must_use]
    pub fn with_queued_function_response(self, value: serde_json::Value) -> Self {
        self.function_responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(value);
        self
    }

    /// Configure every call to fail.
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Configure the mock to fail the first N calls, then succeed.
    #[must_use]
    pub fn with_fail_count(mut self, count: u32, error: &str) -> Self {
        self.fail_count = AtomicU32::new(count);
        self.fail_error = Some(error.to_string());
        self
    }

    /// Number of calls made (both kinds).
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Messages of the most recent call.
    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.last_messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn begin_call(&self, messages: &[ChatMessage]) -> Result<()> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        *self
            .last_messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = messages.to_vec();

        let remaining = self.fail_count.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_count.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!(
                "{}",
                self.fail_error.as_deref().unwrap_or("Mock failure")
            );
        }

        if let Some(ref error) = self.error {
            anyhow::bail!("{}", error);
        }
        Ok(())
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        self.begin_call(messages)?;
        let queued = self
            .responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        Ok(queued.unwrap_or_else(|| self.fallback_response.clone()))
    }

    async fn call_function(
        &self,
        messages: &[ChatMessage],
        function: &FunctionSpec,
    ) -> Result<serde_json::Value> {
        self.begin_call(messages)?;
        let queued = self
            .function_responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        queued
            .or_else(|| self.fallback_function.clone())
            .ok_or_else(|| anyhow::anyhow!("no mock response for function '{}'", function.name))
    }

    fn model_name(&self) -> &str {
        "mock-llm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> FunctionSpec {
        FunctionSpec {
            name: "PackagesNeeded".to_string(),
            description: "A list of packages needed.".to_string(),
            parameters: json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn test_mock_queue_then_fallback() {
        let client = MockLlmClient::new()
            .with_queued_response("first")
            .with_response("always");

        assert_eq!(client.chat(&[]).await.unwrap(), "first");
        assert_eq!(client.chat(&[]).await.unwrap(), "always");
        assert_eq!(client.chat(&[]).await.unwrap(), "always");
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_fail_count_then_succeeds() {
        let client = MockLlmClient::new()
            .with_response("ok")
            .with_fail_count(2, "rate limited");

        assert!(client.chat(&[]).await.is_err());
        let err = client.chat(&[]).await.unwrap_err();
        assert!(err.to_string().contains("rate limited"));
        assert_eq!(client.chat(&[]).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_mock_function_without_response_errors() {
        let client = MockLlmClient::new();
        let err = client.call_function(&[], &spec()).await.unwrap_err();
        assert!(err.to_string().contains("PackagesNeeded"));
    }

    #[tokio::test]
    async fn test_mock_records_last_messages() {
        let client = MockLlmClient::new().with_function_response(json!({"packages": []}));
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("I want a: game")];
        client.call_function(&messages, &spec()).await.unwrap();
        assert_eq!(client.last_messages(), messages);
    }

    #[test]
    fn test_create_client_rejects_invalid_config() {
        let config = DevloopConfig::default().with_max_concurrent_generations(0);
        assert!(create_llm_client(&config).is_err());
    }

    #[test]
    fn test_create_client_uses_model() {
        let config = DevloopConfig::default().with_model("gpt-4o");
        let client = create_llm_client(&config).unwrap();
        assert_eq!(client.model_name(), "gpt-4o");
    }
}
