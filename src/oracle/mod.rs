//! Typed oracle contracts.
//!
//! The loop never talks to a language model directly. It calls the seven
//! operations of [`Oracle`], each with a fixed output shape:
//!
//! | operation          | output            |
//! |--------------------|-------------------|
//! | `plan`             | free text         |
//! | `initial_packages` | list of names     |
//! | `file_paths`       | list of paths     |
//! | `generate_code`    | file content      |
//! | `diagnose`         | free text         |
//! | `plan_repair`      | [`DebugPlan`]     |
//! | `patch_file`       | file content      |
//!
//! [`LlmOracle`] implements them on an [`LlmClient`] and wraps every call in
//! [`retry_async`]. Shape violations are retryable, so a model that keeps
//! answering out of contract ends the run with `OracleExhausted`.

pub mod prompts;
pub mod repair;

pub use repair::DebugPlan;

use crate::error::{DevloopError, Result};
use crate::llm::{ChatMessage, FunctionSpec, LlmClient, OpenAiApiError};
use crate::retry::{retry_async, RetryPolicy};
use crate::sandbox::SandboxOutput;
use crate::template::PackageManager;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::path::{Component, Path};
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Reply the patcher uses for "this file is fine".
pub const NO_CHANGE_SENTINEL: &str = "None";

/// The oracle operations the loop depends on.
///
/// # Errors
///
/// Every operation returns an error only once the implementation has given
/// up; callers treat any error as fatal for the run.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Architectural plan for `prompt`.
    async fn plan(&self, prompt: &str) -> Result<String>;

    /// Packages to install before any code exists.
    async fn initial_packages(
        &self,
        prompt: &str,
        plan: &str,
        package_manager: PackageManager,
    ) -> Result<Vec<String>>;

    /// Relative paths of every file the project will contain.
    async fn file_paths(&self, prompt: &str, plan: &str) -> Result<Vec<String>>;

    /// Content of `file_path`.
    async fn generate_code(&self, prompt: &str, plan: &str, file_path: &str) -> Result<String>;

    /// Free-text diagnosis of a failing run.
    async fn diagnose(
        &self,
        prompt: &str,
        plan: &str,
        file_paths: &[String],
        test_cmd: &str,
        output: &SandboxOutput,
    ) -> Result<String>;

    /// Validated repair plan restricted to `file_paths`.
    async fn plan_repair(
        &self,
        prompt: &str,
        package_manager: PackageManager,
        file_paths: &[String],
        diagnosis: &str,
    ) -> Result<DebugPlan>;

    /// New content for `file_path`, or `content` unchanged when no fix is needed.
    async fn patch_file(
        &self,
        prompt: &str,
        file_path: &str,
        content: &str,
        file_paths: &[String],
        diagnosis: &str,
    ) -> Result<String>;
}

// ============================================================================
// Function Schemas
// ============================================================================

#[derive(Debug, Deserialize)]
struct PackagesNeeded {
    packages: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FilePaths {
    file_paths: Vec<String>,
}

fn string_list_function(name: &str, description: &str, field: &str, field_description: &str) -> FunctionSpec {
    FunctionSpec {
        name: name.to_string(),
        description: description.to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                field: {
                    "type": "array",
                    "description": field_description,
                    "items": { "type": "string" },
                },
            },
            "required": [field],
        }),
    }
}

fn packages_function() -> FunctionSpec {
    string_list_function(
        "PackagesNeeded",
        "A list of packages that the user might need.",
        "packages",
        "The package names.",
    )
}

fn file_paths_function() -> FunctionSpec {
    string_list_function(
        "FilePaths",
        "List of file paths that need to be written.",
        "file_paths",
        "Relative file paths.",
    )
}

// ============================================================================
// Output Shaping
// ============================================================================

/// Trim, drop duplicates (keeping first occurrence) and reject blanks.
fn clean_packages(operation: &str, packages: Vec<String>) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(packages.len());
    for package in packages {
        let package = package.trim().to_string();
        if package.is_empty() {
            return Err(DevloopError::malformed(operation, "empty package name"));
        }
        if seen.insert(package.clone()) {
            out.push(package);
        }
    }
    Ok(out)
}

/// Validate a proposed file set: non-empty, relative, no parent traversal,
/// de-duplicated in order.
pub fn clean_file_paths(paths: Vec<String>) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.trim().to_string();
        if path.is_empty() {
            return Err(DevloopError::malformed("file_paths", "blank file path"));
        }
        let relative = Path::new(&path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !relative {
            return Err(DevloopError::malformed(
                "file_paths",
                format!("'{}' is not a relative path inside the project", path),
            ));
        }
        if seen.insert(path.clone()) {
            out.push(path);
        }
    }
    if out.is_empty() {
        return Err(DevloopError::malformed("file_paths", "no file paths"));
    }
    Ok(out)
}

fn fence_pattern() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| {
            Regex::new(r"(?s)\A\s*```[A-Za-z0-9_+.-]*[ \t]*\r?\n(.*?)\r?\n?```\s*\z").ok()
        })
        .as_ref()
}

/// Unwrap a reply enclosed in a single markdown code fence.
#[must_use]
pub fn strip_code_fence(reply: &str) -> &str {
    let body = fence_pattern()
        .and_then(|re| re.captures(reply))
        .and_then(|c| c.get(1));
    match body {
        Some(body) if !body.as_str().contains("```") => body.as_str(),
        _ => reply,
    }
}

/// Resolve a patcher reply against the original content.
///
/// A reply ending with the `None` sentinel yields the original content.
#[must_use]
pub fn resolve_patch(original: &str, reply: &str) -> String {
    if reply.trim_end().ends_with(NO_CHANGE_SENTINEL) {
        return original.to_string();
    }
    strip_code_fence(reply).to_string()
}

/// Map a transport error onto the crate taxonomy.
///
/// Missing credentials and rejected keys are configuration problems and
/// are never retried.
fn classify_client_error(err: anyhow::Error) -> DevloopError {
    if let Some(api) = err.downcast_ref::<OpenAiApiError>() {
        if !api.is_retryable() {
            return DevloopError::config(api.to_string());
        }
    }
    DevloopError::Other(err)
}

// ============================================================================
// LLM-backed Oracle
// ============================================================================

/// [`Oracle`] backed by an [`LlmClient`], with every call retried.
pub struct LlmOracle {
    client: Arc<dyn LlmClient>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for LlmOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmOracle")
            .field("model", &self.client.model_name())
            .field("retry", &self.retry)
            .finish()
    }
}

impl LlmOracle {
    /// Wrap `client` with the default retry policy.
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn chat(&self, operation: &str, messages: Vec<ChatMessage>) -> Result<String> {
        let messages = &messages;
        let client = &self.client;
        let reply = retry_async(&self.retry, operation, || async move {
            client.chat(messages).await.map_err(classify_client_error)
        })
        .await?;
        debug!(operation, chars = reply.len(), "Oracle replied");
        Ok(reply)
    }

    async fn call<T, P>(
        &self,
        operation: &str,
        messages: Vec<ChatMessage>,
        function: FunctionSpec,
        parse: P,
    ) -> Result<T>
    where
        P: Fn(serde_json::Value) -> Result<T> + Send + Sync,
        T: Send,
    {
        let messages = &messages;
        let function = &function;
        let parse = &parse;
        let client = &self.client;
        retry_async(&self.retry, operation, || async move {
            let arguments = client
                .call_function(messages, function)
                .await
                .map_err(classify_client_error)?;
            parse(arguments)
        })
        .await
    }
}

#[async_trait]
impl Oracle for LlmOracle {
    async fn plan(&self, prompt: &str) -> Result<String> {
        let plan = self.chat("plan", prompts::plan(prompt)).await?;
        if plan.trim().is_empty() {
            return Err(DevloopError::malformed("plan", "empty plan"));
        }
        Ok(plan)
    }

    async fn initial_packages(
        &self,
        prompt: &str,
        plan: &str,
        package_manager: PackageManager,
    ) -> Result<Vec<String>> {
        self.call(
            "initial_packages",
            prompts::initial_packages(prompt, plan, package_manager),
            packages_function(),
            |value| {
                let parsed: PackagesNeeded = serde_json::from_value(value)
                    .map_err(|e| DevloopError::malformed("initial_packages", e.to_string()))?;
                clean_packages("initial_packages", parsed.packages)
            },
        )
        .await
    }

    async fn file_paths(&self, prompt: &str, plan: &str) -> Result<Vec<String>> {
        self.call(
            "file_paths",
            prompts::file_paths(prompt, plan),
            file_paths_function(),
            |value| {
                let parsed: FilePaths = serde_json::from_value(value)
                    .map_err(|e| DevloopError::malformed("file_paths", e.to_string()))?;
                clean_file_paths(parsed.file_paths)
            },
        )
        .await
    }

    async fn generate_code(&self, prompt: &str, plan: &str, file_path: &str) -> Result<String> {
        let reply = self
            .chat("generate_code", prompts::generate_code(prompt, plan, file_path))
            .await?;
        Ok(strip_code_fence(&reply).to_string())
    }

    async fn diagnose(
        &self,
        prompt: &str,
        plan: &str,
        file_paths: &[String],
        test_cmd: &str,
        output: &SandboxOutput,
    ) -> Result<String> {
        self.chat(
            "diagnose",
            prompts::diagnose(
                prompt,
                plan,
                file_paths,
                test_cmd,
                &output.stdout,
                &output.stderr,
            ),
        )
        .await
    }

    async fn plan_repair(
        &self,
        prompt: &str,
        package_manager: PackageManager,
        file_paths: &[String],
        diagnosis: &str,
    ) -> Result<DebugPlan> {
        self.call(
            "plan_repair",
            prompts::plan_repair(prompt, package_manager, file_paths, diagnosis),
            DebugPlan::function_spec(file_paths),
            |value| DebugPlan::from_arguments(value)?.validate(file_paths),
        )
        .await
    }

    async fn patch_file(
        &self,
        prompt: &str,
        file_path: &str,
        content: &str,
        file_paths: &[String],
        diagnosis: &str,
    ) -> Result<String> {
        let reply = self
            .chat(
                "patch_file",
                prompts::patch_file(prompt, file_path, content, file_paths, diagnosis),
            )
            .await?;
        Ok(resolve_patch(content, &reply))
    }
}
