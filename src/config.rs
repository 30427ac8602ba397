//! Configuration loading and validation.
//!
//! Configuration is read from a TOML file and layered:
//!
//! 1. An explicit path (`--config`)
//! 2. `./devloop.toml`
//! 3. `<user config dir>/devloop/config.toml`
//! 4. Built-in defaults
//!
//! CLI flags are applied on top by the binary.
//!
//! # Example
//!
//! ```
//! use devloop::config::DevloopConfig;
//!
//! let config: DevloopConfig = toml::from_str(r#"
//!     model = "gpt-4o-mini"
//!     max_iterations = 5
//!
//!     [retry]
//!     max_attempts = 3
//! "#).unwrap();
//!
//! assert_eq!(config.model, "gpt-4o-mini");
//! assert_eq!(config.retry.max_attempts, 3);
//! assert_eq!(config.retry.min_wait_secs, 5);
//! assert_eq!(config.max_concurrent_generations, 3);
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{DevloopError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the project-local configuration file.
pub const CONFIG_FILE_NAME: &str = "devloop.toml";

/// Default number of concurrently in-flight code generation calls.
pub const DEFAULT_MAX_CONCURRENT_GENERATIONS: usize = 3;

/// Default wall-clock limit for one sandbox run, in seconds.
pub const DEFAULT_SANDBOX_TIMEOUT_SECS: u64 = 120;

/// Default wall-clock limit for building one sandbox image, in seconds.
pub const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 600;

/// Default number of repair rounds before the loop gives up.
pub const DEFAULT_MAX_ITERATIONS: u32 = 20;

/// Sandbox execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock timeout for a single test run.
    pub timeout_secs: u64,
    /// Wall-clock timeout for building the image of a single run.
    pub build_timeout_secs: u64,
    /// Container CLI used to build and run images.
    pub docker_binary: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_SANDBOX_TIMEOUT_SECS,
            build_timeout_secs: DEFAULT_BUILD_TIMEOUT_SECS,
            docker_binary: "docker".to_string(),
        }
    }
}

/// Top-level devloop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevloopConfig {
    /// Model identifier passed to the oracle backend.
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// API base URL (override for proxies or compatible servers).
    pub api_base: String,
    /// Per-request timeout for oracle calls.
    pub request_timeout_secs: u64,
    /// Bound on concurrently in-flight generation calls.
    pub max_concurrent_generations: usize,
    /// Repair rounds allowed before giving up. `None` means unbounded.
    ///
    /// Omitted in a file, the default budget applies. `0` in a file means
    /// unbounded, the same as `--max-iterations 0`.
    #[serde(
        deserialize_with = "deserialize_budget",
        serialize_with = "serialize_budget"
    )]
    pub max_iterations: Option<u32>,
    /// Backoff policy wrapped around every oracle call.
    pub retry: RetryPolicy,
    /// Sandbox settings.
    pub sandbox: SandboxConfig,
}

impl Default for DevloopConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4-1106-preview".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            request_timeout_secs: 300,
            max_concurrent_generations: DEFAULT_MAX_CONCURRENT_GENERATIONS,
            max_iterations: Some(DEFAULT_MAX_ITERATIONS),
            retry: RetryPolicy::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl DevloopConfig {
    /// Load configuration from a specific TOML file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or parsed,
    /// or if the parsed values fail validation.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DevloopError::config_with_path(format!("cannot read config: {e}"), path.to_path_buf())
        })?;
        let config: DevloopConfig = toml::from_str(&content).map_err(|e| {
            DevloopError::config_with_path(format!("cannot parse config: {e}"), path.to_path_buf())
        })?;
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Resolve configuration using the layered lookup order.
    ///
    /// An explicit path must exist; the implicit locations are optional.
    ///
    /// # Errors
    ///
    /// Returns an error if a located file is unreadable or invalid.
    pub fn resolve(explicit: Option<&Path>, project_dir: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }

        for candidate in Self::candidate_paths(project_dir) {
            if candidate.is_file() {
                return Self::load_from(&candidate);
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Implicit configuration locations, in lookup order.
    #[must_use]
    pub fn candidate_paths(project_dir: &Path) -> Vec<PathBuf> {
        let mut paths = vec![project_dir.join(CONFIG_FILE_NAME)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("devloop").join("config.toml"));
        }
        paths
    }

    /// Validate value ranges.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(DevloopError::invalid_config("model", "must not be empty"));
        }
        if self.max_concurrent_generations == 0 {
            return Err(DevloopError::invalid_config(
                "max_concurrent_generations",
                "must be at least 1",
            ));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(DevloopError::invalid_config(
                "sandbox.timeout_secs",
                "must be at least 1",
            ));
        }
        if self.sandbox.build_timeout_secs == 0 {
            return Err(DevloopError::invalid_config(
                "sandbox.build_timeout_secs",
                "must be at least 1",
            ));
        }
        if self.max_iterations == Some(0) {
            return Err(DevloopError::invalid_config(
                "max_iterations",
                "use None (or 0 in a file) for an unbounded budget",
            ));
        }
        self.retry.validate()
    }

    /// Set the model identifier.
    #[must_use]
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Set the repair-round budget. `0` disables the bound.
    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = if max == 0 { None } else { Some(max) };
        self
    }

    /// Set the generation concurrency bound.
    #[must_use]
    pub fn with_max_concurrent_generations(mut self, limit: usize) -> Self {
        self.max_concurrent_generations = limit;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

fn deserialize_budget<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<u32>::deserialize(deserializer)?;
    Ok(raw.filter(|&max| max > 0))
}

fn serialize_budget<S>(budget: &Option<u32>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u32(budget.unwrap_or(0))
}
