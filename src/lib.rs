//! devloop - iterative code synthesis and repair
//!
//! Turns a natural-language feature request into a project whose tests
//! pass: plan, pick packages, list files, generate them in parallel, run
//! the tests in a sandbox, and keep diagnosing and patching until the run
//! is green.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`controller`] - The loop state machine
//! - [`oracle`] - Typed oracle operations backed by a language model
//! - [`generate`] - Bounded-concurrency initial code generation
//! - [`sandbox`] - Sandbox runner boundary and the Docker backend
//! - [`template`] - Per-ecosystem environment templates
//! - [`state`] - Run state, phases and snapshots
//! - [`retry`] - Randomized exponential backoff around oracle calls
//! - [`llm`] - Chat-completion transport
//! - [`config`] - Configuration loading and validation
//! - [`output`] - Snapshot persistence
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Mocks for the oracle, sandbox and snapshot sink
//!
//! # Example
//!
//! ```rust,ignore
//! use devloop::{DevloopConfig, LlmOracle, LoopController, OutputWriter, RunRequest};
//! use devloop::sandbox::DockerSandbox;
//! use devloop::template::TemplateRegistry;
//! use std::sync::Arc;
//!
//! let config = DevloopConfig::default();
//! let client = devloop::llm::create_llm_client(&config)?;
//! let oracle = Arc::new(LlmOracle::new(client).with_retry(config.retry));
//! let sandbox = Arc::new(DockerSandbox::from_config(&config.sandbox));
//!
//! let controller = LoopController::new(TemplateRegistry::builtin(), oracle, sandbox, config);
//! let mut writer = OutputWriter::new("output");
//! let summary = controller
//!     .run(&RunRequest::new("Create a Tic-Tac-Toe game.", "react"), &mut writer)
//!     .await?;
//! ```

pub mod config;
pub mod controller;
pub mod diff;
pub mod error;
pub mod generate;
pub mod llm;
pub mod oracle;
pub mod output;
pub mod retry;
pub mod sandbox;
pub mod state;
pub mod template;
pub mod testing;

// Re-export commonly used types
pub use config::DevloopConfig;
pub use controller::{
    IterationReport, LoopController, RunOutcome, RunRequest, RunSummary, SnapshotSink,
};
pub use error::{DevloopError, Result};
pub use oracle::{DebugPlan, LlmOracle, Oracle};
pub use output::OutputWriter;
pub use retry::RetryPolicy;
pub use sandbox::{DockerSandbox, SandboxOutput, SandboxRequest, SandboxRunner};
pub use state::{RunPhase, RunSnapshot, RunState};
pub use template::{EnvironmentTemplate, PackageManager, TemplateRegistry};
