//! The synthesis and repair loop.
//!
//! # State machine
//!
//! ```text
//! PLANNING -> LISTING_FILES -> GENERATING -> EXECUTING
//!                                              |   ^
//!                                 exit != 0    |   |
//!                                              v   |
//!                   DIAGNOSING -> REPAIR_PLANNING -> PATCHING
//!
//! EXECUTING --exit 0--> SUCCESS
//! EXECUTING --budget spent--> GAVE_UP
//! ```
//!
//! A snapshot of the state goes to the [`SnapshotSink`] right before every
//! EXECUTING, starting with iteration 0 for the freshly generated code.
//! Any oracle or sandbox error aborts the run.
//!
//! # Dependency Injection
//!
//! The controller owns no global state. The template registry, oracle,
//! sandbox and configuration are handed in, so tests drive it entirely
//! with mocks.
//!
//! # Example
//!
//! ```rust,ignore
//! use devloop::controller::{LoopController, RunRequest};
//!
//! let controller = LoopController::new(registry, oracle, sandbox, config);
//! let summary = controller
//!     .run(&RunRequest::new("a todo app", "python"), &mut sink)
//!     .await?;
//! println!("{}", summary.outcome);
//! ```

pub mod display;
mod iteration;

use crate::config::DevloopConfig;
use crate::error::Result;
use crate::generate::generate_files;
use crate::oracle::{clean_file_paths, Oracle};
use crate::sandbox::{SandboxRequest, SandboxRunner};
use crate::state::{RunPhase, RunState};
use crate::template::TemplateRegistry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the user asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Feature request in natural language.
    pub prompt: String,
    /// Environment template name.
    pub template: String,
}

impl RunRequest {
    /// Create a request.
    pub fn new(prompt: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            template: template.into(),
        }
    }
}

/// Receives the state before every sandbox execution.
pub trait SnapshotSink: Send {
    /// Called with the iteration number (0 for the initial generation).
    ///
    /// # Errors
    ///
    /// An error aborts the run.
    fn record(&mut self, iteration: u32, state: &RunState) -> Result<()>;
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// Tests passed after `iterations` repair rounds.
    Succeeded { iterations: u32 },
    /// Tests still failed after `iterations` repair rounds, the configured maximum.
    GaveUp { iterations: u32 },
}

impl RunOutcome {
    /// Repair rounds performed.
    #[must_use]
    pub fn iterations(&self) -> u32 {
        match self {
            RunOutcome::Succeeded { iterations } | RunOutcome::GaveUp { iterations } => *iterations,
        }
    }

    /// Terminal phase for this outcome.
    #[must_use]
    pub fn phase(&self) -> RunPhase {
        match self {
            RunOutcome::Succeeded { .. } => RunPhase::Success,
            RunOutcome::GaveUp { .. } => RunPhase::GaveUp,
        }
    }

    /// Whether the tests passed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded { .. })
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Succeeded { iterations } => {
                write!(f, "tests passed after {} repair round(s)", iterations)
            }
            RunOutcome::GaveUp { iterations } => {
                write!(f, "gave up after {} repair round(s)", iterations)
            }
        }
    }
}

/// What one repair round did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationReport {
    /// Repair round number, starting at 1.
    pub iteration: u32,
    /// Exit code of the failing run that triggered this round.
    pub exit_code: i32,
    /// Diagnosis text.
    pub diagnosis: String,
    /// Packages added as a new layer.
    pub installed_packages: Vec<String>,
    /// Commands added as a new layer.
    pub run_commands: Vec<String>,
    /// Files whose content changed.
    pub patched: Vec<String>,
    /// Files the patcher left identical.
    pub unchanged: Vec<String>,
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Terminal outcome.
    pub outcome: RunOutcome,
    /// Plan produced during PLANNING.
    pub plan: String,
    /// Final state.
    pub state: RunState,
    /// One entry per repair round.
    pub reports: Vec<IterationReport>,
}

/// Drives one request from plan to passing tests.
pub struct LoopController {
    registry: TemplateRegistry,
    oracle: Arc<dyn Oracle>,
    sandbox: Arc<dyn SandboxRunner>,
    config: DevloopConfig,
}

impl fmt::Debug for LoopController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopController")
            .field("templates", &self.registry.names())
            .field("oracle", &"<dyn Oracle>")
            .field("sandbox", &"<dyn SandboxRunner>")
            .field("config", &self.config)
            .finish()
    }
}

impl LoopController {
    /// Create a controller from its collaborators.
    pub fn new(
        registry: TemplateRegistry,
        oracle: Arc<dyn Oracle>,
        sandbox: Arc<dyn SandboxRunner>,
        config: DevloopConfig,
    ) -> Self {
        Self {
            registry,
            oracle,
            sandbox,
            config,
        }
    }

    fn transition(&self, phase: RunPhase, iteration: u32) {
        debug!(%phase, iteration, "Entering phase");
    }

    fn budget_spent(&self, iteration: u32) -> bool {
        self.config
            .max_iterations
            .is_some_and(|max| max > 0 && iteration >= max)
    }

    /// Run `request` to a terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTemplate` before any oracle call if the template is
    /// not registered. Any oracle, sandbox or sink error aborts the run.
    pub async fn run(&self, request: &RunRequest, sink: &mut dyn SnapshotSink) -> Result<RunSummary> {
        let result = self.drive(request, sink).await;
        self.sandbox.finish().await;
        result
    }

    async fn drive(&self, request: &RunRequest, sink: &mut dyn SnapshotSink) -> Result<RunSummary> {
        let template = self.registry.get(&request.template)?;
        let input_prompt = template.augment_prompt(&request.prompt);
        info!(template = %template.name, "Starting run");

        // PLANNING
        self.transition(RunPhase::Planning, 0);
        display::section_header("Generating initial plan...");
        let plan = self.oracle.plan(&input_prompt).await?;
        println!("{}", plan);

        display::section_header("Generating initial packages...");
        let packages = self
            .oracle
            .initial_packages(&input_prompt, &plan, template.package_manager)
            .await?;
        println!("{:?}", packages);
        let mut state = RunState::new(input_prompt, packages);

        // LISTING_FILES
        self.transition(RunPhase::ListingFiles, 0);
        display::section_header("Generating file paths...");
        let file_paths = clean_file_paths(
            self.oracle
                .file_paths(&state.effective_prompt(), &plan)
                .await?,
        )?;
        println!("{:?}", file_paths);

        // GENERATING
        self.transition(RunPhase::Generating, 0);
        let code = generate_files(
            Arc::clone(&self.oracle),
            &state.effective_prompt(),
            &plan,
            &file_paths,
            self.config.max_concurrent_generations,
        )
        .await?;
        state.set_initial_code(code)?;

        let timeout = Duration::from_secs(self.config.sandbox.timeout_secs);
        let mut reports = Vec::new();
        let mut iteration = 0;

        loop {
            sink.record(iteration, &state)?;

            self.transition(RunPhase::Executing, iteration);
            let sandbox_request = SandboxRequest::from_state(template, &state, timeout);
            let output = self.sandbox.run(&sandbox_request).await?;

            if output.success() {
                display::section_header("Success!");
                info!(iteration, "Tests passed");
                return Ok(RunSummary {
                    outcome: RunOutcome::Succeeded {
                        iterations: iteration,
                    },
                    plan,
                    state,
                    reports,
                });
            }

            debug!(iteration, exit_code = output.exit_code, "Tests failed");
            if self.budget_spent(iteration) {
                warn!(iteration, "Iteration budget spent, giving up");
                display::section_header("Giving up");
                return Ok(RunSummary {
                    outcome: RunOutcome::GaveUp {
                        iterations: iteration,
                    },
                    plan,
                    state,
                    reports,
                });
            }

            iteration += 1;
            display::section_header(&format!("Iteration {}", iteration));
            let report = self
                .repair(iteration, template, &plan, &file_paths, &mut state, &output)
                .await?;
            reports.push(report);
        }
    }
}
