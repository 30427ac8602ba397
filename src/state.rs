//! Run state and the phases of the synthesis/repair state machine.
//!
//! [`RunState`] is owned by the controller for the whole run. Other
//! components only ever receive copies of the values they need.
//!
//! Invariants kept here:
//! - `package_layers` and `run_commands` are append-only
//! - the key set of `code` is fixed once generation finishes; patches only
//!   replace values of known paths

use crate::diff::{line_diff, DiffLine};
use crate::error::{DevloopError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Phases of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    /// Plan and initial packages.
    Planning,
    /// File-path set being established.
    ListingFiles,
    /// Initial code generation.
    Generating,
    /// Sandbox run in progress.
    Executing,
    /// Turning test output into a diagnosis.
    Diagnosing,
    /// Turning the diagnosis into a debug plan.
    RepairPlanning,
    /// Regenerating flagged files.
    Patching,
    /// Tests passed. Terminal.
    Success,
    /// Iteration budget spent without passing tests. Terminal.
    GaveUp,
}

impl RunPhase {
    /// Whether the run ends in this phase.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Success | RunPhase::GaveUp)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Planning => "PLANNING",
            RunPhase::ListingFiles => "LISTING_FILES",
            RunPhase::Generating => "GENERATING",
            RunPhase::Executing => "EXECUTING",
            RunPhase::Diagnosing => "DIAGNOSING",
            RunPhase::RepairPlanning => "REPAIR_PLANNING",
            RunPhase::Patching => "PATCHING",
            RunPhase::Success => "SUCCESS",
            RunPhase::GaveUp => "GAVE_UP",
        };
        write!(f, "{}", name)
    }
}

/// Mutable record threaded through one run.
///
/// # Example
///
/// ```
/// use devloop::state::RunState;
///
/// let mut state = RunState::new("a todo app", vec!["flask".into()]);
/// state.push_package_layer(vec!["requests".into()]);
/// assert_eq!(state.package_layers.len(), 2);
/// assert!(state
///     .effective_prompt()
///     .ends_with("Assume you have these packages installed: [\"flask\", \"requests\"]"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Original request plus template guidance. Never changes.
    pub input_prompt: String,
    /// File path to current content.
    pub code: BTreeMap<String, String>,
    /// Package install batches, in install order.
    pub package_layers: Vec<Vec<String>>,
    /// Build-time command batches, in run order.
    pub run_commands: Vec<Vec<String>>,
}

impl RunState {
    /// Fresh state with one initial package layer and no command layers.
    #[must_use]
    pub fn new(input_prompt: impl Into<String>, initial_packages: Vec<String>) -> Self {
        Self {
            input_prompt: input_prompt.into(),
            code: BTreeMap::new(),
            package_layers: vec![initial_packages],
            run_commands: Vec::new(),
        }
    }

    /// All package names across layers, in order.
    #[must_use]
    pub fn all_packages(&self) -> Vec<&str> {
        self.package_layers
            .iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// The prompt every oracle sees once packages are known.
    #[must_use]
    pub fn effective_prompt(&self) -> String {
        format!(
            "{}\n\nAssume you have these packages installed: {:?}",
            self.input_prompt,
            self.all_packages()
        )
    }

    /// Known file paths, sorted.
    #[must_use]
    pub fn file_paths(&self) -> Vec<String> {
        self.code.keys().cloned().collect()
    }

    /// Install the generated files. Only valid while `code` is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if files were already installed.
    pub fn set_initial_code(&mut self, code: BTreeMap<String, String>) -> Result<()> {
        if !self.code.is_empty() {
            return Err(DevloopError::Other(anyhow::anyhow!(
                "initial code already generated; the file set is fixed"
            )));
        }
        self.code = code;
        Ok(())
    }

    /// Append a package layer. Returns `false` (and appends nothing) for an empty batch.
    pub fn push_package_layer(&mut self, packages: Vec<String>) -> bool {
        if packages.is_empty() {
            return false;
        }
        self.package_layers.push(packages);
        true
    }

    /// Append a command layer. Returns `false` (and appends nothing) for an empty batch.
    pub fn push_command_layer(&mut self, commands: Vec<String>) -> bool {
        if commands.is_empty() {
            return false;
        }
        self.run_commands.push(commands);
        true
    }

    /// Replace the content of a known file.
    ///
    /// Returns the line diff when the content changed, `None` when the new
    /// content is byte-identical (nothing is mutated in that case).
    ///
    /// # Errors
    ///
    /// Returns `InvalidRepairPlan` if `path` is not part of the file set.
    pub fn apply_patch(&mut self, path: &str, content: String) -> Result<Option<Vec<DiffLine>>> {
        let current = self.code.get_mut(path).ok_or_else(|| {
            DevloopError::invalid_plan(format!("'{}' is not a known file path", path))
        })?;

        if *current == content {
            return Ok(None);
        }

        let diff = line_diff(current, &content);
        *current = content;
        Ok(Some(diff))
    }
}

/// A copy of the state handed to snapshot sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// 0 for the initial generation, then one per repair round.
    pub iteration: u32,
    /// State as it is about to be executed.
    pub state: RunState,
}
