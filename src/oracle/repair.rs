//! Debug plans: the structured output of one repair-planning round.
//!
//! The set of paths a plan may target is restricted twice: the function
//! schema offered to the model enumerates the known paths, and
//! [`DebugPlan::validate`] re-checks membership before anything touches the
//! run state.

use crate::error::{DevloopError, Result};
use crate::llm::FunctionSpec;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;

/// Name of the function the model must call.
pub const DEBUG_PLAN_FUNCTION: &str = "DebugPlan";

/// Files to patch, packages to add and commands to run for one round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugPlan {
    /// Existing files to regenerate.
    pub debug_file_paths: Vec<String>,
    /// New packages to install.
    pub install_packages: Vec<String>,
    /// Shell commands to run during image build.
    pub run_commands: Vec<String>,
}

impl DebugPlan {
    /// Function schema whose `debug_file_paths` items are an enum of `known_paths`.
    #[must_use]
    pub fn function_spec(known_paths: &[String]) -> FunctionSpec {
        FunctionSpec {
            name: DEBUG_PLAN_FUNCTION.to_string(),
            description: "A plan to fix the given bugs in the program.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "debug_file_paths": {
                        "type": "array",
                        "description": "The file paths to debug.",
                        "items": { "type": "string", "enum": known_paths },
                    },
                    "install_packages": {
                        "type": "array",
                        "description": "The packages to install.",
                        "items": { "type": "string" },
                    },
                    "run_commands": {
                        "type": "array",
                        "description": "Bash commands to run during image build.",
                        "items": { "type": "string" },
                    },
                },
                "required": ["debug_file_paths", "install_packages", "run_commands"],
            }),
        }
    }

    /// Parse function-call arguments.
    ///
    /// # Errors
    ///
    /// Returns `MalformedOracleOutput` when a field is missing or has the
    /// wrong type.
    pub fn from_arguments(arguments: serde_json::Value) -> Result<Self> {
        serde_json::from_value(arguments)
            .map_err(|e| DevloopError::malformed("plan_repair", e.to_string()))
    }

    /// Check every structured field against the known file set.
    ///
    /// Values are trimmed and de-duplicated in order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRepairPlan` for a path outside `known_paths`, a blank
    /// or flag-like package name, or a blank command.
    pub fn validate(self, known_paths: &[String]) -> Result<Self> {
        let known: HashSet<&str> = known_paths.iter().map(String::as_str).collect();

        let debug_file_paths = dedup_trimmed(self.debug_file_paths);
        if let Some(bad) = debug_file_paths.iter().find(|p| !known.contains(p.as_str())) {
            return Err(DevloopError::invalid_plan(format!(
                "'{}' is not one of the known file paths",
                bad
            )));
        }

        let install_packages = dedup_trimmed(self.install_packages);
        for package in &install_packages {
            if package.is_empty()
                || package.starts_with('-')
                || package.chars().any(char::is_whitespace)
            {
                return Err(DevloopError::invalid_plan(format!(
                    "'{}' is not a valid package name",
                    package
                )));
            }
        }

        let run_commands = dedup_trimmed(self.run_commands);
        if run_commands.iter().any(String::is_empty) {
            return Err(DevloopError::invalid_plan("empty build command"));
        }

        Ok(Self {
            debug_file_paths,
            install_packages,
            run_commands,
        })
    }

    /// True when the plan asks for nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.debug_file_paths.is_empty()
            && self.install_packages.is_empty()
            && self.run_commands.is_empty()
    }
}

fn dedup_trimmed(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| seen.insert(v.clone()))
        .collect()
}
