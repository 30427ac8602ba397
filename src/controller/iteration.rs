//! One repair round: diagnose, plan, patch.

use super::{display, IterationReport, LoopController};
use crate::error::Result;
use crate::sandbox::SandboxOutput;
use crate::state::{RunPhase, RunState};
use crate::template::EnvironmentTemplate;
use std::collections::HashSet;
use tracing::{debug, warn};

impl LoopController {
    /// Turn a failed run into the next state.
    ///
    /// Package and command layers are appended before any file is patched,
    /// so the patcher already sees the new packages in its prompt.
    pub(crate) async fn repair(
        &self,
        iteration: u32,
        template: &EnvironmentTemplate,
        plan: &str,
        file_paths: &[String],
        state: &mut RunState,
        output: &SandboxOutput,
    ) -> Result<IterationReport> {
        // DIAGNOSING
        self.transition(RunPhase::Diagnosing, iteration);
        let prompt = state.effective_prompt();
        let diagnosis = self
            .oracle
            .diagnose(&prompt, plan, file_paths, &template.test_cmd, output)
            .await?;
        println!("{}", diagnosis);

        // REPAIR_PLANNING
        self.transition(RunPhase::RepairPlanning, iteration);
        let known = state.file_paths();
        let debug_plan = self
            .oracle
            .plan_repair(&prompt, template.package_manager, file_paths, &diagnosis)
            .await?
            .validate(&known)?;
        if debug_plan.is_empty() {
            warn!(iteration, "Repair plan requested no changes");
        }

        // PATCHING
        self.transition(RunPhase::Patching, iteration);
        let installed_packages: Vec<String> = {
            let installed: HashSet<&str> = state.all_packages().into_iter().collect();
            debug_plan
                .install_packages
                .iter()
                .filter(|p| !installed.contains(p.as_str()))
                .cloned()
                .collect()
        };
        if state.push_package_layer(installed_packages.clone()) {
            display::info(&format!("Installing packages {:?}.", installed_packages));
        }
        if state.push_command_layer(debug_plan.run_commands.clone()) {
            display::info(&format!("Running commands {:?}.", debug_plan.run_commands));
        }

        let prompt = state.effective_prompt();
        let mut patched = Vec::new();
        let mut unchanged = Vec::new();
        for path in &debug_plan.debug_file_paths {
            display::info(&format!("Debugging {}...", path));
            let original = state.code.get(path).cloned().unwrap_or_default();
            let updated = self
                .oracle
                .patch_file(&prompt, path, &original, file_paths, &diagnosis)
                .await?;

            match state.apply_patch(path, updated)? {
                Some(diff) => {
                    display::diff(&diff);
                    patched.push(path.clone());
                }
                None => {
                    println!("No changes made.");
                    unchanged.push(path.clone());
                }
            }
        }
        debug!(
            iteration,
            patched = patched.len(),
            unchanged = unchanged.len(),
            "Repair round complete"
        );

        Ok(IterationReport {
            iteration,
            exit_code: output.exit_code,
            diagnosis,
            installed_packages,
            run_commands: debug_plan.run_commands,
            patched,
            unchanged,
        })
    }
}
