//! Persist snapshots to disk.
//!
//! Layout for one run:
//!
//! ```text
//! <output>/<run-id>/0/...            generated files before the first execution
//! <output>/<run-id>/state-0.json     full state, including layers
//! <output>/<run-id>/1/...            files before the second execution
//! <output>/<run-id>/state-1.json
//! ```

use crate::controller::SnapshotSink;
use crate::error::Result;
use crate::sandbox::write_files;
use crate::state::{RunSnapshot, RunState};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Fresh run identifier: UTC timestamp plus a short random suffix.
#[must_use]
pub fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &suffix[..8])
}

/// [`SnapshotSink`] writing every snapshot under an output directory.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    root: PathBuf,
    run_id: String,
}

impl OutputWriter {
    /// Writer for a new run under `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: output_dir.into(),
            run_id: new_run_id(),
        }
    }

    /// Use a fixed run identifier.
    #[must_use]
    pub fn with_run_id(mut self, run_id: &str) -> Self {
        self.run_id = run_id.to_string();
        self
    }

    /// This run's identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Directory holding every snapshot of this run.
    #[must_use]
    pub fn run_dir(&self) -> PathBuf {
        self.root.join(&self.run_id)
    }

    /// Directory holding the files of one snapshot.
    #[must_use]
    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        self.run_dir().join(iteration.to_string())
    }

    fn state_path(&self, iteration: u32) -> PathBuf {
        self.run_dir().join(format!("state-{}.json", iteration))
    }

    /// Load a snapshot written earlier by this writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or not a valid snapshot.
    pub fn load_snapshot(&self, iteration: u32) -> Result<RunSnapshot> {
        let json = std::fs::read_to_string(self.state_path(iteration))?;
        Ok(serde_json::from_str(&json)?)
    }
}

fn display_path(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

impl SnapshotSink for OutputWriter {
    fn record(&mut self, iteration: u32, state: &RunState) -> Result<()> {
        let dir = self.iteration_dir(iteration);
        std::fs::create_dir_all(&dir)?;
        println!("Writing files to {}", display_path(&dir));
        write_files(&state.code, &dir)?;

        let snapshot = RunSnapshot {
            iteration,
            state: state.clone(),
        };
        std::fs::write(
            self.state_path(iteration),
            serde_json::to_string_pretty(&snapshot)?,
        )?;
        debug!(iteration, files = state.code.len(), "Snapshot written");

        println!("Packages: {:?}", state.package_layers);
        println!("Image commands: {:?}", state.run_commands);
        Ok(())
    }
}
