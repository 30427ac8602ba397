//! Mock implementations of the loop's collaborators.
//!
//! These mocks provide controllable test doubles for the oracle, the
//! sandbox and the snapshot sink, enabling deterministic loop tests with
//! no network and no containers.

use crate::controller::SnapshotSink;
use crate::error::{DevloopError, Result};
use crate::oracle::{DebugPlan, Oracle};
use crate::sandbox::{SandboxOutput, SandboxRequest, SandboxRunner};
use crate::state::{RunSnapshot, RunState};
use crate::template::PackageManager;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// MockOracle
// ============================================================================

/// Scripted oracle.
///
/// Generated files default to `# <path>`; patches default to "no change";
/// repair plans default to empty. Every call is recorded by operation name.
///
/// # Example
///
/// ```rust,ignore
/// let oracle = MockOracle::new()
///     .with_file_paths(&["app/main.py", "test/test_main.py"])
///     .with_repair_plan(DebugPlan {
///         install_packages: vec!["requests".into()],
///         ..DebugPlan::default()
///     });
/// ```
#[derive(Debug)]
pub struct MockOracle {
    plan: String,
    packages: Vec<String>,
    file_paths: Vec<String>,
    code: HashMap<String, String>,
    generation_delay: Duration,
    failing_path: Option<String>,
    diagnosis: String,
    repair_plans: Mutex<VecDeque<DebugPlan>>,
    patches: Mutex<HashMap<String, VecDeque<String>>>,
    calls: Mutex<Vec<String>>,
    repair_file_sets: Mutex<Vec<Vec<String>>>,
    diagnosed: Mutex<Vec<SandboxOutput>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockOracle {
    fn default() -> Self {
        Self {
            plan: "app/main.py holds the program, test/test_main.py its tests".to_string(),
            packages: Vec::new(),
            file_paths: vec!["app/main.py".to_string(), "test/test_main.py".to_string()],
            code: HashMap::new(),
            generation_delay: Duration::ZERO,
            failing_path: None,
            diagnosis: "The tests fail.".to_string(),
            repair_plans: Mutex::new(VecDeque::new()),
            patches: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            repair_file_sets: Mutex::new(Vec::new()),
            diagnosed: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

impl MockOracle {
    /// Create a new mock with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the plan text.
    #[must_use]
    pub fn with_plan(mut self, plan: &str) -> Self {
        self.plan = plan.to_string();
        self
    }

    /// Set the initial package list.
    #[must_use]
    pub fn with_packages(mut self, packages: &[&str]) -> Self {
        self.packages = packages.iter().map(|p| (*p).to_string()).collect();
        self
    }

    /// Set the file-path list.
    #[must_use]
    pub fn with_file_paths(mut self, paths: &[&str]) -> Self {
        self.file_paths = paths.iter().map(|p| (*p).to_string()).collect();
        self
    }

    /// Set the generated content for one path.
    #[must_use]
    pub fn with_code(mut self, path: &str, content: &str) -> Self {
        self.code.insert(path.to_string(), content.to_string());
        self
    }

    /// Delay every generation call.
    #[must_use]
    pub fn with_generation_delay(mut self, delay: Duration) -> Self {
        self.generation_delay = delay;
        self
    }

    /// Make generation of `path` fail.
    #[must_use]
    pub fn with_generation_failure(mut self, path: &str) -> Self {
        self.failing_path = Some(path.to_string());
        self
    }

    /// Set the diagnosis text.
    #[must_use]
    pub fn with_diagnosis(mut self, diagnosis: &str) -> Self {
        self.diagnosis = diagnosis.to_string();
        self
    }

    /// Queue a repair plan. Plans are returned as-is, without validation.
    #[must_use]
    pub fn with_repair_plan(self, plan: DebugPlan) -> Self {
        lock(&self.repair_plans).push_back(plan);
        self
    }

    /// Queue a patch reply for `path`.
    #[must_use]
    pub fn with_patch(self, path: &str, content: &str) -> Self {
        lock(&self.patches)
            .entry(path.to_string())
            .or_default()
            .push_back(content.to_string());
        self
    }

    /// Operation names in call order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Number of calls to `operation`.
    pub fn call_count(&self, operation: &str) -> usize {
        lock(&self.calls).iter().filter(|c| *c == operation).count()
    }

    /// File-path lists passed to `plan_repair`, one per call.
    pub fn repair_file_sets(&self) -> Vec<Vec<String>> {
        lock(&self.repair_file_sets).clone()
    }

    /// Sandbox outputs handed to `diagnose`, in order.
    pub fn diagnosed_outputs(&self) -> Vec<SandboxOutput> {
        lock(&self.diagnosed).clone()
    }

    /// Highest number of concurrent `generate_code` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, operation: &str) {
        lock(&self.calls).push(operation.to_string());
    }
}

#[async_trait]
impl Oracle for MockOracle {
    async fn plan(&self, _prompt: &str) -> Result<String> {
        self.record("plan");
        Ok(self.plan.clone())
    }

    async fn initial_packages(
        &self,
        _prompt: &str,
        _plan: &str,
        _package_manager: PackageManager,
    ) -> Result<Vec<String>> {
        self.record("initial_packages");
        Ok(self.packages.clone())
    }

    async fn file_paths(&self, _prompt: &str, _plan: &str) -> Result<Vec<String>> {
        self.record("file_paths");
        Ok(self.file_paths.clone())
    }

    async fn generate_code(&self, _prompt: &str, _plan: &str, file_path: &str) -> Result<String> {
        self.record("generate_code");
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.generation_delay.is_zero() {
            tokio::time::sleep(self.generation_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_path.as_deref() == Some(file_path) {
            return Err(DevloopError::GenerationFailed {
                file_path: file_path.to_string(),
                message: "mock generation failure".to_string(),
            });
        }
        Ok(self
            .code
            .get(file_path)
            .cloned()
            .unwrap_or_else(|| format!("# {}\n", file_path)))
    }

    async fn diagnose(
        &self,
        _prompt: &str,
        _plan: &str,
        _file_paths: &[String],
        _test_cmd: &str,
        output: &SandboxOutput,
    ) -> Result<String> {
        self.record("diagnose");
        lock(&self.diagnosed).push(output.clone());
        Ok(self.diagnosis.clone())
    }

    async fn plan_repair(
        &self,
        _prompt: &str,
        _package_manager: PackageManager,
        file_paths: &[String],
        _diagnosis: &str,
    ) -> Result<DebugPlan> {
        self.record("plan_repair");
        lock(&self.repair_file_sets).push(file_paths.to_vec());
        Ok(lock(&self.repair_plans).pop_front().unwrap_or_default())
    }

    async fn patch_file(
        &self,
        _prompt: &str,
        file_path: &str,
        content: &str,
        _file_paths: &[String],
        _diagnosis: &str,
    ) -> Result<String> {
        self.record("patch_file");
        let queued = lock(&self.patches)
            .get_mut(file_path)
            .and_then(VecDeque::pop_front);
        Ok(queued.unwrap_or_else(|| content.to_string()))
    }
}

// ============================================================================
// MockSandbox
// ============================================================================

/// Scripted sandbox.
///
/// Queued outputs are returned in order; once the queue is empty every run
/// returns the fallback (passing by default).
///
/// # Example
///
/// ```rust,ignore
/// let sandbox = MockSandbox::new()
///     .with_failure(1, "ImportError: no module named 'requests'");
/// // first run fails, every later run passes
/// ```
#[derive(Debug)]
pub struct MockSandbox {
    outputs: Mutex<VecDeque<SandboxOutput>>,
    fallback: SandboxOutput,
    unavailable: Option<String>,
    requests: Mutex<Vec<SandboxRequest>>,
    finished: AtomicUsize,
}

impl Default for MockSandbox {
    fn default() -> Self {
        Self {
            outputs: Mutex::new(VecDeque::new()),
            fallback: SandboxOutput::new(0, "1 passed", ""),
            unavailable: None,
            requests: Mutex::new(Vec::new()),
            finished: AtomicUsize::new(0),
        }
    }
}

impl MockSandbox {
    /// Create a sandbox whose runs all pass.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failing run.
    #[must_use]
    pub fn with_failure(self, exit_code: i32, stderr: &str) -> Self {
        self.with_output(SandboxOutput::new(exit_code, "", stderr))
    }

    /// Queue an arbitrary output.
    #[must_use]
    pub fn with_output(self, output: SandboxOutput) -> Self {
        lock(&self.outputs).push_back(output);
        self
    }

    /// Set the output returned once the queue is empty.
    #[must_use]
    pub fn with_fallback(mut self, output: SandboxOutput) -> Self {
        self.fallback = output;
        self
    }

    /// Fail every run with `SandboxUnavailable`.
    #[must_use]
    pub fn unavailable(mut self, detail: &str) -> Self {
        self.unavailable = Some(detail.to_string());
        self
    }

    /// Requests received, in order.
    pub fn requests(&self) -> Vec<SandboxRequest> {
        lock(&self.requests).clone()
    }

    /// Number of runs.
    pub fn run_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Number of times the run was finished.
    pub fn finish_count(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxRunner for MockSandbox {
    async fn run(&self, request: &SandboxRequest) -> Result<SandboxOutput> {
        if let Some(ref detail) = self.unavailable {
            return Err(DevloopError::sandbox_unavailable(detail.clone()));
        }
        lock(&self.requests).push(request.clone());
        Ok(lock(&self.outputs)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }

    async fn finish(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// RecordingSink
// ============================================================================

/// Snapshot sink that keeps every snapshot in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    /// Snapshots in the order they were recorded.
    pub snapshots: Vec<RunSnapshot>,
}

impl RecordingSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Iteration numbers recorded, in order.
    pub fn iterations(&self) -> Vec<u32> {
        self.snapshots.iter().map(|s| s.iteration).collect()
    }
}

impl SnapshotSink for RecordingSink {
    fn record(&mut self, iteration: u32, state: &RunState) -> Result<()> {
        self.snapshots.push(RunSnapshot {
            iteration,
            state: state.clone(),
        });
        Ok(())
    }
}
