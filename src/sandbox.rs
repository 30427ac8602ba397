//! Sandbox runner: build an image for the current state and run its tests.
//!
//! The controller only depends on the [`SandboxRunner`] trait. A failing
//! test run is a normal result (non-zero `exit_code`), not an error; errors
//! are reserved for a backend that cannot run anything at all.
//!
//! # Example
//!
//! ```rust,ignore
//! use devloop::sandbox::{DockerSandbox, SandboxRequest, SandboxRunner};
//!
//! let request = SandboxRequest::from_state(template, &state, Duration::from_secs(120));
//! let output = DockerSandbox::new().run(&request).await?;
//! if output.success() {
//!     println!("tests passed");
//! }
//! ```

use crate::config::{SandboxConfig, DEFAULT_BUILD_TIMEOUT_SECS};
use crate::error::{DevloopError, Result};
use crate::state::RunState;
use crate::template::{BuildSpec, EnvironmentTemplate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Exit code reported when the test command or image build exceeds its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Where generated files are mounted inside the container before being
/// copied over the template's workdir.
const STAGING_DIR: &str = "/devloop/src";

// ============================================================================
// Request / Output
// ============================================================================

/// Everything a backend needs for one test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRequest {
    /// Layered image build.
    pub build: BuildSpec,
    /// Relative file path to content.
    pub files: BTreeMap<String, String>,
    /// Directory the files land in.
    pub workdir: String,
    /// Test command, run through `sh -c`.
    pub test_cmd: String,
    /// Wall-clock limit for the test command.
    pub timeout: Duration,
}

impl SandboxRequest {
    /// Build the request for `state` on top of `template`.
    ///
    /// Command layers are applied first, then package layers, each in the
    /// order they were appended to the state.
    #[must_use]
    pub fn from_state(template: &EnvironmentTemplate, state: &RunState, timeout: Duration) -> Self {
        let mut build = template.base.clone();
        for commands in &state.run_commands {
            build = build.run_commands(commands);
        }
        for packages in &state.package_layers {
            build = template.install_packages(build, packages);
        }

        Self {
            build,
            files: state.code.clone(),
            workdir: template.workdir.clone(),
            test_cmd: template.test_cmd.clone(),
            timeout,
        }
    }
}

/// Result of one test run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxOutput {
    /// Process exit code. Zero means the tests passed.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Whether the run was cut off by the timeout.
    pub timed_out: bool,
}

impl SandboxOutput {
    /// A finished run with the given exit code and streams.
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            timed_out: false,
        }
    }

    /// A test run that hit the timeout, keeping whatever it printed.
    #[must_use]
    pub fn timed_out(timeout: Duration, stdout: String, stderr: String) -> Self {
        Self::cut_off("Test command", timeout, stdout, stderr)
    }

    /// An image build that hit the timeout.
    #[must_use]
    pub fn build_timed_out(timeout: Duration, stdout: String, stderr: String) -> Self {
        Self::cut_off("Image build", timeout, stdout, stderr)
    }

    fn cut_off(what: &str, timeout: Duration, stdout: String, mut stderr: String) -> Self {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!(
            "{} timed out after {} seconds",
            what,
            timeout.as_secs()
        ));
        Self {
            exit_code: TIMEOUT_EXIT_CODE,
            stdout,
            stderr,
            timed_out: true,
        }
    }

    /// Whether the tests passed.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ============================================================================
// Runner Trait
// ============================================================================

/// Backend that executes a test run.
///
/// # Errors
///
/// `run` returns an error only when the backend itself is unusable.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Build and run the request, returning exit code and captured output.
    async fn run(&self, request: &SandboxRequest) -> Result<SandboxOutput>;

    /// Release anything kept between runs. Called once when a loop ends.
    async fn finish(&self) {}
}

// ============================================================================
// File Materialization
// ============================================================================

/// Write `files` under `dir`, creating parent directories.
///
/// # Errors
///
/// Returns an error for absolute paths, paths escaping `dir`, or IO failures.
pub fn write_files(files: &BTreeMap<String, String>, dir: &Path) -> Result<()> {
    for (relative, content) in files {
        let target = contained_path(dir, relative)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, content)?;
    }
    Ok(())
}

fn contained_path(dir: &Path, relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if relative.is_empty() || escapes {
        return Err(DevloopError::Other(anyhow::anyhow!(
            "refusing to write '{}' outside the project directory",
            relative
        )));
    }
    Ok(dir.join(path))
}

// ============================================================================
// Process Capture
// ============================================================================

/// How long to wait for a killed process's pipes to drain.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Streams of a child process, kept even when it was cut off.
#[derive(Debug, Default)]
struct Captured {
    /// `None` when the process hit its timeout.
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

/// Wait for `child` up to `limit`, reading both pipes as it runs.
///
/// On expiry `on_timeout` runs first, then the child is killed and
/// whatever it had printed so far is returned.
async fn wait_captured<F>(mut child: Child, limit: Duration, on_timeout: F) -> Result<Captured>
where
    F: Future<Output = ()>,
{
    let stdout = child.stdout.take().map(|pipe| tokio::spawn(drain(pipe)));
    let stderr = child.stderr.take().map(|pipe| tokio::spawn(drain(pipe)));

    let exit_code = match tokio::time::timeout(limit, child.wait()).await {
        Ok(status) => Some(status?.code().unwrap_or(1)),
        Err(_) => {
            on_timeout.await;
            if let Err(e) = child.kill().await {
                debug!("Failed to kill timed out process: {}", e);
            }
            None
        }
    };

    Ok(Captured {
        exit_code,
        stdout: collect(stdout).await,
        stderr: collect(stderr).await,
    })
}

async fn drain<R: AsyncRead + Unpin>(mut pipe: R) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(e) = pipe.read_to_end(&mut buf).await {
        debug!("Stopped reading process output: {}", e);
    }
    buf
}

async fn collect(task: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(task) = task else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    }
}

// ============================================================================
// Docker Backend
// ============================================================================

/// Runs tests in a locally built Docker image.
///
/// Each run renders the layered build to a Dockerfile, builds it, and runs
/// the test command in a throwaway container with the generated files
/// copied into the workdir. Every build of one sandbox reuses the same tag,
/// so unchanged leading layers stay in the Docker build cache until
/// [`SandboxRunner::finish`] removes the image.
#[derive(Debug)]
pub struct DockerSandbox {
    docker_binary: String,
    build_timeout: Duration,
    tag: String,
    built: AtomicBool,
}

impl Default for DockerSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerSandbox {
    /// Use the `docker` binary from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            docker_binary: "docker".to_string(),
            build_timeout: Duration::from_secs(DEFAULT_BUILD_TIMEOUT_SECS),
            tag: format!("devloop-sandbox:{}", &id[..12]),
            built: AtomicBool::new(false),
        }
    }

    /// Build from sandbox settings.
    #[must_use]
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new()
            .with_docker_binary(&config.docker_binary)
            .with_build_timeout(Duration::from_secs(config.build_timeout_secs))
    }

    /// Use a different container CLI (for example `podman`).
    #[must_use]
    pub fn with_docker_binary(mut self, binary: &str) -> Self {
        self.docker_binary = binary.to_string();
        self
    }

    /// Set the wall-clock limit for one image build.
    #[must_use]
    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    /// Image tag shared by every build of this sandbox.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn resolve_binary(&self) -> Result<PathBuf> {
        which::which(&self.docker_binary).map_err(|e| {
            DevloopError::sandbox_unavailable(format!(
                "'{}' not found on PATH: {}",
                self.docker_binary, e
            ))
        })
    }

    async fn build_image(&self, docker: &Path, context: &Path) -> Result<SandboxOutput> {
        let child = Command::new(docker)
            .args(["build", "-t", self.tag.as_str()])
            .arg(context)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DevloopError::sandbox_unavailable(format!("docker build: {}", e)))?;
        self.built.store(true, Ordering::SeqCst);

        let captured = wait_captured(child, self.build_timeout, async {}).await?;
        match captured.exit_code {
            Some(code) => Ok(SandboxOutput::new(code, captured.stdout, captured.stderr)),
            None => {
                warn!("Image build exceeded {}s", self.build_timeout.as_secs());
                Ok(SandboxOutput::build_timed_out(
                    self.build_timeout,
                    captured.stdout,
                    captured.stderr,
                ))
            }
        }
    }

    async fn run_container(
        &self,
        docker: &Path,
        files_dir: &Path,
        container: &str,
        request: &SandboxRequest,
    ) -> Result<SandboxOutput> {
        let script = format!("cp -r {}/. . && {}", STAGING_DIR, request.test_cmd);
        let child = Command::new(docker)
            .args(["run", "--rm", "--name", container, "-v"])
            .arg(format!("{}:{}:ro", files_dir.display(), STAGING_DIR))
            .args([
                "-w",
                request.workdir.as_str(),
                self.tag.as_str(),
                "sh",
                "-c",
                script.as_str(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DevloopError::sandbox_unavailable(format!("docker run: {}", e)))?;

        let kill_container = async {
            warn!(
                "Test run exceeded {}s, killing container {}",
                request.timeout.as_secs(),
                container
            );
            let killed = Command::new(docker)
                .args(["kill", container])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = killed {
                debug!("docker kill {}: {}", container, e);
            }
        };

        let captured = wait_captured(child, request.timeout, kill_container).await?;
        Ok(match captured.exit_code {
            Some(code) => SandboxOutput::new(code, captured.stdout, captured.stderr),
            None => SandboxOutput::timed_out(request.timeout, captured.stdout, captured.stderr),
        })
    }
}

#[async_trait]
impl SandboxRunner for DockerSandbox {
    async fn run(&self, request: &SandboxRequest) -> Result<SandboxOutput> {
        let docker = self.resolve_binary()?;

        let workspace = tempfile::tempdir()?;
        let context = workspace.path().join("context");
        let files_dir = workspace.path().join("files");
        std::fs::create_dir_all(&context)?;
        std::fs::create_dir_all(&files_dir)?;
        std::fs::write(context.join("Dockerfile"), request.build.to_dockerfile())?;
        write_files(&request.files, &files_dir)?;

        info!("Building sandbox image ({} layers)", request.build.steps.len());
        let build = self.build_image(&docker, &context).await?;
        if !build.success() {
            warn!("Image build failed with exit code {}", build.exit_code);
            return Ok(build);
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let container = format!("devloop-{}", &id[..12]);
        debug!("Running '{}' in {}", request.test_cmd, container);
        self.run_container(&docker, &files_dir, &container, request)
            .await
    }

    async fn finish(&self) {
        if !self.built.swap(false, Ordering::SeqCst) {
            return;
        }
        let Ok(docker) = self.resolve_binary() else {
            return;
        };
        let removed = Command::new(&docker)
            .args(["image", "rm", "--force", self.tag.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;
        match removed {
            Ok(output) if output.status.success() => debug!("Removed image {}", self.tag),
            Ok(output) => debug!(
                "Could not remove image {}: {}",
                self.tag,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => debug!("Could not remove image {}: {}", self.tag, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{BuildStep, TemplateRegistry};
    use tempfile::TempDir;

    fn python() -> EnvironmentTemplate {
        TemplateRegistry::builtin().get("python").unwrap().clone()
    }

    #[test]
    fn test_request_layers_commands_then_packages() {
        let template = python();
        let mut state = RunState::new("p", vec!["flask".into()]);
        state.push_package_layer(vec!["requests".into()]);
        state.push_command_layer(vec!["apt-get install -y libpq-dev".into()]);

        let request = SandboxRequest::from_state(&template, &state, Duration::from_secs(120));
        let base_len = template.base.steps.len();
        assert_eq!(&request.build.steps[..base_len], &template.base.steps[..]);
        assert_eq!(
            request.build.steps[base_len..],
            vec![
                BuildStep::Run(vec!["apt-get install -y libpq-dev".into()]),
                BuildStep::Run(vec!["python -m pip install flask".into()]),
                BuildStep::Run(vec!["python -m pip install requests".into()]),
            ]
        );
        assert_eq!(request.workdir, "/app");
        assert_eq!(request.test_cmd, "python -m pytest . -x");
    }

    #[test]
    fn test_request_skips_empty_initial_layer() {
        let template = python();
        let state = RunState::new("p", vec![]);
        let request = SandboxRequest::from_state(&template, &state, Duration::from_secs(1));
        assert_eq!(request.build, template.base);
    }

    #[test]
    fn test_write_files_nested() {
        let dir = TempDir::new().unwrap();
        let mut files = BTreeMap::new();
        files.insert("app/main.py".to_string(), "print('hi')".to_string());
        files.insert("test/test_main.py".to_string(), "def test(): pass".to_string());

        write_files(&files, dir.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app/main.py")).unwrap(),
            "print('hi')"
        );
        assert!(dir.path().join("test/test_main.py").exists());
    }

    #[test]
    fn test_write_files_rejects_escape() {
        let dir = TempDir::new().unwrap();
        for bad in ["../evil.py", "/etc/passwd"] {
            let mut files = BTreeMap::new();
            files.insert(bad.to_string(), String::new());
            assert!(write_files(&files, dir.path()).is_err(), "accepted {}", bad);
        }
    }

    #[test]
    fn test_timed_out_output() {
        let output = SandboxOutput::timed_out(Duration::from_secs(120), String::new(), String::new());
        assert_eq!(output.exit_code, TIMEOUT_EXIT_CODE);
        assert!(output.timed_out);
        assert!(!output.success());
        assert_eq!(output.stderr, "Test command timed out after 120 seconds");
    }

    #[test]
    fn test_timed_out_output_keeps_captured_streams() {
        let output = SandboxOutput::build_timed_out(
            Duration::from_secs(600),
            "Step 1/4 : FROM python:3.12".into(),
            "fetching index".into(),
        );
        assert_eq!(output.stdout, "Step 1/4 : FROM python:3.12");
        assert_eq!(
            output.stderr,
            "fetching index\nImage build timed out after 600 seconds"
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let sandbox = DockerSandbox::new().with_docker_binary("devloop-no-such-container-cli");
        let state = RunState::new("p", vec![]);
        let request = SandboxRequest::from_state(&python(), &state, Duration::from_secs(1));
        let err = sandbox.run(&request).await.unwrap_err();
        assert!(matches!(err, DevloopError::SandboxUnavailable { .. }));
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn test_sandboxes_get_distinct_tags() {
        let a = DockerSandbox::new();
        let b = DockerSandbox::new();
        assert!(a.tag().starts_with("devloop-sandbox:"));
        assert_ne!(a.tag(), b.tag());
    }

    #[test]
    fn test_from_config_reads_build_timeout() {
        let config = SandboxConfig {
            build_timeout_secs: 42,
            ..SandboxConfig::default()
        };
        let sandbox = DockerSandbox::from_config(&config);
        assert_eq!(sandbox.build_timeout, Duration::from_secs(42));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Write a stand-in container CLI that logs its arguments and runs
        /// `build` / `run` bodies given as shell snippets.
        fn fake_docker(dir: &Path, build: &str, run: &str) -> (PathBuf, PathBuf) {
            let log = dir.join("calls.log");
            let script = dir.join("docker");
            std::fs::write(
                &script,
                format!(
                    "#!/bin/sh\necho \"$*\" >> '{}'\ncase \"$1\" in\n  build) {} ;;\n  run) {} ;;\n  *) exit 0 ;;\nesac\n",
                    log.display(),
                    build,
                    run
                ),
            )
            .unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            (script, log)
        }

        fn calls(log: &Path) -> Vec<String> {
            std::fs::read_to_string(log)
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        fn request(timeout: Duration) -> SandboxRequest {
            let state = RunState::new("p", vec![]);
            SandboxRequest::from_state(&python(), &state, timeout)
        }

        #[tokio::test]
        async fn test_wait_captured_keeps_partial_output() {
            let child = Command::new("sh")
                .args(["-c", "echo partial; echo warming >&2; exec sleep 30"])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .unwrap();

            let captured = wait_captured(child, Duration::from_millis(300), async {})
                .await
                .unwrap();
            assert_eq!(captured.exit_code, None);
            assert_eq!(captured.stdout, "partial\n");
            assert_eq!(captured.stderr, "warming\n");
        }

        #[tokio::test]
        async fn test_wait_captured_reports_exit_code() {
            let child = Command::new("sh")
                .args(["-c", "echo done; exit 3"])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .unwrap();

            let captured = wait_captured(child, Duration::from_secs(10), async {})
                .await
                .unwrap();
            assert_eq!(captured.exit_code, Some(3));
            assert_eq!(captured.stdout, "done\n");
        }

        #[tokio::test]
        async fn test_hanging_build_is_a_failed_run() {
            let dir = TempDir::new().unwrap();
            let (docker, log) = fake_docker(
                dir.path(),
                "echo 'Step 1/4 : FROM python:3.12'; exec sleep 30",
                "exit 0",
            );
            let sandbox = DockerSandbox::new()
                .with_docker_binary(docker.to_str().unwrap())
                .with_build_timeout(Duration::from_millis(300));

            let output = sandbox.run(&request(Duration::from_secs(10))).await.unwrap();
            assert_eq!(output.exit_code, TIMEOUT_EXIT_CODE);
            assert!(output.timed_out);
            assert!(output.stdout.contains("Step 1/4"));
            assert!(output.stderr.contains("Image build timed out"));

            let calls = calls(&log);
            assert_eq!(calls.len(), 1);
            assert!(calls[0].starts_with("build"));
        }

        #[tokio::test]
        async fn test_hanging_tests_keep_partial_output_and_kill_container() {
            let dir = TempDir::new().unwrap();
            let (docker, log) = fake_docker(
                dir.path(),
                "exit 0",
                "echo '2 passed'; echo 'collecting test_slow' >&2; exec sleep 30",
            );
            let sandbox = DockerSandbox::new().with_docker_binary(docker.to_str().unwrap());

            let output = sandbox
                .run(&request(Duration::from_millis(300)))
                .await
                .unwrap();
            assert_eq!(output.exit_code, TIMEOUT_EXIT_CODE);
            assert!(output.timed_out);
            assert_eq!(output.stdout, "2 passed\n");
            assert!(output.stderr.starts_with("collecting test_slow\n"));
            assert!(output.stderr.ends_with("Test command timed out after 0 seconds"));

            let calls = calls(&log);
            assert!(calls[1].starts_with("run"));
            assert!(calls[2].starts_with("kill devloop-"));
        }

        #[tokio::test]
        async fn test_builds_share_one_tag_removed_once_at_finish() {
            let dir = TempDir::new().unwrap();
            let (docker, log) = fake_docker(dir.path(), "exit 0", "echo '1 passed'; exit 0");
            let sandbox = DockerSandbox::new().with_docker_binary(docker.to_str().unwrap());

            for _ in 0..2 {
                let output = sandbox.run(&request(Duration::from_secs(10))).await.unwrap();
                assert!(output.success());
                assert_eq!(output.stdout, "1 passed\n");
            }
            sandbox.finish().await;
            sandbox.finish().await;

            let calls = calls(&log);
            let builds: Vec<_> = calls.iter().filter(|c| c.starts_with("build")).collect();
            assert_eq!(builds.len(), 2);
            assert!(builds.iter().all(|c| c.contains(sandbox.tag())));
            assert_eq!(
                calls.last().map(String::as_str),
                Some(format!("image rm --force {}", sandbox.tag()).as_str())
            );
            assert_eq!(calls.iter().filter(|c| c.starts_with("image")).count(), 1);
        }

        #[tokio::test]
        async fn test_finish_without_build_runs_nothing() {
            let dir = TempDir::new().unwrap();
            let (docker, log) = fake_docker(dir.path(), "exit 0", "exit 0");
            let sandbox = DockerSandbox::new().with_docker_binary(docker.to_str().unwrap());
            sandbox.finish().await;
            assert!(calls(&log).is_empty());
        }
    }
}
