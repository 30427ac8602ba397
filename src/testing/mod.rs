//! Testing infrastructure for devloop.
//!
//! Mocks for every collaborator of the loop controller, so the whole
//! state machine can be exercised without a model or a container runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! use devloop::testing::{MockOracle, MockSandbox, RecordingSink};
//!
//! let oracle = MockOracle::new().with_file_paths(&["app/main.py"]);
//! let sandbox = MockSandbox::new().with_failure(1, "AssertionError");
//! let mut sink = RecordingSink::new();
//! ```

pub mod mocks;

pub use mocks::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::SnapshotSink;
    use crate::oracle::{DebugPlan, Oracle};
    use crate::sandbox::{SandboxOutput, SandboxRequest, SandboxRunner};
    use crate::state::RunState;
    use crate::template::{PackageManager, TemplateRegistry};
    use std::time::Duration;

    fn request() -> SandboxRequest {
        let template = TemplateRegistry::builtin().get("python").unwrap().clone();
        SandboxRequest::from_state(&template, &RunState::new("p", vec![]), Duration::from_secs(1))
    }

    // =========================================================================
    // MockOracle Tests
    // =========================================================================

    #[tokio::test]
    async fn test_mock_oracle_defaults() {
        let oracle = MockOracle::new();
        assert_eq!(
            oracle.file_paths("p", "plan").await.unwrap(),
            vec!["app/main.py", "test/test_main.py"]
        );
        assert_eq!(
            oracle.generate_code("p", "plan", "app/main.py").await.unwrap(),
            "# app/main.py\n"
        );
        assert!(oracle
            .plan_repair("p", PackageManager::Pip, &[], "d")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            oracle.calls(),
            vec!["file_paths", "generate_code", "plan_repair"]
        );
    }

    #[tokio::test]
    async fn test_mock_oracle_patch_queue() {
        let oracle = MockOracle::new().with_patch("app/main.py", "fixed");
        let first = oracle
            .patch_file("p", "app/main.py", "broken", &[], "d")
            .await
            .unwrap();
        let second = oracle
            .patch_file("p", "app/main.py", "broken", &[], "d")
            .await
            .unwrap();
        assert_eq!(first, "fixed");
        assert_eq!(second, "broken");
        assert_eq!(oracle.call_count("patch_file"), 2);
    }

    #[tokio::test]
    async fn test_mock_oracle_repair_plans_in_order() {
        let oracle = MockOracle::new()
            .with_repair_plan(DebugPlan {
                install_packages: vec!["requests".into()],
                ..DebugPlan::default()
            })
            .with_repair_plan(DebugPlan {
                run_commands: vec!["apt-get update".into()],
                ..DebugPlan::default()
            });
        let known = vec!["app/main.py".to_string()];
        let first = oracle
            .plan_repair("p", PackageManager::Pip, &known, "d")
            .await
            .unwrap();
        let second = oracle
            .plan_repair("p", PackageManager::Pip, &known, "d")
            .await
            .unwrap();
        assert_eq!(first.install_packages, vec!["requests"]);
        assert_eq!(second.run_commands, vec!["apt-get update"]);
        assert_eq!(oracle.repair_file_sets(), vec![known.clone(), known]);
    }

    // =========================================================================
    // MockSandbox Tests
    // =========================================================================

    #[tokio::test]
    async fn test_mock_sandbox_queue_then_fallback() {
        let sandbox = MockSandbox::new().with_failure(1, "boom");
        let first = sandbox.run(&request()).await.unwrap();
        let second = sandbox.run(&request()).await.unwrap();
        assert_eq!(first.exit_code, 1);
        assert_eq!(first.stderr, "boom");
        assert!(second.success());
        assert_eq!(sandbox.run_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_sandbox_fallback_override() {
        let sandbox = MockSandbox::new().with_fallback(SandboxOutput::new(2, "", "always"));
        assert_eq!(sandbox.run(&request()).await.unwrap().exit_code, 2);
    }

    #[tokio::test]
    async fn test_mock_sandbox_unavailable() {
        let sandbox = MockSandbox::new().unavailable("no docker");
        let err = sandbox.run(&request()).await.unwrap_err();
        assert_eq!(err.exit_code(), 6);
        assert_eq!(sandbox.run_count(), 0);
    }

    // =========================================================================
    // RecordingSink Tests
    // =========================================================================

    #[test]
    fn test_recording_sink() {
        let mut sink = RecordingSink::new();
        let state = RunState::new("p", vec!["flask".into()]);
        sink.record(0, &state).unwrap();
        sink.record(1, &state).unwrap();
        assert_eq!(sink.iterations(), vec![0, 1]);
        assert_eq!(sink.snapshots[1].state, state);
    }
}
