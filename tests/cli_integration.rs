//! Integration tests for the devloop CLI

use assert_cmd::cargo;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a Command for the devloop binary
fn devloop() -> Command {
    let mut cmd = Command::new(cargo::cargo_bin!("devloop"));
    cmd.env_remove("OPENAI_API_KEY").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help() {
    devloop()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("repair it until its tests pass"));
}

#[test]
fn test_version() {
    devloop()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_run_help_lists_flags() {
    devloop()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--prompt"))
        .stdout(predicate::str::contains("--template"))
        .stdout(predicate::str::contains("--max-iterations"));
}

#[test]
fn test_templates_lists_builtins() {
    devloop()
        .arg("templates")
        .assert()
        .success()
        .stdout(predicate::str::contains("python"))
        .stdout(predicate::str::contains("rust"))
        .stdout(predicate::str::contains("react"))
        .stdout(predicate::str::contains("python -m pytest . -x"))
        .stdout(predicate::str::contains("yarn run jest --bail"));
}

#[test]
fn test_unknown_template_fails_before_any_call() {
    let temp = TempDir::new().unwrap();
    let output = temp.path().join("out");

    devloop()
        .current_dir(temp.path())
        .args(["run", "--prompt", "hello world", "--template", "cobol", "--output"])
        .arg(&output)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Unknown template name 'cobol'"))
        .stderr(predicate::str::contains("python, react, rust"));

    assert!(!output.exists());
}

#[test]
fn test_missing_config_file() {
    let temp = TempDir::new().unwrap();

    devloop()
        .current_dir(temp.path())
        .args(["--config", "does-not-exist.toml", "run", "--template", "python"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("cannot read config"));
}

#[test]
fn test_invalid_config_value() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join("devloop.toml"),
        "max_concurrent_generations = 0\n",
    )
    .unwrap();

    devloop()
        .current_dir(temp.path())
        .args(["run", "--template", "python"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("max_concurrent_generations"));
}

#[test]
fn test_unknown_subcommand() {
    devloop()
        .arg("deploy")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}
