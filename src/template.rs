//! Environment templates: how to build, install packages into, and test a
//! generated project for one ecosystem.
//!
//! Templates are static data. The [`TemplateRegistry`] is built once and
//! handed to the controller, so concurrent runs with different templates
//! never share mutable state.
//!
//! # Example
//!
//! ```
//! use devloop::template::TemplateRegistry;
//!
//! let registry = TemplateRegistry::builtin();
//! let python = registry.get("python").unwrap();
//! assert_eq!(python.test_cmd, "python -m pytest . -x");
//! assert_eq!(python.package_manager.to_string(), "pip");
//!
//! assert!(registry.get("cobol").is_err());
//! ```

use crate::error::{DevloopError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One instruction of an image build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStep {
    /// Shell commands run at build time, one layer per batch.
    Run(Vec<String>),
    /// Change the working directory for later steps.
    Workdir(String),
}

/// A layered image build description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Base image reference.
    pub base_image: String,
    /// Ordered build steps on top of the base image.
    pub steps: Vec<BuildStep>,
}

impl BuildSpec {
    /// Start from a base image.
    #[must_use]
    pub fn from_image(base_image: &str) -> Self {
        Self {
            base_image: base_image.to_string(),
            steps: Vec::new(),
        }
    }

    /// Append a batch of build-time commands. Empty batches are ignored.
    #[must_use]
    pub fn run_commands<S: AsRef<str>>(mut self, commands: &[S]) -> Self {
        if !commands.is_empty() {
            self.steps.push(BuildStep::Run(
                commands.iter().map(|c| c.as_ref().to_string()).collect(),
            ));
        }
        self
    }

    /// Append a working directory change.
    #[must_use]
    pub fn workdir(mut self, dir: &str) -> Self {
        self.steps.push(BuildStep::Workdir(dir.to_string()));
        self
    }

    /// Render as a Dockerfile.
    ///
    /// Each `Run` batch becomes one `RUN` instruction so that earlier
    /// batches stay cached when later ones are appended.
    #[must_use]
    pub fn to_dockerfile(&self) -> String {
        let mut out = format!("FROM {}\n", self.base_image);
        for step in &self.steps {
            match step {
                BuildStep::Run(commands) => {
                    out.push_str("RUN ");
                    out.push_str(&commands.join(" && \\\n    "));
                    out.push('\n');
                }
                BuildStep::Workdir(dir) => {
                    out.push_str(&format!("WORKDIR {}\n", dir));
                }
            }
        }
        out
    }
}

/// Package manager used by a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    /// Python packages via pip.
    Pip,
    /// Rust crates via `cargo add`.
    Cargo,
    /// JavaScript packages via yarn.
    Yarn,
}

impl PackageManager {
    /// Command that installs `packages`, or `None` when there is nothing to do.
    #[must_use]
    pub fn install_command(&self, packages: &[String]) -> Option<String> {
        if packages.is_empty() {
            return None;
        }
        let list = packages.join(" ");
        Some(match self {
            PackageManager::Pip => format!("python -m pip install {}", list),
            PackageManager::Cargo => format!("cargo add {}", list),
            PackageManager::Yarn => format!("yarn add {}", list),
        })
    }

    /// Extend `build` with a layer installing `packages`.
    #[must_use]
    pub fn install(&self, build: BuildSpec, packages: &[String]) -> BuildSpec {
        match self.install_command(packages) {
            Some(command) => build.run_commands(&[command]),
            None => build,
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageManager::Pip => write!(f, "pip"),
            PackageManager::Cargo => write!(f, "cargo"),
            PackageManager::Yarn => write!(f, "yarn"),
        }
    }
}

/// Static description of one ecosystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentTemplate {
    /// Registry key.
    pub name: String,
    /// Base image build.
    pub base: BuildSpec,
    /// Command that runs the project's tests.
    pub test_cmd: String,
    /// Directory the generated files are mounted into.
    pub workdir: String,
    /// Package manager for dependency layers.
    pub package_manager: PackageManager,
    /// Guidance appended to the user's request.
    pub prompt: String,
}

impl EnvironmentTemplate {
    /// Extend `build` with a package layer using this template's manager.
    #[must_use]
    pub fn install_packages(&self, build: BuildSpec, packages: &[String]) -> BuildSpec {
        self.package_manager.install(build, packages)
    }

    /// The user's request augmented with the template guidance.
    #[must_use]
    pub fn augment_prompt(&self, request: &str) -> String {
        format!("{}\n{}", request, self.prompt)
    }
}

/// Read-only table of environment templates keyed by name.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, EnvironmentTemplate>,
}

impl TemplateRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `python`, `rust` and `react` templates.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new()
            .with_template(python_template())
            .with_template(rust_template())
            .with_template(react_template())
    }

    /// Add or replace a template.
    #[must_use]
    pub fn with_template(mut self, template: EnvironmentTemplate) -> Self {
        self.templates.insert(template.name.clone(), template);
        self
    }

    /// Look up a template by name.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTemplate` listing the valid names.
    pub fn get(&self, name: &str) -> Result<&EnvironmentTemplate> {
        self.templates
            .get(name)
            .ok_or_else(|| DevloopError::UnknownTemplate {
                name: name.to_string(),
                available: self.names(),
            })
    }

    /// Registered template names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }

    /// Iterate over all templates in name order.
    pub fn iter(&self) -> impl Iterator<Item = &EnvironmentTemplate> {
        self.templates.values()
    }
}

fn python_template() -> EnvironmentTemplate {
    EnvironmentTemplate {
        name: "python".to_string(),
        base: BuildSpec::from_image("python:3.11-slim").run_commands(&["python -m pip install pytest"]),
        test_cmd: "python -m pytest . -x".to_string(),
        workdir: "/app".to_string(),
        package_manager: PackageManager::Pip,
        prompt: "The project must be in Python, and have tests.

Assume you have the following file structure:
    - setup.py
    - test/
    - app/

You just have to populate app/ and test/. "
            .to_string(),
    }
}

fn rust_template() -> EnvironmentTemplate {
    EnvironmentTemplate {
        name: "rust".to_string(),
        base: BuildSpec::from_image("rust:slim")
            .run_commands(&["apt-get update", "apt-get install -y build-essential"])
            .run_commands(&["cargo new app --bin"])
            .workdir("/app"),
        test_cmd: "cargo test".to_string(),
        workdir: "/app".to_string(),
        package_manager: PackageManager::Cargo,
        prompt: "The project must be in Rust, and have tests.

Assume you have the following file structure:
    - Cargo.toml
    - src/
    - tests/

You just have to populate src/ and tests/. DO NOT generate Cargo.toml."
            .to_string(),
    }
}

fn react_template() -> EnvironmentTemplate {
    EnvironmentTemplate {
        name: "react".to_string(),
        base: BuildSpec::from_image("node:slim")
            .run_commands(&["yarn create vite app --template react"])
            .workdir("/app")
            .run_commands(&[
                "yarn add --dev jest @testing-library/react @testing-library/jest-dom jest-environment-jsdom",
                "yarn add --dev babel-jest @babel/core @babel/preset-env @babel/preset-react",
            ])
            .run_commands(&[
                r#"echo '{ "presets": [ "@babel/preset-env", ["@babel/preset-react", {runtime: "automatic"}] ] }' > babel.config.json"#,
                r#"echo '{ "testEnvironment": "jsdom" }' > jest.config.json"#,
            ]),
        test_cmd: "yarn run jest --bail".to_string(),
        workdir: "/app".to_string(),
        package_manager: PackageManager::Yarn,
        prompt: "The project must be in React, and have tests.

Assume you have a new create-react-app project already set up with the following files:
    - index.html
    - package.json
    - src/

You just have to populate src/. Please use the .jsx extension for files with JSX."
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names() {
        let registry = TemplateRegistry::builtin();
        assert_eq!(registry.names(), vec!["python", "react", "rust"]);
    }

    #[test]
    fn test_unknown_template_error() {
        let registry = TemplateRegistry::builtin();
        let err = registry.get("haskell").unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("python, react, rust"));
    }

    #[test]
    fn test_install_commands_per_manager() {
        let pkgs = vec!["requests".to_string(), "flask".to_string()];
        assert_eq!(
            PackageManager::Pip.install_command(&pkgs).unwrap(),
            "python -m pip install requests flask"
        );
        assert_eq!(
            PackageManager::Cargo.install_command(&pkgs).unwrap(),
            "cargo add requests flask"
        );
        assert_eq!(
            PackageManager::Yarn.install_command(&pkgs).unwrap(),
            "yarn add requests flask"
        );
        assert!(PackageManager::Pip.install_command(&[]).is_none());
    }

    #[test]
    fn test_install_is_pure_and_appends_one_layer() {
        let template = TemplateRegistry::builtin().get("python").unwrap().clone();
        let before = template.base.clone();
        let after = template.install_packages(before.clone(), &["requests".to_string()]);
        assert_eq!(after.steps.len(), before.steps.len() + 1);
        assert_eq!(&after.steps[..before.steps.len()], &before.steps[..]);
        assert_eq!(template.base, before);
    }

    #[test]
    fn test_install_empty_is_noop() {
        let base = BuildSpec::from_image("python:3.11-slim");
        assert_eq!(PackageManager::Pip.install(base.clone(), &[]), base);
    }

    #[test]
    fn test_dockerfile_rendering() {
        let spec = BuildSpec::from_image("rust:slim")
            .run_commands(&["cargo new app --bin"])
            .workdir("/app")
            .run_commands(&["apt-get update", "apt-get install -y pkg-config"]);
        let dockerfile = spec.to_dockerfile();
        assert_eq!(
            dockerfile,
            "FROM rust:slim\nRUN cargo new app --bin\nWORKDIR /app\nRUN apt-get update && \\\n    apt-get install -y pkg-config\n"
        );
    }

    #[test]
    fn test_augment_prompt() {
        let registry = TemplateRegistry::builtin();
        let rust = registry.get("rust").unwrap();
        let prompt = rust.augment_prompt("Build a calculator");
        assert!(prompt.starts_with("Build a calculator\n"));
        assert!(prompt.contains("DO NOT generate Cargo.toml"));
    }
}
