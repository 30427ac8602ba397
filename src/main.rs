//! devloop - iterative code synthesis and repair
//!
//! Generates a project from a prompt, runs its tests in a container, and
//! keeps repairing it until they pass.

use clap::{Parser, Subcommand};
use colored::Colorize;
use devloop::llm::create_llm_client;
use devloop::{
    DevloopConfig, DevloopError, DockerSandbox, LlmOracle, LoopController, OutputWriter,
    RunOutcome, RunRequest, TemplateRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Exit status when the iteration budget ran out without passing tests.
const GAVE_UP_EXIT_CODE: i32 = 4;

#[derive(Parser)]
#[command(name = "devloop")]
#[command(version)]
#[command(about = "Generate a project from a prompt and repair it until its tests pass", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to ./devloop.toml, then the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a project and loop until its tests pass
    Run {
        /// What to build
        #[arg(short, long, default_value = "Create a Tic-Tac-Toe game.")]
        prompt: String,

        /// Environment template (see `devloop templates`)
        #[arg(short, long, default_value = "react")]
        template: String,

        /// Directory receiving one snapshot per iteration
        #[arg(short, long, default_value = "output")]
        output: PathBuf,

        /// Model identifier (overrides the config file)
        #[arg(short, long)]
        model: Option<String>,

        /// Repair rounds before giving up (0 = unbounded)
        #[arg(long)]
        max_iterations: Option<u32>,
    },

    /// List the available environment templates
    Templates,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "devloop=debug,info"
    } else {
        "devloop=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match execute(cli).await {
        Ok(code) => {
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Err(err) => {
            eprintln!("{} {:#}", "Error:".red().bold(), err);
            let code = err
                .downcast_ref::<DevloopError>()
                .map_or(1, DevloopError::exit_code);
            std::process::exit(code);
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<i32> {
    let registry = TemplateRegistry::builtin();

    match cli.command {
        Commands::Templates => {
            println!("{}", "Templates:".cyan().bold());
            for template in registry.iter() {
                println!(
                    "  {:<8} {:<6} {}",
                    template.name.bold(),
                    template.package_manager.to_string(),
                    template.test_cmd.dimmed()
                );
            }
            Ok(0)
        }

        Commands::Run {
            prompt,
            template,
            output,
            model,
            max_iterations,
        } => {
            // Fail on a bad template before touching config or network
            registry.get(&template)?;

            let project_dir = std::env::current_dir()?;
            let mut config = DevloopConfig::resolve(cli.config.as_deref(), &project_dir)?;
            if let Some(ref model) = model {
                config = config.with_model(model);
            }
            if let Some(max) = max_iterations {
                config = config.with_max_iterations(max);
            }
            config.validate()?;

            let client = create_llm_client(&config)?;
            let oracle = Arc::new(LlmOracle::new(client).with_retry(config.retry));
            let sandbox = Arc::new(DockerSandbox::from_config(&config.sandbox));
            let mut writer = OutputWriter::new(output);

            println!(
                "{} {} ({}, template {})",
                "devloop".cyan().bold(),
                writer.run_id(),
                config.model,
                template
            );

            let controller = LoopController::new(registry, oracle, sandbox, config);
            let summary = controller
                .run(&RunRequest::new(prompt, template), &mut writer)
                .await?;

            println!(
                "\n{} {}",
                "Result:".cyan().bold(),
                summary.outcome
            );
            println!("   Files in {}", writer.run_dir().display());

            match summary.outcome {
                RunOutcome::Succeeded { .. } => Ok(0),
                RunOutcome::GaveUp { .. } => Ok(GAVE_UP_EXIT_CODE),
            }
        }
    }
}
