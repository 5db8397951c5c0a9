mod doctor;
mod seed;
mod serve;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use foreman_core::config::ForemanConfig;

#[derive(Parser)]
#[command(name = "foreman", version, about = "Autonomous coding-agent supervisor")]
struct Cli {
    /// Repository root the orchestrator operates against.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Path to foreman.toml. Defaults to `<repo>/foreman.toml`, falling back
    /// to built-in defaults if absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that git and configured agent adapters are ready to run.
    Doctor {
        /// Print the report as JSON instead of a human-readable summary.
        #[arg(long)]
        json: bool,
    },
    /// Run the orchestrator, heartbeat, and synthesizer loop.
    Serve {
        /// JSON file of initial projects/cards to load into the standalone
        /// in-memory board before the first heartbeat tick.
        #[arg(long)]
        seed: Option<PathBuf>,

        /// File a task brief against the board immediately at startup, as
        /// `Heartbeat::submit_task_brief` would.
        #[arg(long)]
        submit: Option<String>,
    },
}

fn load_config(cli: &Cli) -> ForemanConfig {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.repo.join("foreman.toml"));
    if path.exists() {
        match ForemanConfig::load(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to load config, using defaults");
                ForemanConfig::default()
            }
        }
    } else {
        ForemanConfig::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    foreman_core::init_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli);

    match &cli.command {
        Command::Doctor { json } => {
            doctor::run(&cli.repo, &config, *json);
        }
        Command::Serve { seed, submit } => {
            serve::run(serve::ServeArgs {
                repo: cli.repo.clone(),
                config,
                seed_file: seed.clone(),
                submit: submit.clone(),
            })
            .await?;
        }
    }

    Ok(())
}
