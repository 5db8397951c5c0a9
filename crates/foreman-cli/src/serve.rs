//! `foreman serve`: run the Orchestrator/Heartbeat/Synthesizer loop in one
//! process against the in-memory `CardStore`, printing every broadcast
//! event as a line of JSON until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use foreman_core::adapter::AdapterRegistry;
use foreman_core::broadcaster::Broadcaster;
use foreman_core::card::{CardStore, InMemoryCardStore};
use foreman_core::config::ForemanConfig;
use foreman_core::heartbeat::Heartbeat;
use foreman_core::notifier::{LoggingNotifier, Notifier};
use foreman_core::orchestrator::Orchestrator;
use foreman_core::synthesizer::Synthesizer;
use foreman_core::worktree::WorktreeManager;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use crate::seed;

pub struct ServeArgs {
    pub repo: PathBuf,
    pub config: ForemanConfig,
    pub seed_file: Option<PathBuf>,
    pub submit: Option<String>,
}

pub async fn run(args: ServeArgs) -> Result<()> {
    let card_store = Arc::new(InMemoryCardStore::new());

    if let Some(path) = &args.seed_file {
        let seed_data = seed::load(path)?;
        seed::apply(&card_store, &seed_data)?;
        info!(
            projects = seed_data.projects.len(),
            cards = seed_data.cards.len(),
            "board seeded"
        );
    }

    let broadcaster = Arc::new(Broadcaster::new());
    let worktree_manager = Arc::new(WorktreeManager::new(args.repo.clone()));
    let adapters = AdapterRegistry::from_config(&args.config.adapters);
    let verifier_config = args.config.verifier.to_verifier_config();
    let notifier: Arc<dyn Notifier> = Arc::new(LoggingNotifier);

    let orchestrator = Arc::new(Orchestrator::new(
        args.config.clone(),
        card_store.clone() as Arc<dyn CardStore>,
        broadcaster.clone(),
        worktree_manager.clone(),
        adapters,
        verifier_config.clone(),
        notifier.clone(),
    ));

    let heartbeat = Arc::new(Heartbeat::new(
        orchestrator.clone(),
        card_store.clone() as Arc<dyn CardStore>,
        broadcaster.clone(),
        worktree_manager.clone(),
        notifier,
    ));

    let synthesizer = Arc::new(Synthesizer::new(
        card_store.clone() as Arc<dyn CardStore>,
        broadcaster.clone(),
        worktree_manager.clone(),
        verifier_config,
    ));

    heartbeat.reconcile_on_startup().await;

    if let Some(text) = &args.submit {
        match heartbeat.submit_task_brief(text, None, None, true).await {
            Ok(card) => info!(card_id = %card.card_id, title = %card.title, "task brief filed"),
            Err(e) => error!(error = %e, "failed to submit task brief"),
        }
    }

    spawn_event_printer(&broadcaster);

    let heartbeat_interval = Duration::from_secs(args.config.general.heartbeat_interval_seconds);
    let synthesizer_interval = Duration::from_secs(args.config.general.synthesizer_interval_seconds);

    let heartbeat_task = {
        let heartbeat = heartbeat.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            loop {
                ticker.tick().await;
                heartbeat.tick().await;
            }
        })
    };

    let synthesizer_task = {
        let synthesizer = synthesizer.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(synthesizer_interval);
            loop {
                ticker.tick().await;
                synthesizer.run_once().await;
            }
        })
    };

    info!(
        max_concurrent_agents = orchestrator.max_concurrent_agents(),
        "foreman serve started, type 'help' for commands or press Ctrl-C to stop"
    );

    let commands_task = spawn_command_reader(orchestrator.clone(), heartbeat.clone());

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
        }
        _ = commands_task => {
            info!("stdin closed or quit requested");
        }
    }

    info!("shutdown requested, draining running agents");
    heartbeat_task.abort();
    synthesizer_task.abort();
    orchestrator.shutdown_all().await;

    Ok(())
}

/// Drive `status` / `stop <card-id>` / `brief <text>` from stdin against
/// this process's own orchestrator and heartbeat, since there is no
/// out-of-process transport for a second `foreman` invocation to reach a
/// running `serve` — HTTP/WebSocket routing is an external collaborator's
/// job, not this core's. Returns when stdin closes or `quit`/`exit` is read.
fn spawn_command_reader(
    orchestrator: Arc<Orchestrator>,
    heartbeat: Arc<Heartbeat>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "failed to read command from stdin");
                    return;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let cmd = parts.next().unwrap_or("");
            let rest = parts.next().unwrap_or("").trim();

            match cmd {
                "quit" | "exit" => return,
                "help" => print_help(),
                "status" => {
                    let agents = orchestrator.running_agents().await;
                    match serde_json::to_string_pretty(&agents) {
                        Ok(json) => println!("{json}"),
                        Err(e) => error!(error = %e, "failed to serialize running agents"),
                    }
                }
                "stop" => {
                    if rest.is_empty() {
                        println!("usage: stop <card-id>");
                        continue;
                    }
                    match orchestrator.stop_agent(rest).await {
                        Ok(()) => info!(card_id = rest, "stop requested"),
                        Err(e) => error!(error = %e, card_id = rest, "stop failed"),
                    }
                }
                "brief" => {
                    if rest.is_empty() {
                        println!("usage: brief <text>");
                        continue;
                    }
                    match heartbeat.submit_task_brief(rest, None, None, true).await {
                        Ok(card) => info!(card_id = %card.card_id, title = %card.title, "task brief filed"),
                        Err(e) => error!(error = %e, "failed to submit task brief"),
                    }
                }
                other => println!("unknown command '{other}', type 'help' for the list"),
            }
        }
    })
}

fn print_help() {
    println!("commands:");
    println!("  status          print the running agents snapshot as JSON");
    println!("  stop <card-id>  cancel the agent run for a card");
    println!("  brief <text>    file a task brief and tick immediately");
    println!("  quit | exit     shut down foreman serve");
}

/// Print every published event as one JSON line to stdout, per the wire
/// envelope shape consumers subscribe to. Runs until the channel closes.
fn spawn_event_printer(broadcaster: &Arc<Broadcaster>) {
    let mut rx = broadcaster.subscribe_all();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => error!(error = %e, "failed to serialize event"),
            }
        }
    });
}
