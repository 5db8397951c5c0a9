//! Orchestrator: in-memory agent-run registry and the Gate-0
//! admission sequence.
//!
//! Public operations are serialized by a single-slot `tokio::sync::Mutex`
//! guarding the registry; the critical sections are short (admission checks
//! plus a map insert), matching the host's own preference for a narrow lock
//! scope over a lock-free registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::adapter::{AdapterRegistry, AgentAdapter, SpawnRequest};
use crate::agent_supervisor::{self, AgentRunConfig, AgentRunHandle, RunState};
use crate::broadcaster::Broadcaster;
use crate::card::{Card, CardStore, Project};
use crate::config::ForemanConfig;
use crate::event::Event;
use crate::notifier::Notifier;
use crate::prompt_assembler::{self, PromptContext};
use crate::supervisor::AgentCommand;
use crate::verifier::VerifierConfig;
use crate::worktree::WorktreeManager;
use crate::{ForemanError, Result};

/// How long `shutdown_all` waits for a cancelled run to drain before giving
/// up on it and persisting its context snapshot instead.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

/// A Gate-0 capability check, evaluated in order against the adapter
/// resolved for a spawn request. The list is finite and documented here;
/// each failure contributes its own reason string to the rejection.
pub enum CapabilityCheck {
    /// The resolved adapter must report itself as available (binary found,
    /// tier policy satisfied) via its own `detect()` probe.
    AdapterDetected,
}

impl CapabilityCheck {
    fn evaluate(&self, adapter: &dyn AgentAdapter) -> Option<String> {
        match self {
            CapabilityCheck::AdapterDetected => {
                let detect = adapter.detect();
                if detect.status.is_available() {
                    None
                } else {
                    Some(format!(
                        "adapter '{}' is not available: {}",
                        adapter.key(),
                        detect.status.label()
                    ))
                }
            }
        }
    }
}

/// Redacted snapshot of a registry entry, safe to serialize: no process or
/// task handles, just the observable state of a run.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRunSnapshot {
    pub card_id: String,
    pub project_id: String,
    pub agent_kind: String,
    pub branch: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
}

struct RegistryEntry {
    handle: Arc<AgentRunHandle>,
    join: Option<tokio::task::JoinHandle<RunState>>,
    project_id: String,
}

/// In-memory `agents: map<cardId, AgentRun>` plus the Gate-0 admission
/// sequence and the small set of operations the rest of the system (CLI,
/// Heartbeat) drives it through.
pub struct Orchestrator {
    config: ForemanConfig,
    card_store: Arc<dyn CardStore>,
    broadcaster: Arc<Broadcaster>,
    worktree_manager: Arc<WorktreeManager>,
    adapters: AdapterRegistry,
    verifier_config: VerifierConfig,
    capability_checks: Vec<CapabilityCheck>,
    registry: Mutex<HashMap<String, RegistryEntry>>,
    notifier: Arc<dyn Notifier>,
}

impl Orchestrator {
    pub fn new(
        config: ForemanConfig,
        card_store: Arc<dyn CardStore>,
        broadcaster: Arc<Broadcaster>,
        worktree_manager: Arc<WorktreeManager>,
        adapters: AdapterRegistry,
        verifier_config: VerifierConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            card_store,
            broadcaster,
            worktree_manager,
            adapters,
            verifier_config,
            capability_checks: vec![CapabilityCheck::AdapterDetected],
            registry: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    /// Spawn admission sequence, atomic within the registry mutex.
    /// On failure after `CardStore::start_work` has already run, the card's
    /// state and any created worktree are rolled back before the error is
    /// returned.
    pub async fn spawn_agent(&self, card_id: &str, agent_key: &str) -> Result<Arc<AgentRunHandle>> {
        let mut registry = self.registry.lock().await;

        // Gate-0: global concurrency.
        let running = registry.values().filter(|e| !e.handle.state().is_terminal()).count();
        let max_concurrent = self.config.general.max_concurrent_agents as usize;
        if running >= max_concurrent {
            return Err(ForemanError::Admission(format!(
                "global concurrency limit reached ({running}/{max_concurrent})"
            )));
        }

        let card = self
            .card_store
            .get_card(card_id)
            .map_err(|e| ForemanError::Admission(format!("card lookup failed: {e}")))?;
        let project = self
            .card_store
            .get_project(&card.project_id)
            .map_err(|e| ForemanError::Admission(format!("project lookup failed: {e}")))?;

        // Gate-0: per-project concurrency.
        let project_running = registry
            .values()
            .filter(|e| e.project_id == project.project_id && !e.handle.state().is_terminal())
            .count();
        if project_running >= project.max_concurrent_agents() as usize {
            return Err(ForemanError::Admission(format!(
                "project '{}' already has {project_running} running agent(s)",
                project.project_id
            )));
        }

        // Gate-0: card not already live.
        if let Some(entry) = registry.get(card_id) {
            if !entry.handle.state().is_terminal() {
                return Err(ForemanError::Admission(format!(
                    "card '{card_id}' already has a live agent run"
                )));
            }
        }

        // Gate-0: capability checks.
        let adapter = self
            .adapters
            .resolve(agent_key, self.config.general.allow_experimental_adapters)
            .map_err(|e| ForemanError::Admission(e.to_string()))?;
        for check in &self.capability_checks {
            if let Some(reason) = check.evaluate(adapter.as_ref()) {
                return Err(ForemanError::Admission(reason));
            }
        }

        // Step 2: derive branch name.
        let branch = WorktreeManager::branch_name(agent_key, &card.title, &card.card_id);

        // Step 3: derive timeout.
        let timeout_minutes = project.agent_timeout_minutes.unwrap_or(30) as u64;
        let timeout = Duration::from_secs(timeout_minutes * 60);

        // Step 4: create worktree. No side effects yet if this fails.
        let worktree = self
            .worktree_manager
            .create(&card.card_id, &branch, "HEAD")
            .await
            .map_err(ForemanError::Worktree)?;

        // Step 5: CardStore.startWork.
        if let Err(e) = self.card_store.start_work(card_id, agent_key) {
            self.worktree_manager.remove(&worktree.path).await;
            return Err(ForemanError::Admission(format!("start_work failed: {e}")));
        }

        // Step 6: build the agent command, insert into the registry, emit
        // agent.spawned, write the audit row. Anything failing past this
        // point rolls the card and worktree back.
        let task_prompt = self.assemble_prompt(&card, &project);
        let spawn_req = SpawnRequest {
            task_prompt,
            worktree_path: worktree.path.clone(),
            timeout_seconds: timeout.as_secs(),
            allow_network: true,
            force_edit: false,
            output_json_stream: true,
            unsafe_mode: self.config.general.unsafe_mode,
            supported_flags: vec![],
        };

        let built = match adapter.build_command(&spawn_req) {
            Ok(b) => b,
            Err(e) => {
                let _ = self.card_store.skip_to_back(card_id);
                self.worktree_manager.remove(&worktree.path).await;
                return Err(ForemanError::Adapter(e));
            }
        };

        let command = AgentCommand {
            program: built.program,
            args: built.args,
            env: built.env,
            cwd: built.cwd,
            env_remove: vec![],
        };

        let run_config = AgentRunConfig {
            card_id: card.card_id.clone(),
            project_id: project.project_id.clone(),
            agent_kind: agent_key.to_string(),
            branch: branch.clone(),
            worktree_path: worktree.path.clone(),
            timeout,
            command,
            adapter: Arc::clone(&adapter),
            verifier_config: self.verifier_config.clone(),
            card_store: Arc::clone(&self.card_store),
            broadcaster: Arc::clone(&self.broadcaster),
            worktree_manager: Arc::clone(&self.worktree_manager),
            notifier: Arc::clone(&self.notifier),
        };

        // Step 7: launch AgentSupervisor as a detached task.
        let (handle, join) = agent_supervisor::run(run_config);

        self.broadcaster.publish(Event::AgentSpawned {
            card_id: card_id.to_string(),
            project_id: project.project_id.clone(),
            agent: agent_key.to_string(),
        });
        let _ = self.card_store.log_audit(
            "card",
            card_id,
            "agent.spawned",
            serde_json::json!({ "agent": agent_key, "branch": branch }),
        );

        registry.insert(
            card_id.to_string(),
            RegistryEntry {
                handle: Arc::clone(&handle),
                join: Some(join),
                project_id: project.project_id,
            },
        );

        info!(card_id, agent_key, branch, "agent spawned");
        Ok(handle)
    }

    /// Build the agent's task prompt: project name, card title and
    /// description, any saved context snapshot, and titles of sibling cards
    /// already in progress on the same board. Board lookup failures are
    /// tolerated — every query this assembler depends on is allowed to come
    /// back empty rather than block a spawn.
    fn assemble_prompt(&self, card: &Card, project: &Project) -> String {
        let sibling_cards = self
            .card_store
            .get_board(&project.project_id)
            .map(|board| {
                board
                    .in_progress
                    .iter()
                    .filter(|c| c.card_id != card.card_id)
                    .map(|c| c.title.clone())
                    .collect()
            })
            .unwrap_or_default();

        let ctx = PromptContext {
            project_name: project.name.clone(),
            card_title: card.title.clone(),
            card_description: card.description.clone(),
            card_context_snapshot: card.context_snapshot.clone(),
            sibling_cards,
            ..Default::default()
        };
        prompt_assembler::assemble(&ctx).text
    }

    /// Invoke the AgentSupervisor cancel path for a running card. The entry
    /// stays in the registry (with `state=idle` once `drive()` observes the
    /// cancellation) until it drains on its own.
    pub async fn stop_agent(&self, card_id: &str) -> Result<()> {
        let registry = self.registry.lock().await;
        let entry = registry
            .get(card_id)
            .ok_or_else(|| ForemanError::Admission(format!("no agent run found for card '{card_id}'")))?;
        entry.handle.cancel();
        Ok(())
    }

    /// Snapshot of every known run, process/task handles redacted.
    pub async fn running_agents(&self) -> Vec<AgentRunSnapshot> {
        let registry = self.registry.lock().await;
        registry
            .values()
            .map(|e| AgentRunSnapshot {
                card_id: e.handle.card_id.clone(),
                project_id: e.handle.project_id.clone(),
                agent_kind: e.handle.agent_kind.clone(),
                branch: e.handle.branch.clone(),
                state: e.handle.state(),
                started_at: e.handle.started_at,
            })
            .collect()
    }

    /// Last `limit` lines from a card's log ring; empty if the card is
    /// unknown to this registry.
    pub async fn agent_logs(&self, card_id: &str, limit: usize) -> Vec<String> {
        let registry = self.registry.lock().await;
        registry.get(card_id).map(|e| e.handle.logs(limit)).unwrap_or_default()
    }

    /// Global concurrency cap this registry enforces.
    pub fn max_concurrent_agents(&self) -> u32 {
        self.config.general.max_concurrent_agents
    }

    /// Pick an adapter key to spawn a card with: `preferred` (the card's
    /// last-used adapter, if any and still known) if set, otherwise the
    /// first adapter this registry's capability probe reports available,
    /// falling back to the first known Tier-1 adapter so a spawn attempt
    /// still surfaces a concrete Gate-0 rejection reason instead of silently
    /// skipping the card.
    pub fn select_agent_key(&self, preferred: Option<&str>) -> Option<String> {
        if let Some(key) = preferred {
            if self.adapters.known_keys().contains(&key) {
                return Some(key.to_string());
            }
        }
        let allow_experimental = self.config.general.allow_experimental_adapters;
        self.adapters
            .available(allow_experimental)
            .first()
            .map(|a| a.key().to_string())
            .or_else(|| self.adapters.tier1().first().map(|a| a.key().to_string()))
    }

    /// Cancel every live run, wait up to 30s for each to drain, and persist
    /// a context snapshot for any survivor so its work remains resumable.
    pub async fn shutdown_all(&self) {
        let mut draining = Vec::new();
        {
            let mut registry = self.registry.lock().await;
            for (card_id, entry) in registry.iter_mut() {
                if !entry.handle.state().is_terminal() {
                    entry.handle.cancel();
                }
                if let Some(join) = entry.join.take() {
                    draining.push((card_id.clone(), Arc::clone(&entry.handle), join));
                }
            }
        }

        for (card_id, handle, join) in draining {
            if tokio::time::timeout(SHUTDOWN_DRAIN, join).await.is_err() {
                warn!(card_id, "agent did not drain within shutdown window, snapshotting and abandoning");
                let snapshot = agent_supervisor::context_snapshot(&handle.branch, &handle.logs(500));
                let _ = self.card_store.save_context(&card_id, &snapshot, None);
            }
        }
    }
}
