//! Heartbeat: the fixed-cadence tick that drives the backlog,
//! reclaims stuck `blocked` cards, and performs startup reconciliation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::broadcaster::Broadcaster;
use crate::card::{AgentStatus, Card, CardStore, Project};
use crate::event::Event;
use crate::notifier::Notifier;
use crate::orchestrator::Orchestrator;
use crate::worktree::WorktreeManager;
use crate::{ForemanError, Result};

/// Cards left `blocked` longer than this are reclaimed back to the backlog.
pub const BLOCKED_RETRY: Duration = Duration::from_secs(30 * 60);

/// Default scheduled tick cadence; `ForemanConfig::general.heartbeat_interval_seconds`
/// overrides this for a running deployment.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10 * 60);

const MAX_TITLE_CHARS: usize = 80;

/// Drives the Orchestrator from the backlog: one tick selects and spawns at
/// most one agent per eligible project, reclaims stuck cards, and reports a
/// summary event. Owns no state beyond a monotonic tick counter; everything
/// else is read fresh from the `CardStore` on each call.
pub struct Heartbeat {
    orchestrator: Arc<Orchestrator>,
    card_store: Arc<dyn CardStore>,
    broadcaster: Arc<Broadcaster>,
    worktree_manager: Arc<WorktreeManager>,
    notifier: Arc<dyn Notifier>,
    tick_count: AtomicU64,
}

impl Heartbeat {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        card_store: Arc<dyn CardStore>,
        broadcaster: Arc<Broadcaster>,
        worktree_manager: Arc<WorktreeManager>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            orchestrator,
            card_store,
            broadcaster,
            worktree_manager,
            notifier,
            tick_count: AtomicU64::new(0),
        }
    }

    /// Move any card left `running`/`blocked` by a prior process instance
    /// back to `backlog`, then best-effort sweep `.worktrees/` for
    /// directories with no corresponding live run. Call once, before the
    /// first scheduled tick. Never rehydrates an agent run: resuming an
    /// interrupted run is explicitly out of scope.
    pub async fn reconcile_on_startup(&self) {
        let projects = match self.card_store.active_projects() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "startup reconciliation: failed to list active projects");
                return;
            }
        };

        let mut reclaimed = 0u32;
        for project in &projects {
            let board = match self.card_store.get_board(&project.project_id) {
                Ok(b) => b,
                Err(e) => {
                    warn!(project_id = %project.project_id, error = %e, "startup reconciliation: failed to read board");
                    continue;
                }
            };
            for card in board
                .in_progress
                .iter()
                .filter(|c| matches!(c.agent_status, AgentStatus::Running | AgentStatus::Blocked))
            {
                match self.card_store.skip_to_back(&card.card_id) {
                    Ok(_) => reclaimed += 1,
                    Err(e) => warn!(card_id = %card.card_id, error = %e, "startup reconciliation: failed to reclaim card"),
                }
            }
        }

        if reclaimed > 0 {
            info!(reclaimed, "startup reconciliation: moved stale cards back to backlog");
        }

        self.sweep_orphaned_worktrees().await;
    }

    /// Remove `.worktrees/<id>` directories with no corresponding live
    /// AgentRun. Disk hygiene only, best-effort: failures are logged and
    /// swallowed.
    async fn sweep_orphaned_worktrees(&self) {
        let live: HashSet<String> = self
            .orchestrator
            .running_agents()
            .await
            .into_iter()
            .filter(|a| !a.state.is_terminal())
            .map(|a| a.card_id)
            .collect();

        let worktrees_dir = self.worktree_manager.base_dir().join(".worktrees");
        let mut entries = match tokio::fs::read_dir(&worktrees_dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(_) => break,
            };
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let prefix = entry.file_name().to_string_lossy().into_owned();
            if live.iter().any(|card_id| card_id.starts_with(&prefix)) {
                continue;
            }
            warn!(dir = %prefix, "startup reconciliation: removing orphaned worktree");
            let _ = tokio::fs::remove_dir_all(entry.path()).await;
        }
    }

    /// Run one tick of the scheduling algorithm.
    pub async fn tick(&self) {
        let tick = self.tick_count.fetch_add(1, Ordering::SeqCst) + 1;

        let projects = match self.card_store.active_projects() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "heartbeat: failed to list active projects");
                return;
            }
        };

        let running_agents = self.orchestrator.running_agents().await;
        let mut running_count = running_agents.iter().filter(|a| !a.state.is_terminal()).count() as u32;
        let running_projects: HashSet<String> = running_agents
            .into_iter()
            .filter(|a| !a.state.is_terminal())
            .map(|a| a.project_id)
            .collect();

        let max_concurrent = self.orchestrator.max_concurrent_agents();
        let mut spawned_this_tick = 0u32;

        for project in &projects {
            self.reclaim_blocked_cards(project).await;

            if running_projects.contains(&project.project_id) {
                continue;
            }
            if running_count >= max_concurrent {
                continue;
            }

            let next = match self.card_store.get_next_card(&project.project_id) {
                Ok(Some(card)) => card,
                Ok(None) => continue,
                Err(e) => {
                    self.emit_heartbeat_error(project, e.to_string());
                    continue;
                }
            };

            self.spawn_next(project, &next, &mut running_count, &mut spawned_this_tick)
                .await;
        }

        self.broadcaster.publish(Event::HeartbeatTick {
            tick,
            agents: running_count,
        });
        if spawned_this_tick == 0 {
            self.broadcaster.publish(Event::HeartbeatIdle);
        }
    }

    async fn spawn_next(
        &self,
        project: &Project,
        card: &Card,
        running_count: &mut u32,
        spawned_this_tick: &mut u32,
    ) {
        let agent_key = match self.orchestrator.select_agent_key(card.agent_kind.as_deref()) {
            Some(key) => key,
            None => {
                self.emit_heartbeat_error(project, "no adapter available to spawn".to_string());
                return;
            }
        };

        match self.orchestrator.spawn_agent(&card.card_id, &agent_key).await {
            Ok(_) => {
                *running_count += 1;
                *spawned_this_tick += 1;
                self.broadcaster.publish(Event::HeartbeatSpawned {
                    card_id: card.card_id.clone(),
                    project_id: project.project_id.clone(),
                });
                self.notifier.send(&format!(
                    "agent {agent_key} spawned for card {} ({})",
                    card.card_id, card.title
                ));
                info!(card_id = %card.card_id, project_id = %project.project_id, agent = %agent_key, "heartbeat spawned agent");
            }
            Err(e) => {
                warn!(card_id = %card.card_id, error = %e, "heartbeat: spawn failed");
                self.emit_heartbeat_error(project, e.to_string());
            }
        }
    }

    fn emit_heartbeat_error(&self, project: &Project, error: String) {
        self.broadcaster.publish(Event::HeartbeatError {
            project_id: project.project_id.clone(),
            error,
        });
    }

    async fn reclaim_blocked_cards(&self, project: &Project) {
        let board = match self.card_store.get_board(&project.project_id) {
            Ok(b) => b,
            Err(e) => {
                warn!(project_id = %project.project_id, error = %e, "heartbeat: failed to read board for reclaim");
                return;
            }
        };

        let cutoff = Utc::now() - chrono::Duration::from_std(BLOCKED_RETRY).expect("constant duration fits");
        for card in board
            .in_progress
            .iter()
            .filter(|c| c.agent_status == AgentStatus::Blocked && c.updated_at < cutoff)
        {
            match self.card_store.skip_to_back(&card.card_id) {
                Ok(_) => {
                    self.broadcaster.publish(Event::HeartbeatRetry {
                        card_id: card.card_id.clone(),
                        project_id: project.project_id.clone(),
                    });
                }
                Err(e) => warn!(card_id = %card.card_id, error = %e, "heartbeat: failed to reclaim blocked card"),
            }
        }
    }

    /// Create a backlog card from free text (task-brief intake).
    /// Derives a title from the first sentence, capped at 80 characters with
    /// an ellipsis; selects a project by substring match of its name against
    /// `text`, falling back to the first active project.
    pub async fn submit_task_brief(
        &self,
        text: &str,
        project_id: Option<&str>,
        priority: Option<i32>,
        immediate: bool,
    ) -> Result<Card> {
        let projects = self
            .card_store
            .active_projects()
            .map_err(|e| ForemanError::Admission(e.to_string()))?;
        if projects.is_empty() {
            return Err(ForemanError::Admission(
                "no active projects to file a card against".to_string(),
            ));
        }

        let project = match project_id {
            Some(id) => projects
                .iter()
                .find(|p| p.project_id == id)
                .ok_or_else(|| ForemanError::Admission(format!("unknown project '{id}'")))?,
            None => {
                let lower = text.to_lowercase();
                projects
                    .iter()
                    .find(|p| lower.contains(&p.name.to_lowercase()))
                    .unwrap_or(&projects[0])
            }
        };

        let title = derive_title(text);
        let card = self
            .card_store
            .create_card(&project.project_id, &title, text, priority.unwrap_or(0))
            .map_err(|e| ForemanError::Admission(e.to_string()))?;

        self.broadcaster.publish(Event::HeartbeatCardCreated {
            card_id: card.card_id.clone(),
            project_id: project.project_id.clone(),
        });
        let _ = self.card_store.log_audit(
            "card",
            &card.card_id,
            "heartbeat.cardCreated",
            serde_json::json!({ "title": card.title }),
        );

        if immediate {
            self.tick().await;
        }

        Ok(card)
    }
}

fn derive_title(text: &str) -> String {
    let first_sentence = text
        .split(['.', '!', '?', '\n'])
        .next()
        .unwrap_or(text)
        .trim();

    let char_count = first_sentence.chars().count();
    if char_count <= MAX_TITLE_CHARS {
        first_sentence.to_string()
    } else {
        let truncated: String = first_sentence.chars().take(MAX_TITLE_CHARS - 1).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{
        AdapterRegistry, AdapterTier, AgentAdapter, BuiltCommand, CapabilityConfidence, CapabilityEntry,
        CapabilitySet, DetectResult, DetectStatus, SpawnRequest,
    };
    use crate::card::{CardColumn, InMemoryCardStore, ProjectStatus};
    use crate::config::ForemanConfig;
    use crate::verifier::VerifierConfig;

    struct EchoAdapter;

    impl AgentAdapter for EchoAdapter {
        fn key(&self) -> &'static str {
            "echo"
        }
        fn tier(&self) -> AdapterTier {
            AdapterTier::Tier1
        }
        fn detect(&self) -> DetectResult {
            DetectResult {
                status: DetectStatus::Ready,
                binary_path: None,
                version: None,
                supported_flags: vec![],
                confidence: CapabilityConfidence::Verified,
                error: None,
            }
        }
        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet {
                json_stream: CapabilityEntry::unknown(),
                plain_text: CapabilityEntry::unknown(),
                force_edit_mode: CapabilityEntry::unknown(),
                sandbox_controls: CapabilityEntry::unknown(),
                approval_controls: CapabilityEntry::unknown(),
                session_resume: CapabilityEntry::unknown(),
                emits_usage: CapabilityEntry::unknown(),
            }
        }
        fn build_command(
            &self,
            req: &SpawnRequest,
        ) -> std::result::Result<BuiltCommand, crate::adapter::AdapterError> {
            Ok(BuiltCommand {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), "exit 0".to_string()],
                env: vec![],
                cwd: req.worktree_path.clone(),
            })
        }
    }

    async fn setup_repo() -> (tempfile::TempDir, std::path::PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        crate::git_exec::run_git(&["init"], &root).await.unwrap();
        crate::git_exec::run_git(&["config", "user.email", "test@foreman.dev"], &root).await.unwrap();
        crate::git_exec::run_git(&["config", "user.name", "Foreman Test"], &root).await.unwrap();
        tokio::fs::write(root.join("README.md"), "# x\n").await.unwrap();
        crate::git_exec::run_git(&["add", "."], &root).await.unwrap();
        crate::git_exec::run_git(&["commit", "-m", "init"], &root).await.unwrap();
        (tmp, root)
    }

    fn project(id: &str) -> Project {
        Project {
            project_id: id.to_string(),
            name: id.to_string(),
            status: ProjectStatus::Active,
            agent_timeout_minutes: None,
            max_concurrent_agents: None,
        }
    }

    async fn heartbeat_with(root: std::path::PathBuf, store: Arc<InMemoryCardStore>) -> Heartbeat {
        let broadcaster = Arc::new(Broadcaster::new());
        let worktree_manager = Arc::new(WorktreeManager::new(root));
        let adapters = AdapterRegistry::new(vec![Arc::new(EchoAdapter)]);
        let notifier: Arc<dyn crate::notifier::Notifier> = Arc::new(crate::notifier::NoopNotifier);
        let orchestrator = Arc::new(Orchestrator::new(
            ForemanConfig::default(),
            Arc::clone(&store) as Arc<dyn CardStore>,
            Arc::clone(&broadcaster),
            Arc::clone(&worktree_manager),
            adapters,
            VerifierConfig::new(None, None, Some("exit 0".to_string())),
            Arc::clone(&notifier),
        ));
        Heartbeat::new(orchestrator, store, broadcaster, worktree_manager, notifier)
    }

    #[test]
    fn derive_title_caps_at_80_chars_with_ellipsis() {
        let long = "a".repeat(120);
        let title = derive_title(&long);
        assert_eq!(title.chars().count(), 80);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn derive_title_uses_first_sentence() {
        let title = derive_title("Fix the login bug. It happens on retry.");
        assert_eq!(title, "Fix the login bug");
    }

    #[derive(Default, Clone)]
    struct CapturingNotifier {
        sent: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl crate::notifier::Notifier for CapturingNotifier {
        fn send(&self, text: &str) {
            self.sent.lock().unwrap().push(text.to_string());
        }
    }

    #[tokio::test]
    async fn tick_notifies_operator_on_spawn() {
        let (_tmp, root) = setup_repo().await;
        let store = Arc::new(InMemoryCardStore::new());
        store.insert_project(project("p1"));
        store.create_card("p1", "Add feature", "desc", 0).unwrap();

        let broadcaster = Arc::new(Broadcaster::new());
        let worktree_manager = Arc::new(WorktreeManager::new(root));
        let adapters = AdapterRegistry::new(vec![Arc::new(EchoAdapter)]);
        let notifier = CapturingNotifier::default();
        let notifier_arc: Arc<dyn crate::notifier::Notifier> = Arc::new(notifier.clone());
        let orchestrator = Arc::new(Orchestrator::new(
            ForemanConfig::default(),
            Arc::clone(&store) as Arc<dyn CardStore>,
            Arc::clone(&broadcaster),
            Arc::clone(&worktree_manager),
            adapters,
            VerifierConfig::new(None, None, Some("exit 0".to_string())),
            Arc::clone(&notifier_arc),
        ));
        let hb = Heartbeat::new(orchestrator, store, broadcaster, worktree_manager, notifier_arc);

        hb.tick().await;

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("spawned"));
    }

    #[tokio::test]
    async fn tick_spawns_next_backlog_card() {
        let (_tmp, root) = setup_repo().await;
        let store = Arc::new(InMemoryCardStore::new());
        store.insert_project(project("p1"));
        let card = store.create_card("p1", "Add feature", "desc", 0).unwrap();

        let hb = heartbeat_with(root, Arc::clone(&store)).await;
        hb.tick().await;

        let updated = store.get_card(&card.card_id).unwrap();
        assert_eq!(updated.column, CardColumn::InProgress);
    }

    #[tokio::test]
    async fn tick_skips_project_with_running_agent() {
        let (_tmp, root) = setup_repo().await;
        let store = Arc::new(InMemoryCardStore::new());
        store.insert_project(project("p1"));
        let card1 = store.create_card("p1", "First", "desc", 0).unwrap();
        let card2 = store.create_card("p1", "Second", "desc", 1).unwrap();

        let hb = heartbeat_with(root, Arc::clone(&store)).await;
        hb.tick().await;
        hb.tick().await;

        let first = store.get_card(&card1.card_id).unwrap();
        let second = store.get_card(&card2.card_id).unwrap();
        assert_eq!(first.column, CardColumn::InProgress);
        assert_eq!(second.column, CardColumn::Backlog);
    }

    #[tokio::test]
    async fn reconcile_on_startup_moves_stale_cards_to_backlog() {
        let (_tmp, root) = setup_repo().await;
        let store = Arc::new(InMemoryCardStore::new());
        store.insert_project(project("p1"));
        let card = store.create_card("p1", "Stuck", "desc", 0).unwrap();
        store.start_work(&card.card_id, "claude").unwrap();
        store
            .update_agent_status(&card.card_id, AgentStatus::Blocked, Some("stuck"))
            .unwrap();

        let hb = heartbeat_with(root, Arc::clone(&store)).await;
        hb.reconcile_on_startup().await;

        let reset = store.get_card(&card.card_id).unwrap();
        assert_eq!(reset.column, CardColumn::Backlog);
        assert_eq!(reset.agent_status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn submit_task_brief_creates_backlog_card_and_ticks_immediately() {
        let (_tmp, root) = setup_repo().await;
        let store = Arc::new(InMemoryCardStore::new());
        store.insert_project(project("checkout-service"));

        let hb = heartbeat_with(root, Arc::clone(&store)).await;
        let card = hb
            .submit_task_brief("Fix a bug in checkout-service. It crashes on submit.", None, None, true)
            .await
            .unwrap();

        assert_eq!(card.title, "Fix a bug in checkout-service");
        let stored = store.get_card(&card.card_id).unwrap();
        assert_eq!(stored.column, CardColumn::InProgress);
    }

    #[tokio::test]
    async fn submit_task_brief_without_active_project_errors() {
        let (_tmp, root) = setup_repo().await;
        let store = Arc::new(InMemoryCardStore::new());
        let hb = heartbeat_with(root, store).await;
        let err = hb.submit_task_brief("Do something", None, None, false).await.unwrap_err();
        assert!(matches!(err, ForemanError::Admission(_)));
    }
}
