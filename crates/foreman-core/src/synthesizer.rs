//! Synthesizer: the merge-gate heartbeat track.
//!
//! Runs on its own cadence, independent of [`crate::heartbeat`]. For every
//! card whose `verificationStatus` is `branch_verified`, the agent's branch
//! is merged into a shared integration branch inside a dedicated worktree,
//! re-verified there, and on success the card is promoted to `done`. Grounded
//! in the host's `merge.rs` dry-run/merge/conflict-parse sequence, adapted to
//! drive `CardStore`/`WorktreeManager`/`Verifier` instead of standing alone.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::broadcaster::Broadcaster;
use crate::card::{AgentStatus, CardStore, VerificationStatus};
use crate::event::{Event, Gate};
use crate::git_exec::{run_git, GitExecError};
use crate::verifier::{self, VerifierConfig};
use crate::worktree::WorktreeManager;

/// Default name of the shared integration branch, per project repo.
pub const DEFAULT_INTEGRATION_BRANCH: &str = "integration";

/// Conflicting file surfaced by a failed merge attempt.
#[derive(Debug, Clone)]
pub struct ConflictFile {
    pub path: String,
    pub conflict_type: &'static str,
}

pub struct Synthesizer {
    card_store: Arc<dyn CardStore>,
    broadcaster: Arc<Broadcaster>,
    worktree_manager: Arc<WorktreeManager>,
    verifier_config: VerifierConfig,
    integration_branch: String,
}

impl Synthesizer {
    pub fn new(
        card_store: Arc<dyn CardStore>,
        broadcaster: Arc<Broadcaster>,
        worktree_manager: Arc<WorktreeManager>,
        verifier_config: VerifierConfig,
    ) -> Self {
        Self {
            card_store,
            broadcaster,
            worktree_manager,
            verifier_config,
            integration_branch: DEFAULT_INTEGRATION_BRANCH.to_string(),
        }
    }

    pub fn with_integration_branch(mut self, name: impl Into<String>) -> Self {
        self.integration_branch = name.into();
        self
    }

    /// One pass across every active project's board, merging every
    /// `branch_verified` card it finds. Errors enumerating a project or
    /// reading its board are logged and skipped; they never abort the pass.
    pub async fn run_once(&self) {
        let projects = match self.card_store.active_projects() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "synthesizer: failed to enumerate active projects");
                return;
            }
        };

        for project in projects {
            let board = match self.card_store.get_board(&project.project_id) {
                Ok(b) => b,
                Err(e) => {
                    warn!(project_id = %project.project_id, error = %e, "synthesizer: failed to read board");
                    continue;
                }
            };

            let ready: Vec<_> = board
                .in_progress
                .into_iter()
                .filter(|c| c.verification_status == VerificationStatus::BranchVerified)
                .collect();

            for card in ready {
                self.synthesize_card(&project.project_id, &card.card_id).await;
            }
        }
    }

    async fn synthesize_card(&self, project_id: &str, card_id: &str) {
        let card = match self.card_store.get_card(card_id) {
            Ok(c) => c,
            Err(e) => {
                warn!(card_id, error = %e, "synthesizer: card vanished mid-pass");
                return;
            }
        };

        let Some(agent_kind) = card.agent_kind.as_deref() else {
            warn!(card_id, "synthesizer: branch_verified card has no recorded agent_kind, skipping");
            return;
        };
        let branch = WorktreeManager::branch_name(agent_kind, &card.title, &card.card_id);

        // Reuses the card's own worktree slot: by the time a card reaches
        // `branch_verified` its agent worktree has already been removed by
        // the AgentSupervisor's cleanup invariant, and `create` force-removes
        // any stale prefix collision regardless.
        let merge_worktree_path = self.worktree_manager.worktree_path(&card.card_id);

        // `create` creates the integration branch from HEAD the first time it
        // is needed and attaches to it (rather than failing) on every
        // subsequent call, since by then it already exists.
        let merge_wt = match self
            .worktree_manager
            .create(&card.card_id, &self.integration_branch, "HEAD")
            .await
        {
            Ok(wt) => wt,
            Err(e) => {
                warn!(card_id, error = %e, "synthesizer: failed to create integration worktree");
                return;
            }
        };

        self.broadcaster.publish(Event::VerificationStarted {
            card_id: card_id.to_string(),
            project_id: project_id.to_string(),
            gate: Gate::Merge,
        });

        let merge_outcome = merge_branch(&merge_wt.path, &branch).await;

        match merge_outcome {
            Err(e) => {
                warn!(card_id, branch, error = %e, "synthesizer: merge attempt errored");
                self.fail_merge(card_id, project_id, &format!("merge error: {e}")).await;
            }
            Ok(MergeOutcome::Conflicted(conflicts)) => {
                let summary = conflicts
                    .iter()
                    .map(|c| format!("{} ({})", c.path, c.conflict_type))
                    .collect::<Vec<_>>()
                    .join(", ");
                info!(card_id, branch, conflicts = %summary, "synthesizer: merge conflicted");
                self.fail_merge(card_id, project_id, &format!("merge conflict: {summary}")).await;
            }
            Ok(MergeOutcome::Merged) => {
                let result = verifier::verify(&merge_wt.path, &self.verifier_config).await;
                if !result.passed {
                    let output = format!(
                        "type-check:\n{}\nlint:\n{}\ntest:\n{}",
                        result.type_check_output, result.lint_output, result.test_output
                    );
                    warn!(card_id, "synthesizer: post-merge verification failed");
                    let _ = self.card_store.update_card_verification(
                        card_id,
                        VerificationStatus::MergeFailed,
                        Some(&output),
                    );
                    self.fail_merge(card_id, project_id, "post-merge verification failed").await;
                } else {
                    match run_git(&["push", "origin", &self.integration_branch], &merge_wt.path).await {
                        Ok(_) => {
                            let _ = self.card_store.update_card_verification(
                                card_id,
                                VerificationStatus::MergeVerified,
                                None,
                            );
                            self.broadcaster.publish(Event::VerificationPassed {
                                card_id: card_id.to_string(),
                                project_id: project_id.to_string(),
                                gate: Gate::Merge,
                            });
                            info!(card_id, "synthesizer: card promoted to done");
                        }
                        Err(e) => {
                            warn!(card_id, error = %e, "synthesizer: integration branch push failed");
                            self.fail_merge(card_id, project_id, &format!("integration push failed: {e}")).await;
                        }
                    }
                }
            }
        }

        self.worktree_manager.remove(&merge_worktree_path).await;
    }

    async fn fail_merge(&self, card_id: &str, project_id: &str, reason: &str) {
        let _ = self
            .card_store
            .update_card_verification(card_id, VerificationStatus::MergeFailed, Some(reason));
        let _ = self
            .card_store
            .update_agent_status(card_id, AgentStatus::Blocked, Some(reason));
        self.broadcaster.publish(Event::VerificationFailed {
            card_id: card_id.to_string(),
            project_id: project_id.to_string(),
            gate: Gate::Merge,
            output: reason.to_string(),
        });
    }
}

enum MergeOutcome {
    Merged,
    Conflicted(Vec<ConflictFile>),
}

async fn merge_branch(worktree_dir: &Path, source_branch: &str) -> Result<MergeOutcome, GitExecError> {
    let merge_result = run_git(
        &[
            "merge",
            "--no-ff",
            "-m",
            &format!("foreman: merge {source_branch}"),
            source_branch,
        ],
        worktree_dir,
    )
    .await;

    match merge_result {
        Ok(_) => Ok(MergeOutcome::Merged),
        Err(GitExecError::NonZeroExit { stdout, stderr, .. }) => {
            let combined = format!("{stdout}\n{stderr}");
            let conflicts = parse_conflicts(&combined, worktree_dir).await;
            let _ = run_git(&["merge", "--abort"], worktree_dir).await;
            Ok(MergeOutcome::Conflicted(conflicts))
        }
        Err(e) => Err(e),
    }
}

async fn parse_conflicts(merge_output: &str, worktree_dir: &Path) -> Vec<ConflictFile> {
    let mut conflicts = Vec::new();

    for line in merge_output.lines() {
        if let Some(path) = line.strip_prefix("CONFLICT (content): Merge conflict in ") {
            conflicts.push(ConflictFile {
                path: path.trim().to_string(),
                conflict_type: "content",
            });
        } else if line.starts_with("CONFLICT (rename/delete)") {
            if let Some(path) = line.split_whitespace().last() {
                conflicts.push(ConflictFile {
                    path: path.to_string(),
                    conflict_type: "rename",
                });
            }
        } else if line.starts_with("CONFLICT (modify/delete)") {
            if let Some(path) = line.split_whitespace().last() {
                conflicts.push(ConflictFile {
                    path: path.to_string(),
                    conflict_type: "delete",
                });
            }
        }
    }

    if conflicts.is_empty() {
        if let Ok(status) = run_git(&["diff", "--name-only", "--diff-filter=U"], worktree_dir).await {
            for path in status.stdout.lines() {
                let path = path.trim();
                if !path.is_empty() {
                    conflicts.push(ConflictFile {
                        path: path.to_string(),
                        conflict_type: "content",
                    });
                }
            }
        }
    }

    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{Card, InMemoryCardStore, Project, ProjectStatus};
    use chrono::Utc;

    async fn setup_repo_with_branches() -> (tempfile::TempDir, PathBuf, String) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        run_git(&["init"], &root).await.unwrap();
        run_git(&["config", "user.email", "test@foreman.dev"], &root).await.unwrap();
        run_git(&["config", "user.name", "Foreman Test"], &root).await.unwrap();
        tokio::fs::write(root.join("README.md"), "base\n").await.unwrap();
        run_git(&["add", "."], &root).await.unwrap();
        run_git(&["commit", "-m", "init"], &root).await.unwrap();
        run_git(&["branch", DEFAULT_INTEGRATION_BRANCH], &root).await.unwrap();
        (tmp, root, DEFAULT_INTEGRATION_BRANCH.to_string())
    }

    fn seed_card(store: &InMemoryCardStore, project_id: &str, agent_kind: &str, title: &str) -> Card {
        store.insert_project(Project {
            project_id: project_id.to_string(),
            name: project_id.to_string(),
            status: ProjectStatus::Active,
            agent_timeout_minutes: None,
            max_concurrent_agents: None,
        });
        let card = store.create_card(project_id, title, "desc", 0).unwrap();
        store.start_work(&card.card_id, agent_kind).unwrap();
        store
            .update_card_verification(&card.card_id, VerificationStatus::BranchVerified, None)
            .unwrap();
        store.get_card(&card.card_id).unwrap();
        let _ = Utc::now();
        card
    }

    #[tokio::test]
    async fn clean_merge_promotes_card_to_merge_verified() {
        let (_tmp, root, _integration) = setup_repo_with_branches().await;
        let wt_mgr = Arc::new(WorktreeManager::new(root.clone()));
        let store = Arc::new(InMemoryCardStore::new());

        let card = seed_card(&store, "p1", "claude", "Add feature X");
        let branch = WorktreeManager::branch_name("claude", "Add feature X", &card.card_id);
        let wt = wt_mgr.create(&card.card_id, &branch, "HEAD").await.unwrap();
        tokio::fs::write(wt.path.join("feature.txt"), "new\n").await.unwrap();
        run_git(&["add", "."], &wt.path).await.unwrap();
        run_git(&["commit", "-m", "add feature"], &wt.path).await.unwrap();
        wt_mgr.remove(&wt.path).await;

        let synth = Synthesizer::new(
            store.clone(),
            Arc::new(Broadcaster::new()),
            Arc::clone(&wt_mgr),
            VerifierConfig::new(None, None, Some("exit 0".to_string())),
        );
        synth.run_once().await;

        let updated = store.get_card(&card.card_id).unwrap();
        assert_eq!(updated.verification_status, VerificationStatus::MergeVerified);
        assert_eq!(updated.column, crate::card::CardColumn::Done);
    }

    #[tokio::test]
    async fn conflicting_merge_blocks_card() {
        let (_tmp, root, integration) = setup_repo_with_branches().await;
        let wt_mgr = Arc::new(WorktreeManager::new(root.clone()));
        let store = Arc::new(InMemoryCardStore::new());

        // Commit to integration so it diverges from the agent branch.
        run_git(&["checkout", &integration], &root).await.unwrap();
        tokio::fs::write(root.join("README.md"), "integration-change\n").await.unwrap();
        run_git(&["add", "."], &root).await.unwrap();
        run_git(&["commit", "-m", "integration change"], &root).await.unwrap();
        run_git(&["checkout", "master"], &root).await.ok();

        let card = seed_card(&store, "p1", "claude", "Conflicting change");
        let branch = WorktreeManager::branch_name("claude", "Conflicting change", &card.card_id);
        let wt = wt_mgr.create(&card.card_id, &branch, "HEAD").await.unwrap();
        tokio::fs::write(wt.path.join("README.md"), "agent-change\n").await.unwrap();
        run_git(&["add", "."], &wt.path).await.unwrap();
        run_git(&["commit", "-m", "agent change"], &wt.path).await.unwrap();
        wt_mgr.remove(&wt.path).await;

        let synth = Synthesizer::new(
            store.clone(),
            Arc::new(Broadcaster::new()),
            Arc::clone(&wt_mgr),
            VerifierConfig::new(None, None, Some("exit 0".to_string())),
        )
        .with_integration_branch(integration);
        synth.run_once().await;

        let updated = store.get_card(&card.card_id).unwrap();
        assert_eq!(updated.verification_status, VerificationStatus::MergeFailed);
        assert_eq!(updated.agent_status, AgentStatus::Blocked);
    }

    #[tokio::test]
    async fn no_branch_verified_cards_is_a_quiet_noop() {
        let (_tmp, root, _integration) = setup_repo_with_branches().await;
        let wt_mgr = Arc::new(WorktreeManager::new(root));
        let store = Arc::new(InMemoryCardStore::new());
        store.insert_project(Project {
            project_id: "p1".into(),
            name: "p1".into(),
            status: ProjectStatus::Active,
            agent_timeout_minutes: None,
            max_concurrent_agents: None,
        });

        let synth = Synthesizer::new(
            store,
            Arc::new(Broadcaster::new()),
            wt_mgr,
            VerifierConfig::default(),
        );
        synth.run_once().await;
    }
}
