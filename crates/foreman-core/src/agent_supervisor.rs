//! AgentSupervisor: drives one card's agent run from spawn through
//! verification, push, and cleanup.
//!
//! Built on top of [`crate::supervisor::ProcessSupervisor`], the low-level
//! child-process watchdog. This module owns everything above that: the
//! state machine, the line-bounded log ring, secret redaction, telemetry
//! parsing, the verify/push sequence, and the cleanup invariant (the
//! worktree is removed on every exit path).
//!
//! A run has a single cumulative timeout budget, not a separate budget per
//! phase. `ProcessSupervisor` natively distinguishes an idle timeout (resets on
//! every output line) from a hard timeout (an absolute deadline). Setting
//! both to the same duration collapses that distinction back to a single
//! cumulative budget: a chatty child keeps resetting the idle timer and only
//! ever meets the hard deadline, while a silent child hits idle and hard at
//! effectively the same instant.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::adapter::AgentAdapter;
use crate::broadcaster::Broadcaster;
use crate::card::{AgentStatus, CardStore, VerificationStatus};
use crate::event::{Event, Gate};
use crate::git_exec::run_git;
use crate::notifier::Notifier;
use crate::security::redact::SecretRedactor;
use crate::supervisor::{AgentCommand, ProcessSupervisor, SupervisorConfig, SupervisorEvent};
use crate::verifier::{self, VerifierConfig};
use crate::worktree::WorktreeManager;

/// Cap on the in-memory log ring per run.
const LOG_RING_CAPACITY: usize = 500;

/// Environment variables stripped from the agent child's inherited
/// environment so the supervisor's own credentials never bias the agent.
const REDACTED_ENV_VARS: &[&str] = &["ANTHROPIC_API_KEY", "OPENAI_API_KEY"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Starting,
    Running,
    Completing,
    Verifying,
    Pushing,
    Completed,
    Blocked,
    Failed,
    /// Not one of the three states the contract resolves to on its own —
    /// an externally triggered stop (`cancel()`) short-circuits the state
    /// machine from any non-terminal state.
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunState::Starting | RunState::Running | RunState::Completing | RunState::Verifying | RunState::Pushing)
    }
}

struct LogRing {
    lines: Mutex<VecDeque<String>>,
}

impl LogRing {
    fn new() -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)),
        }
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() == LOG_RING_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn tail(&self, limit: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap();
        let skip = lines.len().saturating_sub(limit);
        lines.iter().skip(skip).cloned().collect()
    }
}

/// Shared handle to one agent run. Held by the Orchestrator's registry;
/// cheap to clone (`Arc` wrapped by the caller). `state()` and `logs()` may
/// be called concurrently with the task driving the run.
pub struct AgentRunHandle {
    pub card_id: String,
    pub project_id: String,
    pub agent_kind: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub started_at: DateTime<Utc>,
    state: Mutex<RunState>,
    log: LogRing,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl AgentRunHandle {
    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, s: RunState) {
        *self.state.lock().unwrap() = s;
    }

    pub fn logs(&self, limit: usize) -> Vec<String> {
        self.log.tail(limit)
    }

    /// Request cancellation. Idempotent: a run that already finished, or
    /// that has already been cancelled once, silently does nothing.
    pub fn cancel(&self) {
        if let Some(tx) = self.cancel.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

/// Everything `run()` needs to drive one card's agent to a terminal state.
pub struct AgentRunConfig {
    pub card_id: String,
    pub project_id: String,
    pub agent_kind: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub timeout: Duration,
    pub command: AgentCommand,
    pub adapter: Arc<dyn AgentAdapter>,
    pub verifier_config: VerifierConfig,
    pub card_store: Arc<dyn CardStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub worktree_manager: Arc<WorktreeManager>,
    pub notifier: Arc<dyn Notifier>,
}

/// Spawn the agent and return a handle plus a join handle resolving to the
/// terminal `RunState` (always one of `Completed`/`Blocked`/`Failed`/`Cancelled`).
pub fn run(mut config: AgentRunConfig) -> (Arc<AgentRunHandle>, tokio::task::JoinHandle<RunState>) {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let handle = Arc::new(AgentRunHandle {
        card_id: config.card_id.clone(),
        project_id: config.project_id.clone(),
        agent_kind: config.agent_kind.clone(),
        branch: config.branch.clone(),
        worktree_path: config.worktree_path.clone(),
        started_at: Utc::now(),
        state: Mutex::new(RunState::Starting),
        log: LogRing::new(),
        cancel: Mutex::new(Some(cancel_tx)),
    });

    config.command.env_remove = REDACTED_ENV_VARS.iter().map(|s| s.to_string()).collect();

    let task_handle = Arc::clone(&handle);
    let join = tokio::spawn(async move { drive(task_handle, config, cancel_rx).await });

    (handle, join)
}

async fn drive(
    handle: Arc<AgentRunHandle>,
    config: AgentRunConfig,
    cancel_rx: oneshot::Receiver<()>,
) -> RunState {
    let redactor = SecretRedactor::new();

    let supervisor_config = SupervisorConfig {
        run_id: uuid::Uuid::new_v4(),
        agent_key: config.agent_kind.clone(),
        idle_timeout: config.timeout,
        hard_timeout: config.timeout,
        max_output_bytes: 16 * 1024 * 1024,
    };
    let supervisor = ProcessSupervisor::new(supervisor_config);

    let (mut events, proc_cancel) = match supervisor.spawn(config.command.clone()).await {
        Ok(pair) => pair,
        Err(e) => {
            return fail_run(&handle, &config, &format!("failed to spawn agent process: {e}")).await;
        }
    };

    handle.set_state(RunState::Running);

    // Forward external cancel() into the low-level supervisor's own cancel
    // channel. Once fired, `proc_cancel` is consumed; the select below keeps
    // driving the event stream to its natural (now-cancelled) conclusion.
    tokio::pin!(cancel_rx);
    let mut proc_cancel = Some(proc_cancel);
    let mut external_cancel_requested = false;

    loop {
        tokio::select! {
            biased;

            _ = &mut cancel_rx, if proc_cancel.is_some() => {
                if let Some(c) = proc_cancel.take() {
                    external_cancel_requested = true;
                    c.cancel();
                }
            }

            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SupervisorEvent::Started { .. } => {}
                    SupervisorEvent::Stdout { line, .. } | SupervisorEvent::Stderr { line, .. } => {
                        handle_output_line(&handle, &config, &redactor, &line);
                    }
                    SupervisorEvent::Completed { exit_code, .. } => {
                        if exit_code == 0 {
                            return complete_run(&handle, &config).await;
                        } else {
                            return fail_run(
                                &handle,
                                &config,
                                &format!("agent exited with status {exit_code}"),
                            )
                            .await;
                        }
                    }
                    SupervisorEvent::Failed { error, .. } => {
                        return fail_run(&handle, &config, &error).await;
                    }
                    SupervisorEvent::TimedOut { .. } => {
                        let minutes = config.timeout.as_secs() / 60;
                        let reason = format!("Timed out after {minutes} minutes");
                        config.broadcaster.publish(Event::AgentTimeout {
                            card_id: config.card_id.clone(),
                            project_id: config.project_id.clone(),
                            error: reason.clone(),
                        });
                        return fail_run(&handle, &config, &reason).await;
                    }
                    SupervisorEvent::Cancelled { .. } => {
                        return cancel_run(&handle, &config).await;
                    }
                }
            }
        }
        // If cancellation was requested but the child hasn't produced a
        // terminal event yet, keep looping: the low-level supervisor's own
        // select will observe the forwarded cancel and emit `Cancelled`.
        let _ = external_cancel_requested;
    }

    // Event stream closed without a terminal event (should not happen in
    // practice; the low-level supervisor always emits one before dropping
    // the sender). Treat it the same as an internal failure.
    fail_run(&handle, &config, "agent event stream closed unexpectedly").await
}

fn handle_output_line(
    handle: &Arc<AgentRunHandle>,
    config: &AgentRunConfig,
    redactor: &SecretRedactor,
    raw_line: &str,
) {
    let redacted = redactor.redact_line(raw_line).into_owned();
    handle.log.push(redacted.clone());

    config.broadcaster.publish(Event::AgentLog {
        card_id: config.card_id.clone(),
        project_id: config.project_id.clone(),
        agent: config.agent_kind.clone(),
        line: redacted.clone(),
    });

    for telemetry in config.adapter.parse_line(&redacted) {
        if let crate::adapter::AgentEvent::Usage {
            input_tokens,
            output_tokens,
            ..
        } = telemetry
        {
            let _ = config.card_store.insert_token_usage(crate::event::TokenUsageRow {
                card_id: config.card_id.clone(),
                project_id: config.project_id.clone(),
                agent: config.agent_kind.clone(),
                input: input_tokens,
                output: output_tokens,
                cache_read: 0,
                cache_write: 0,
                cost_usd: 0.0,
                created_at: Utc::now(),
            });
        }
    }
}

async fn complete_run(handle: &Arc<AgentRunHandle>, config: &AgentRunConfig) -> RunState {
    handle.set_state(RunState::Completing);
    handle.set_state(RunState::Verifying);

    config.broadcaster.publish(Event::VerificationStarted {
        card_id: config.card_id.clone(),
        project_id: config.project_id.clone(),
        gate: Gate::Branch,
    });

    let result = verifier::verify(&config.worktree_path, &config.verifier_config).await;

    if !result.passed {
        let output = format!(
            "type-check:\n{}\nlint:\n{}\ntest:\n{}",
            result.type_check_output, result.lint_output, result.test_output
        );
        let _ = config
            .card_store
            .update_card_verification(&config.card_id, VerificationStatus::BranchFailed, Some(&output));
        let _ = config
            .card_store
            .update_agent_status(&config.card_id, AgentStatus::Blocked, Some("branch verification failed"));
        config.broadcaster.publish(Event::VerificationFailed {
            card_id: config.card_id.clone(),
            project_id: config.project_id.clone(),
            gate: Gate::Branch,
            output,
        });
        config.broadcaster.publish(Event::AgentFailed {
            card_id: config.card_id.clone(),
            project_id: config.project_id.clone(),
            error: "branch verification failed".to_string(),
        });
        notify_failure(config, handle, "branch verification failed");
        cleanup_worktree(config).await;
        handle.set_state(RunState::Blocked);
        return RunState::Blocked;
    }

    let _ = config
        .card_store
        .update_card_verification(&config.card_id, VerificationStatus::BranchVerified, None);
    let _ = config.card_store.log_audit(
        "card",
        &config.card_id,
        "verification.branch_passed",
        serde_json::json!({ "gate": "branch" }),
    );
    config.broadcaster.publish(Event::VerificationPassed {
        card_id: config.card_id.clone(),
        project_id: config.project_id.clone(),
        gate: Gate::Branch,
    });

    handle.set_state(RunState::Pushing);
    match push_branch(&config.worktree_path, &config.branch).await {
        Ok(()) => {
            let _ = config.card_store.complete_work(&config.card_id);
            let _ = config.card_store.log_audit(
                "card",
                &config.card_id,
                "agent.completed",
                serde_json::json!({ "branch": config.branch }),
            );
            config.broadcaster.publish(Event::AgentCompleted {
                card_id: config.card_id.clone(),
                project_id: config.project_id.clone(),
            });
            cleanup_worktree(config).await;
            handle.set_state(RunState::Completed);
            RunState::Completed
        }
        Err(e) => {
            warn!(card_id = %config.card_id, error = %e, "push failed, blocking card for operator review");
            let _ = config
                .card_store
                .update_agent_status(&config.card_id, AgentStatus::Blocked, Some(&e));
            config.broadcaster.publish(Event::AgentFailed {
                card_id: config.card_id.clone(),
                project_id: config.project_id.clone(),
                error: format!("push failed: {e}"),
            });
            notify_failure(config, handle, &format!("push failed: {e}"));
            cleanup_worktree(config).await;
            handle.set_state(RunState::Blocked);
            RunState::Blocked
        }
    }
}

/// Cap on how much log tail text rides along in an operator notification.
const NOTIFY_TAIL_CHARS: usize = 500;

/// Send a short human-readable message to the operator notifier, with the
/// last `NOTIFY_TAIL_CHARS` characters of the run's log ring attached.
fn notify_failure(config: &AgentRunConfig, handle: &Arc<AgentRunHandle>, summary: &str) {
    let tail = last_chars(&handle.log.tail(LOG_RING_CAPACITY).join("\n"), NOTIFY_TAIL_CHARS);
    let text = if tail.is_empty() {
        format!("card {}: {summary}", config.card_id)
    } else {
        format!("card {}: {summary}\n{tail}", config.card_id)
    };
    config.notifier.send(&text);
}

/// Last `max` characters of `s`, respecting UTF-8 char boundaries.
fn last_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    let skip = count - max;
    let byte_idx = s.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(0);
    &s[byte_idx..]
}

async fn push_branch(worktree_path: &std::path::Path, branch: &str) -> Result<(), String> {
    run_git(&["push", "--set-upstream", "origin", branch], worktree_path)
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
}

async fn fail_run(handle: &Arc<AgentRunHandle>, config: &AgentRunConfig, reason: &str) -> RunState {
    warn!(card_id = %config.card_id, reason, "agent run failed");
    let _ = config
        .card_store
        .update_agent_status(&config.card_id, AgentStatus::Failed, Some(reason));
    let _ = config.card_store.log_audit(
        "card",
        &config.card_id,
        "agent.failed",
        serde_json::json!({ "reason": reason }),
    );
    config.broadcaster.publish(Event::AgentFailed {
        card_id: config.card_id.clone(),
        project_id: config.project_id.clone(),
        error: reason.to_string(),
    });
    notify_failure(config, handle, reason);
    cleanup_worktree(config).await;
    handle.set_state(RunState::Failed);
    RunState::Failed
}

async fn cancel_run(handle: &Arc<AgentRunHandle>, config: &AgentRunConfig) -> RunState {
    info!(card_id = %config.card_id, "agent run cancelled externally");
    let snapshot = context_snapshot(&config.branch, &handle.log.tail(LOG_RING_CAPACITY));
    let _ = config.card_store.save_context(&config.card_id, &snapshot, None);
    let _ = config
        .card_store
        .update_agent_status(&config.card_id, AgentStatus::Idle, Some("cancelled"));
    config.broadcaster.publish(Event::AgentStopped {
        card_id: config.card_id.clone(),
        project_id: config.project_id.clone(),
    });
    cleanup_worktree(config).await;
    handle.set_state(RunState::Cancelled);
    RunState::Cancelled
}

/// Build a resumable context snapshot: the branch name followed by the
/// trailing log lines. A future spawn against this card rehydrates its
/// prompt from this text, so the branch name must survive even if the log
/// ring itself is empty.
pub fn context_snapshot(branch: &str, tail_lines: &[String]) -> String {
    format!("branch: {branch}\n{}", tail_lines.join("\n"))
}

/// Cleanup invariant: the worktree is removed on every exit path,
/// best-effort. Branch retention is a separate policy decision made by the
/// caller (`RetentionConfig`), not this module.
async fn cleanup_worktree(config: &AgentRunConfig) {
    config.worktree_manager.remove(&config.worktree_path).await;
}
