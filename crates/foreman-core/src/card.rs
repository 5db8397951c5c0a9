//! Card/Project data model and the `CardStore` contract.
//!
//! `CardStore` is consumed, not owned, by this core: a real deployment wires
//! it to a durable row store (external, out of scope here). The in-memory
//! [`InMemoryCardStore`] backs this crate's own tests and the CLI's
//! standalone mode. The contract is blocking (no `async fn`); a
//! durable implementation is expected to do its own I/O synchronously or via
//! `tokio::task::spawn_blocking` internally.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::event::{AuditRow, TokenUsageRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardColumn {
    Backlog,
    InProgress,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Unverified,
    BranchVerified,
    BranchFailed,
    MergeVerified,
    MergeFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Archived,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub card_id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub context_snapshot: Option<String>,
    /// Adapter key used for the most recent (or current) agent run on this
    /// card. Persisted at `start_work` so the Synthesizer can deterministically
    /// re-derive `WorktreeManager::branch_name` for a `branch_verified` card
    /// without needing the in-memory `AgentRun` to still be alive.
    pub agent_kind: Option<String>,
    pub column: CardColumn,
    pub agent_status: AgentStatus,
    pub verification_status: VerificationStatus,
    pub priority: i32,
    pub position: i32,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Card {
    pub fn new_backlog(project_id: &str, title: &str, description: &str, priority: i32, position: i32) -> Self {
        Self {
            card_id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            context_snapshot: None,
            agent_kind: None,
            column: CardColumn::Backlog,
            agent_status: AgentStatus::Idle,
            verification_status: VerificationStatus::Unverified,
            priority,
            position,
            updated_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub name: String,
    pub status: ProjectStatus,
    pub agent_timeout_minutes: Option<u32>,
    pub max_concurrent_agents: Option<u32>,
}

impl Project {
    pub fn max_concurrent_agents(&self) -> u32 {
        // Hard invariant: at most one running agent per project
        // regardless of override, unless a future policy documents otherwise.
        self.max_concurrent_agents.unwrap_or(1).min(1)
    }
}

/// Snapshot of a project's board, grouped by column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Board {
    pub backlog: Vec<Card>,
    pub in_progress: Vec<Card>,
    pub done: Vec<Card>,
}

#[derive(Debug, Error)]
pub enum CardStoreError {
    #[error("card '{0}' not found")]
    CardNotFound(String),
    #[error("project '{0}' not found")]
    ProjectNotFound(String),
    #[error("stale update: card '{card_id}' was updated at {actual} but caller expected {expected}")]
    Conflict {
        card_id: String,
        expected: DateTime<Utc>,
        actual: DateTime<Utc>,
    },
}

pub type CardStoreResult<T> = std::result::Result<T, CardStoreError>;

/// Durable card/project state, consumed by the Orchestrator and Heartbeat.
///
/// Blocking contract: implementations may perform their own I/O
/// synchronously. Every write method bumps the card's `updated_at`.
pub trait CardStore: Send + Sync {
    fn get_card(&self, card_id: &str) -> CardStoreResult<Card>;
    fn get_project(&self, project_id: &str) -> CardStoreResult<Project>;
    fn get_board(&self, project_id: &str) -> CardStoreResult<Board>;
    fn get_next_card(&self, project_id: &str) -> CardStoreResult<Option<Card>>;
    fn active_projects(&self) -> CardStoreResult<Vec<Project>>;

    fn start_work(&self, card_id: &str, agent_kind: &str) -> CardStoreResult<Card>;
    fn skip_to_back(&self, card_id: &str) -> CardStoreResult<Card>;
    fn save_context(&self, card_id: &str, text: &str, session_id: Option<&str>) -> CardStoreResult<()>;
    fn assign_agent(&self, card_id: &str, agent_kind: &str) -> CardStoreResult<()>;
    fn update_agent_status(
        &self,
        card_id: &str,
        status: AgentStatus,
        reason: Option<&str>,
    ) -> CardStoreResult<()>;
    fn complete_work(&self, card_id: &str) -> CardStoreResult<()>;
    fn update_card_verification(
        &self,
        card_id: &str,
        status: VerificationStatus,
        output: Option<&str>,
    ) -> CardStoreResult<()>;

    /// Create a new backlog card, e.g. from `Heartbeat::submit_task_brief`.
    fn create_card(
        &self,
        project_id: &str,
        title: &str,
        description: &str,
        priority: i32,
    ) -> CardStoreResult<Card>;

    fn insert_token_usage(&self, record: TokenUsageRow) -> CardStoreResult<()>;
    fn log_audit(&self, entity_type: &str, entity_id: &str, action: &str, details: serde_json::Value) -> CardStoreResult<()>;
}

/// In-memory reference `CardStore`: backs this crate's tests and the CLI's
/// standalone mode. State does not survive process restart.
#[derive(Default)]
pub struct InMemoryCardStore {
    cards: Mutex<HashMap<String, Card>>,
    projects: Mutex<HashMap<String, Project>>,
    token_usage: Mutex<Vec<TokenUsageRow>>,
    audit_log: Mutex<Vec<AuditRow>>,
}

impl InMemoryCardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_project(&self, project: Project) {
        self.projects.lock().unwrap().insert(project.project_id.clone(), project);
    }

    pub fn insert_card(&self, card: Card) {
        self.cards.lock().unwrap().insert(card.card_id.clone(), card);
    }

    pub fn audit_log(&self) -> Vec<AuditRow> {
        self.audit_log.lock().unwrap().clone()
    }

    pub fn token_usage(&self) -> Vec<TokenUsageRow> {
        self.token_usage.lock().unwrap().clone()
    }

    fn touch(card: &mut Card) {
        card.updated_at = Utc::now();
    }
}

impl CardStore for InMemoryCardStore {
    fn get_card(&self, card_id: &str) -> CardStoreResult<Card> {
        self.cards
            .lock()
            .unwrap()
            .get(card_id)
            .cloned()
            .ok_or_else(|| CardStoreError::CardNotFound(card_id.to_string()))
    }

    fn get_project(&self, project_id: &str) -> CardStoreResult<Project> {
        self.projects
            .lock()
            .unwrap()
            .get(project_id)
            .cloned()
            .ok_or_else(|| CardStoreError::ProjectNotFound(project_id.to_string()))
    }

    fn get_board(&self, project_id: &str) -> CardStoreResult<Board> {
        let cards = self.cards.lock().unwrap();
        let mut board = Board::default();
        for card in cards.values().filter(|c| c.project_id == project_id) {
            match card.column {
                CardColumn::Backlog => board.backlog.push(card.clone()),
                CardColumn::InProgress => board.in_progress.push(card.clone()),
                CardColumn::Done => board.done.push(card.clone()),
            }
        }
        board.backlog.sort_by_key(|c| (c.priority, c.position));
        Ok(board)
    }

    fn get_next_card(&self, project_id: &str) -> CardStoreResult<Option<Card>> {
        Ok(self.get_board(project_id)?.backlog.into_iter().next())
    }

    fn active_projects(&self) -> CardStoreResult<Vec<Project>> {
        Ok(self
            .projects
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.status == ProjectStatus::Active)
            .cloned()
            .collect())
    }

    fn start_work(&self, card_id: &str, agent_kind: &str) -> CardStoreResult<Card> {
        let mut cards = self.cards.lock().unwrap();
        let card = cards
            .get_mut(card_id)
            .ok_or_else(|| CardStoreError::CardNotFound(card_id.to_string()))?;
        card.column = CardColumn::InProgress;
        card.agent_status = AgentStatus::Running;
        card.started_at = Some(Utc::now());
        card.agent_kind = Some(agent_kind.to_string());
        Self::touch(card);
        Ok(card.clone())
    }

    fn skip_to_back(&self, card_id: &str) -> CardStoreResult<Card> {
        let mut cards = self.cards.lock().unwrap();
        let card = cards
            .get_mut(card_id)
            .ok_or_else(|| CardStoreError::CardNotFound(card_id.to_string()))?;
        card.column = CardColumn::Backlog;
        card.agent_status = AgentStatus::Idle;
        Self::touch(card);
        Ok(card.clone())
    }

    fn save_context(&self, card_id: &str, text: &str, _session_id: Option<&str>) -> CardStoreResult<()> {
        let mut cards = self.cards.lock().unwrap();
        let card = cards
            .get_mut(card_id)
            .ok_or_else(|| CardStoreError::CardNotFound(card_id.to_string()))?;
        card.context_snapshot = Some(text.to_string());
        Self::touch(card);
        Ok(())
    }

    fn assign_agent(&self, card_id: &str, _agent_kind: &str) -> CardStoreResult<()> {
        let mut cards = self.cards.lock().unwrap();
        let card = cards
            .get_mut(card_id)
            .ok_or_else(|| CardStoreError::CardNotFound(card_id.to_string()))?;
        Self::touch(card);
        Ok(())
    }

    fn update_agent_status(
        &self,
        card_id: &str,
        status: AgentStatus,
        _reason: Option<&str>,
    ) -> CardStoreResult<()> {
        let mut cards = self.cards.lock().unwrap();
        let card = cards
            .get_mut(card_id)
            .ok_or_else(|| CardStoreError::CardNotFound(card_id.to_string()))?;
        card.agent_status = status;
        Self::touch(card);
        Ok(())
    }

    fn complete_work(&self, card_id: &str) -> CardStoreResult<()> {
        let mut cards = self.cards.lock().unwrap();
        let card = cards
            .get_mut(card_id)
            .ok_or_else(|| CardStoreError::CardNotFound(card_id.to_string()))?;
        card.agent_status = AgentStatus::Completed;
        card.completed_at = Some(Utc::now());
        Self::touch(card);
        Ok(())
    }

    fn update_card_verification(
        &self,
        card_id: &str,
        status: VerificationStatus,
        output: Option<&str>,
    ) -> CardStoreResult<()> {
        let mut cards = self.cards.lock().unwrap();
        let card = cards
            .get_mut(card_id)
            .ok_or_else(|| CardStoreError::CardNotFound(card_id.to_string()))?;
        card.verification_status = status;
        if status == VerificationStatus::MergeVerified {
            card.column = CardColumn::Done;
        }
        let _ = output;
        Self::touch(card);
        Ok(())
    }

    fn create_card(
        &self,
        project_id: &str,
        title: &str,
        description: &str,
        priority: i32,
    ) -> CardStoreResult<Card> {
        let mut cards = self.cards.lock().unwrap();
        let position = cards
            .values()
            .filter(|c| c.project_id == project_id && c.column == CardColumn::Backlog)
            .count() as i32;
        let card = Card::new_backlog(project_id, title, description, priority, position);
        cards.insert(card.card_id.clone(), card.clone());
        Ok(card)
    }

    fn insert_token_usage(&self, record: TokenUsageRow) -> CardStoreResult<()> {
        self.token_usage.lock().unwrap().push(record);
        Ok(())
    }

    fn log_audit(&self, entity_type: &str, entity_id: &str, action: &str, details: serde_json::Value) -> CardStoreResult<()> {
        self.audit_log
            .lock()
            .unwrap()
            .push(AuditRow::new(entity_type, entity_id, action, details));
        Ok(())
    }
}
