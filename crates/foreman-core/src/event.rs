//! Wire envelope for agent/heartbeat/verification lifecycle events, plus the
//! structured audit and token-usage rows persisted through [`crate::card::CardStore`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which verification pass an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gate {
    Branch,
    Merge,
}

/// A single lifecycle event. Serializes to the documented wire shape
/// (`{"type": "agent.spawned", "cardId": "...", ...}`) so a transport layer
/// outside this core can forward it unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "agent.spawned")]
    AgentSpawned {
        #[serde(rename = "cardId")]
        card_id: String,
        #[serde(rename = "projectId")]
        project_id: String,
        agent: String,
    },
    #[serde(rename = "agent.log")]
    AgentLog {
        #[serde(rename = "cardId")]
        card_id: String,
        #[serde(rename = "projectId")]
        project_id: String,
        agent: String,
        line: String,
    },
    #[serde(rename = "agent.completed")]
    AgentCompleted {
        #[serde(rename = "cardId")]
        card_id: String,
        #[serde(rename = "projectId")]
        project_id: String,
    },
    #[serde(rename = "agent.failed")]
    AgentFailed {
        #[serde(rename = "cardId")]
        card_id: String,
        #[serde(rename = "projectId")]
        project_id: String,
        error: String,
    },
    #[serde(rename = "agent.timeout")]
    AgentTimeout {
        #[serde(rename = "cardId")]
        card_id: String,
        #[serde(rename = "projectId")]
        project_id: String,
        error: String,
    },
    #[serde(rename = "agent.stopped")]
    AgentStopped {
        #[serde(rename = "cardId")]
        card_id: String,
        #[serde(rename = "projectId")]
        project_id: String,
    },
    #[serde(rename = "verification.started")]
    VerificationStarted {
        #[serde(rename = "cardId")]
        card_id: String,
        #[serde(rename = "projectId")]
        project_id: String,
        gate: Gate,
    },
    #[serde(rename = "verification.passed")]
    VerificationPassed {
        #[serde(rename = "cardId")]
        card_id: String,
        #[serde(rename = "projectId")]
        project_id: String,
        gate: Gate,
    },
    #[serde(rename = "verification.failed")]
    VerificationFailed {
        #[serde(rename = "cardId")]
        card_id: String,
        #[serde(rename = "projectId")]
        project_id: String,
        gate: Gate,
        output: String,
    },
    #[serde(rename = "heartbeat.tick")]
    HeartbeatTick { tick: u64, agents: u32 },
    #[serde(rename = "heartbeat.spawned")]
    HeartbeatSpawned {
        #[serde(rename = "cardId")]
        card_id: String,
        #[serde(rename = "projectId")]
        project_id: String,
    },
    #[serde(rename = "heartbeat.idle")]
    HeartbeatIdle,
    #[serde(rename = "heartbeat.retry")]
    HeartbeatRetry {
        #[serde(rename = "cardId")]
        card_id: String,
        #[serde(rename = "projectId")]
        project_id: String,
    },
    #[serde(rename = "heartbeat.error")]
    HeartbeatError {
        #[serde(rename = "projectId")]
        project_id: String,
        error: String,
    },
    #[serde(rename = "heartbeat.cardCreated")]
    HeartbeatCardCreated {
        #[serde(rename = "cardId")]
        card_id: String,
        #[serde(rename = "projectId")]
        project_id: String,
    },
    #[serde(rename = "system.heartbeat")]
    SystemHeartbeat { uptime: u64 },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

impl Event {
    /// The event's scoping project, if any. Used by the Broadcaster to
    /// filter delivery to subscribers that requested a project scope.
    pub fn project_id(&self) -> Option<&str> {
        match self {
            Event::AgentSpawned { project_id, .. }
            | Event::AgentLog { project_id, .. }
            | Event::AgentCompleted { project_id, .. }
            | Event::AgentFailed { project_id, .. }
            | Event::AgentTimeout { project_id, .. }
            | Event::AgentStopped { project_id, .. }
            | Event::VerificationStarted { project_id, .. }
            | Event::VerificationPassed { project_id, .. }
            | Event::VerificationFailed { project_id, .. }
            | Event::HeartbeatSpawned { project_id, .. }
            | Event::HeartbeatRetry { project_id, .. }
            | Event::HeartbeatError { project_id, .. }
            | Event::HeartbeatCardCreated { project_id, .. } => Some(project_id),
            Event::HeartbeatTick { .. }
            | Event::HeartbeatIdle
            | Event::SystemHeartbeat { .. }
            | Event::Ping
            | Event::Pong => None,
        }
    }

    pub fn card_id(&self) -> Option<&str> {
        match self {
            Event::AgentSpawned { card_id, .. }
            | Event::AgentLog { card_id, .. }
            | Event::AgentCompleted { card_id, .. }
            | Event::AgentFailed { card_id, .. }
            | Event::AgentTimeout { card_id, .. }
            | Event::AgentStopped { card_id, .. }
            | Event::VerificationStarted { card_id, .. }
            | Event::VerificationPassed { card_id, .. }
            | Event::VerificationFailed { card_id, .. }
            | Event::HeartbeatSpawned { card_id, .. }
            | Event::HeartbeatRetry { card_id, .. }
            | Event::HeartbeatCardCreated { card_id, .. } => Some(card_id),
            _ => None,
        }
    }
}

/// Structured audit trail entry. Persisted via `CardStore::log_audit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRow {
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditRow {
    pub fn new(entity_type: &str, entity_id: &str, action: &str, details: serde_json::Value) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            action: action.to_string(),
            details,
            timestamp: Utc::now(),
        }
    }
}

/// Token/cost accounting row. Persisted via `CardStore::insert_token_usage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsageRow {
    pub card_id: String,
    pub project_id: String,
    pub agent: String,
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_spawned_serializes_to_wire_shape() {
        let evt = Event::AgentSpawned {
            card_id: "card-1".into(),
            project_id: "proj-1".into(),
            agent: "claude".into(),
        };
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], "agent.spawned");
        assert_eq!(json["cardId"], "card-1");
        assert_eq!(json["projectId"], "proj-1");
    }

    #[test]
    fn ping_pong_have_no_payload_fields() {
        let json = serde_json::to_value(Event::Ping).unwrap();
        assert_eq!(json["type"], "ping");
    }

    #[test]
    fn project_id_is_none_for_heartbeat_tick() {
        let evt = Event::HeartbeatTick { tick: 1, agents: 0 };
        assert!(evt.project_id().is_none());
    }

    #[test]
    fn project_id_present_for_agent_events() {
        let evt = Event::AgentLog {
            card_id: "c1".into(),
            project_id: "p1".into(),
            agent: "codex".into(),
            line: "building...".into(),
        };
        assert_eq!(evt.project_id(), Some("p1"));
        assert_eq!(evt.card_id(), Some("c1"));
    }

    #[test]
    fn verification_failed_carries_gate_and_output() {
        let evt = Event::VerificationFailed {
            card_id: "c1".into(),
            project_id: "p1".into(),
            gate: Gate::Branch,
            output: "error TS2345".into(),
        };
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["gate"], "branch");
        assert_eq!(json["output"], "error TS2345");
    }

    #[test]
    fn audit_row_roundtrips() {
        let row = AuditRow::new("card", "c1", "agent.spawned", serde_json::json!({"agent": "claude"}));
        let json = serde_json::to_string(&row).unwrap();
        let restored: AuditRow = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.entity_id, "c1");
        assert_eq!(restored.action, "agent.spawned");
    }
}
