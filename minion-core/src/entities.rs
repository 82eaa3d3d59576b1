//! Core entity structures
//!
//! Rows as the datastore holds them. Content-bearing entities (messages,
//! plans, log entries) store filesystem paths; the bytes live on disk.

use crate::{
    AgentClass, AgentName, FenixRecordId, FlagKey, HpMode, HpReading, Liveness, LogEntryId,
    LogPriority, MessageId, PlanId, PlanStatus, TaskId, Transport,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered participant in the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub name: AgentName,
    pub class: AgentClass,
    pub model: Option<String>,
    pub transport: Transport,
    pub status: String,
    pub description: Option<String>,
    pub context_summary: Option<String>,
    pub context_updated_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_inbox_check: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub current_zone: Option<String>,
    pub current_role: Option<String>,
    pub pid: Option<i64>,
    pub session_id: Option<String>,
    pub hp: HpTelemetry,
}

/// Persisted HP telemetry columns for an agent.
///
/// Cumulative counters are accounting-only; the percentage always derives
/// from per-turn input against the limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HpTelemetry {
    pub mode: HpMode,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub turn_input: Option<u64>,
    pub turn_output: Option<u64>,
    pub tokens_limit: Option<u64>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Alert thresholds already fired this run (25, 10).
    pub alerts_fired: Vec<u8>,
}

impl HpTelemetry {
    pub fn reading(&self) -> HpReading {
        HpReading::from_telemetry(self.mode, self.turn_input, self.input_tokens, self.tokens_limit)
    }
}

/// An agent row enriched with derived fields for `who` / dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub agent: Agent,
    pub liveness: Liveness,
    pub hp_summary: String,
    pub context_stale: bool,
}

/// A message row. Content is stored externally; `content_file` points at it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub from_agent: AgentName,
    pub to_agent: String,
    pub content_file: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub is_cc: bool,
    pub cc_original_to: Option<String>,
}

/// A message with its content inlined, as returned by check-inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredMessage {
    #[serde(flatten)]
    pub message: Message,
    pub content: String,
}

/// A task in the DAG engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub task_file: String,
    pub project: Option<String>,
    pub zone: Option<String>,
    /// One of the stages of `flow_type`'s flow.
    pub status: String,
    pub blocked_by: Vec<TaskId>,
    pub assigned_to: Option<AgentName>,
    pub created_by: AgentName,
    pub files: Option<String>,
    pub progress: Option<String>,
    pub class_required: Option<AgentClass>,
    pub flow_type: String,
    pub activity_count: i64,
    pub result_file: Option<String>,
    pub requirement_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One audited status transition. Append-only; the sole source of
/// transition truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTransition {
    pub task_id: TaskId,
    pub from_status: Option<String>,
    pub to_status: String,
    pub agent: AgentName,
    pub timestamp: DateTime<Utc>,
}

/// An exclusive cooperative lock on a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileClaim {
    pub file_path: String,
    pub holder: AgentName,
    pub acquired_at: DateTime<Utc>,
}

/// A FIFO waitlist entry behind a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub file_path: String,
    pub agent: AgentName,
    pub requested_at: DateTime<Utc>,
}

/// A battle plan. At most one `active` plan exists at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattlePlan {
    pub id: PlanId,
    pub set_by: AgentName,
    pub plan_file: String,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An append-only raid-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: LogEntryId,
    pub agent: AgentName,
    pub entry_file: String,
    pub priority: LogPriority,
    pub created_at: DateTime<Utc>,
}

/// A process-wide flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    pub key: FlagKey,
    pub value: String,
    pub set_by: AgentName,
    pub set_at: DateTime<Utc>,
}

/// A pre-death knowledge dump, consumed on cold-start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FenixRecord {
    pub id: FenixRecordId,
    pub agent: AgentName,
    pub files: Vec<String>,
    pub manifest: String,
    pub created_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

/// Liveness windows applied to `last_seen`.
pub const LIVENESS_ACTIVE_SECS: i64 = 120;
pub const LIVENESS_IDLE_SECS: i64 = 600;

/// Compute liveness from last_seen at a given instant.
pub fn liveness(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Liveness {
    match last_seen {
        None => Liveness::Dead,
        Some(seen) => {
            let age = (now - seen).num_seconds();
            if age < LIVENESS_ACTIVE_SECS {
                Liveness::Active
            } else if age < LIVENESS_IDLE_SECS {
                Liveness::Idle
            } else {
                Liveness::Dead
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn liveness_windows() {
        let now = Utc::now();
        assert_eq!(liveness(Some(now - Duration::seconds(30)), now), Liveness::Active);
        assert_eq!(liveness(Some(now - Duration::seconds(300)), now), Liveness::Idle);
        assert_eq!(liveness(Some(now - Duration::seconds(601)), now), Liveness::Dead);
        assert_eq!(liveness(None, now), Liveness::Dead);
    }
}
