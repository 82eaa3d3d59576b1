//! Poll - the one-round-trip query daemons and terminal agents block on.
//!
//! Exit-code contract: 0 content delivered, 1 timeout, 3 stand_down/retire.

use crate::agents::require_agent;
use crate::flags::{flag_state, retire_pending};
use crate::store::map_sql;
use crate::tasks::{task_from_row, unclosed_blockers};
use crate::Store;
use minion_core::{
    classes_with, AgentClass, AgentName, Capability, DeliveredMessage, FlagKey, MinionResult,
    RowIdType, Task, TaskId,
};
use rusqlite::params;
use serde::{Deserialize, Serialize};

/// A shutdown signal observed during polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollSignal {
    StandDown,
    Retire,
}

/// A claimable task surfaced by poll, with the command to claim it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableTask {
    pub task_id: TaskId,
    pub title: String,
    pub status: String,
    pub task_file: String,
    pub claim_cmd: String,
}

/// One poll round-trip's findings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResult {
    pub signal: Option<PollSignal>,
    pub messages: Vec<DeliveredMessage>,
    pub tasks: Vec<AvailableTask>,
}

impl PollResult {
    pub fn is_empty(&self) -> bool {
        self.signal.is_none() && self.messages.is_empty() && self.tasks.is_empty()
    }

    /// The poll exit-code contract.
    pub fn exit_code(&self) -> i32 {
        if self.signal.is_some() {
            3
        } else if self.is_empty() {
            1
        } else {
            0
        }
    }
}

impl Store {
    /// One non-blocking poll: signals first, then inbox drain plus the
    /// claimable-task scan, all in a single transaction.
    pub fn poll_once(&mut self, agent: &AgentName) -> MinionResult<PollResult> {
        // Signals short-circuit - do not consume messages on the way out.
        if let Some(signal) = self.poll_signal(agent)? {
            return Ok(PollResult {
                signal: Some(signal),
                messages: Vec::new(),
                tasks: Vec::new(),
            });
        }

        let tasks = self.available_tasks(agent)?;
        let messages = {
            // Only drain the inbox when something is waiting; peeking keeps
            // an empty poll cheap.
            let agent_ = agent.clone();
            let waiting = self.with_tx(|tx| crate::messages::unread_count(tx, &agent_))?;
            if waiting > 0 {
                self.check_inbox(agent)?
            } else {
                Vec::new()
            }
        };

        Ok(PollResult {
            signal: None,
            messages,
            tasks,
        })
    }

    /// Pending stand_down/retire signal for this agent.
    pub fn poll_signal(&mut self, agent: &AgentName) -> MinionResult<Option<PollSignal>> {
        let agent = agent.clone();
        self.with_tx(|tx| {
            if flag_state(tx, FlagKey::StandDown)?.is_some() {
                return Ok(Some(PollSignal::StandDown));
            }
            if retire_pending(tx, &agent)? {
                return Ok(Some(PollSignal::Retire));
            }
            Ok(None)
        })
    }

    /// Claimable tasks for this agent, in priority order: already-assigned
    /// work first, then open tasks for its class, then review stages its
    /// class may work. Blocked tasks are filtered out. Empty under
    /// moon_crash.
    pub fn available_tasks(&mut self, agent: &AgentName) -> MinionResult<Vec<AvailableTask>> {
        let agent = agent.clone();
        self.with_tx(|tx| {
            if flag_state(tx, FlagKey::MoonCrash)?.is_some() {
                return Ok(Vec::new());
            }
            let caller = require_agent(tx, &agent)?;

            let mut candidates: Vec<Task> = Vec::new();

            let mut stmt = tx
                .prepare(
                    "SELECT * FROM tasks WHERE assigned_to = ?1
                     AND status IN ('open', 'assigned', 'in_progress')
                     ORDER BY created_at ASC LIMIT 10",
                )
                .map_err(map_sql)?;
            candidates.extend(
                stmt.query_map(params![agent.as_str()], task_from_row)
                    .map_err(map_sql)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(map_sql)?,
            );
            drop(stmt);

            if candidates.is_empty() {
                let mut stmt = tx
                    .prepare(
                        "SELECT * FROM tasks WHERE status = 'open' AND assigned_to IS NULL
                         AND class_required = ?1 ORDER BY created_at ASC LIMIT 10",
                    )
                    .map_err(map_sql)?;
                candidates.extend(
                    stmt.query_map(params![caller.class.as_db_str()], task_from_row)
                        .map_err(map_sql)?
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(map_sql)?,
                );
            }

            // Review stages go to classes that hold review/test.
            let reviewer = classes_with(Capability::Review).contains(&caller.class)
                || classes_with(Capability::Test).contains(&caller.class)
                || caller.class == AgentClass::Lead;
            if candidates.is_empty() && reviewer {
                let mut stmt = tx
                    .prepare(
                        "SELECT * FROM tasks WHERE status IN ('fixed', 'verified')
                         AND assigned_to IS NULL ORDER BY created_at ASC LIMIT 10",
                    )
                    .map_err(map_sql)?;
                candidates.extend(
                    stmt.query_map([], task_from_row)
                        .map_err(map_sql)?
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(map_sql)?,
                );
            }

            let mut out = Vec::new();
            for task in candidates {
                if !unclosed_blockers(tx, &task.blocked_by)?.is_empty() {
                    continue;
                }
                out.push(AvailableTask {
                    task_id: task.id,
                    claim_cmd: format!(
                        "minion pull-task --agent {} --task-id {}",
                        agent,
                        task.id.as_i64()
                    ),
                    title: task.title,
                    status: task.status,
                    task_file: task.task_file,
                });
            }
            Ok(out)
        })
    }
}
