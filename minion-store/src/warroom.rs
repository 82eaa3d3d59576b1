//! War-room - battle plans and the raid log.
//!
//! The active plan is the precondition gate for sends and task creation.

use crate::agents::{require_agent, touch_last_seen};
use crate::store::{map_sql, now, opt_from_db, to_db};
use crate::{atomic_write, read_content, Store};
use minion_core::{
    has_capability, AgentName, BattlePlan, Capability, LogEntry, LogEntryId, LogPriority,
    MinionResult, PlanId, PlanStatus, RowIdType,
};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A plan with its text inlined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanView {
    #[serde(flatten)]
    pub plan: BattlePlan,
    pub content: String,
}

/// A log entry with its text inlined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogView {
    #[serde(flatten)]
    pub entry: LogEntry,
    pub content: String,
}

impl Store {
    /// Set a new active plan. Any prior active plan is superseded in the
    /// same transaction, preserving the at-most-one-active invariant.
    pub fn set_plan(&mut self, agent: &AgentName, text: &str) -> MinionResult<BattlePlan> {
        let agent = agent.clone();
        let text = text.to_string();
        let paths = self.paths.clone();
        self.with_tx(|tx| {
            let caller = require_agent(tx, &agent)?;
            if !has_capability(caller.class, Capability::Manage) {
                return Err(minion_core::AuthError::CapabilityMissing {
                    class: caller.class,
                    capability: Capability::Manage,
                    command: "set-plan",
                }
                .into());
            }

            let ts = now();
            tx.execute(
                "UPDATE battle_plans SET status = 'superseded', updated_at = ?1 WHERE status = 'active'",
                params![to_db(ts)],
            )
            .map_err(map_sql)?;

            let file = paths.plan_file(&agent, ts);
            atomic_write(&file, &text)?;

            tx.execute(
                "INSERT INTO battle_plans (set_by, plan_file, status, created_at, updated_at)
                 VALUES (?1, ?2, 'active', ?3, ?3)",
                params![agent.as_str(), file.display().to_string(), to_db(ts)],
            )
            .map_err(map_sql)?;

            let plan = BattlePlan {
                id: PlanId::new(tx.last_insert_rowid()),
                set_by: agent.clone(),
                plan_file: file.display().to_string(),
                status: PlanStatus::Active,
                created_at: ts,
                updated_at: ts,
            };
            info!(plan_id = %plan.id, set_by = %agent, "battle plan set");
            Ok(plan)
        })
    }

    /// Plans by status, newest first, content inlined.
    pub fn get_plans(&mut self, status: PlanStatus) -> MinionResult<Vec<PlanView>> {
        self.with_tx(|tx| {
            let mut stmt = tx
                .prepare("SELECT * FROM battle_plans WHERE status = ?1 ORDER BY created_at DESC, id DESC")
                .map_err(map_sql)?;
            let plans: Vec<BattlePlan> = stmt
                .query_map(params![status.as_db_str()], plan_from_row)
                .map_err(map_sql)?
                .collect::<Result<_, _>>()
                .map_err(map_sql)?;
            Ok(plans
                .into_iter()
                .map(|plan| PlanView {
                    content: read_content(&plan.plan_file),
                    plan,
                })
                .collect())
        })
    }

    pub fn update_plan_status(
        &mut self,
        agent: &AgentName,
        plan_id: PlanId,
        status: PlanStatus,
    ) -> MinionResult<()> {
        let agent = agent.clone();
        self.with_tx(|tx| {
            let caller = require_agent(tx, &agent)?;
            if !has_capability(caller.class, Capability::Manage) {
                return Err(minion_core::AuthError::CapabilityMissing {
                    class: caller.class,
                    capability: Capability::Manage,
                    command: "update-plan-status",
                }
                .into());
            }
            let changed = tx
                .execute(
                    "UPDATE battle_plans SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![status.as_db_str(), to_db(now()), plan_id.as_i64()],
                )
                .map_err(map_sql)?;
            if changed == 0 {
                return Err(minion_core::MinionError::invalid(format!(
                    "battle plan #{} not found",
                    plan_id
                )));
            }
            Ok(())
        })
    }

    /// Append an audit entry to the raid log.
    pub fn log(
        &mut self,
        agent: &AgentName,
        entry: &str,
        priority: LogPriority,
    ) -> MinionResult<LogEntry> {
        let agent = agent.clone();
        let entry = entry.to_string();
        let paths = self.paths.clone();
        self.with_tx(|tx| {
            require_agent(tx, &agent)?;
            let ts = now();
            let file = paths.log_file(&agent, priority, ts);
            atomic_write(&file, &entry)?;
            tx.execute(
                "INSERT INTO raid_log (agent_name, entry_file, priority, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    agent.as_str(),
                    file.display().to_string(),
                    priority.as_db_str(),
                    to_db(ts)
                ],
            )
            .map_err(map_sql)?;
            touch_last_seen(tx, &agent)?;
            Ok(LogEntry {
                id: LogEntryId::new(tx.last_insert_rowid()),
                agent: agent.clone(),
                entry_file: file.display().to_string(),
                priority,
                created_at: ts,
            })
        })
    }

    /// Read the raid log in reverse order, bounded by count. Optional
    /// priority and agent filters.
    pub fn get_log(
        &mut self,
        priority: Option<LogPriority>,
        agent: Option<&AgentName>,
        count: usize,
    ) -> MinionResult<Vec<LogView>> {
        let agent = agent.cloned();
        self.with_tx(|tx| {
            let mut sql = String::from("SELECT * FROM raid_log WHERE 1=1");
            let mut args: Vec<String> = Vec::new();
            if let Some(p) = priority {
                sql.push_str(" AND priority = ?");
                args.push(p.as_db_str().to_string());
            }
            if let Some(a) = &agent {
                sql.push_str(" AND agent_name = ?");
                args.push(a.to_string());
            }
            sql.push_str(&format!(" ORDER BY created_at DESC, id DESC LIMIT {}", count));

            let mut stmt = tx.prepare(&sql).map_err(map_sql)?;
            let entries: Vec<LogEntry> = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), log_from_row)
                .map_err(map_sql)?
                .collect::<Result<_, _>>()
                .map_err(map_sql)?;
            Ok(entries
                .into_iter()
                .map(|entry| LogView {
                    content: read_content(&entry.entry_file),
                    entry,
                })
                .collect())
        })
    }
}

/// The active plan with content, if one exists. Shared by cold-start,
/// sitrep, and the daemon's recovery briefing.
pub(crate) fn active_plan(tx: &Transaction<'_>) -> MinionResult<Option<PlanView>> {
    let plan: Option<BattlePlan> = tx
        .query_row(
            "SELECT * FROM battle_plans WHERE status = 'active' ORDER BY created_at DESC, id DESC LIMIT 1",
            [],
            plan_from_row,
        )
        .optional()
        .map_err(map_sql)?;
    Ok(plan.map(|plan| PlanView {
        content: read_content(&plan.plan_file),
        plan,
    }))
}

fn plan_from_row(row: &Row<'_>) -> rusqlite::Result<BattlePlan> {
    let status: String = row.get("status")?;
    Ok(BattlePlan {
        id: PlanId::new(row.get("id")?),
        set_by: AgentName::from(row.get::<_, String>("set_by")?),
        plan_file: row.get("plan_file")?,
        status: PlanStatus::from_db_str(&status).unwrap_or(PlanStatus::Active),
        created_at: opt_from_db(Some(row.get::<_, String>("created_at")?))
            .unwrap_or_else(chrono::Utc::now),
        updated_at: opt_from_db(Some(row.get::<_, String>("updated_at")?))
            .unwrap_or_else(chrono::Utc::now),
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    let priority: String = row.get("priority")?;
    Ok(LogEntry {
        id: LogEntryId::new(row.get("id")?),
        agent: AgentName::from(row.get::<_, String>("agent_name")?),
        entry_file: row.get("entry_file")?,
        priority: LogPriority::from_db_str(&priority).unwrap_or(LogPriority::Normal),
        created_at: opt_from_db(Some(row.get::<_, String>("created_at")?))
            .unwrap_or_else(chrono::Utc::now),
    })
}
