//! Fenix-down knowledge dumps and the cold-start recovery briefing.

use crate::agents::{agent_from_row, require_agent};
use crate::store::{map_sql, now, opt_from_db, to_db};
use crate::tasks::task_from_row;
use crate::warroom::active_plan;
use crate::{PlanView, Store};
use minion_core::{
    AgentName, FenixRecord, FenixRecordId, HpReading, MinionResult, RowIdType, Task,
};
use rusqlite::{params, Row, Transaction};
use serde::{Deserialize, Serialize};
use tracing::info;

/// The recovery briefing handed to a restarted agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColdStart {
    pub agent: AgentName,
    /// Unconsumed knowledge dumps, now stamped consumed.
    pub fenix_records: Vec<FenixRecord>,
    pub battle_plan: Option<PlanView>,
    /// This agent's open tasks.
    pub open_tasks: Vec<Task>,
    pub last_hp: String,
    pub recent_log: Vec<crate::LogView>,
    /// Who else is registered, for orientation.
    pub roster: Vec<(AgentName, String)>,
}

impl Store {
    /// Record a pre-death knowledge dump. Always accepted - a dying agent
    /// with stale context is exactly who needs this to work.
    pub fn fenix_down(
        &mut self,
        agent: &AgentName,
        files: &[String],
        manifest: &str,
    ) -> MinionResult<FenixRecordId> {
        let agent = agent.clone();
        let files: Vec<String> = files.iter().map(|f| f.trim().to_string()).filter(|f| !f.is_empty()).collect();
        let manifest = manifest.to_string();
        self.with_tx(|tx| {
            require_agent(tx, &agent)?;
            if files.is_empty() {
                return Err(minion_core::MinionError::invalid(
                    "no files provided - list the files you wrote this session",
                ));
            }
            let ts = to_db(now());
            tx.execute(
                "INSERT INTO fenix_records (agent_name, files, manifest, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    agent.as_str(),
                    serde_json::to_string(&files).unwrap_or_else(|_| "[]".to_string()),
                    manifest,
                    ts
                ],
            )
            .map_err(map_sql)?;
            let id = FenixRecordId::new(tx.last_insert_rowid());
            tx.execute(
                "UPDATE agents SET status = 'fenix_down', last_seen = ?1 WHERE name = ?2",
                params![ts, agent.as_str()],
            )
            .map_err(map_sql)?;
            info!(agent = %agent, record = %id, files = files.len(), "fenix record written");
            Ok(id)
        })
    }

    /// Build the recovery briefing, atomically consuming this agent's
    /// pending fenix records.
    pub fn cold_start(&mut self, agent: &AgentName) -> MinionResult<ColdStart> {
        let agent = agent.clone();
        self.with_tx(|tx| {
            let row = require_agent(tx, &agent)?;
            let ts = now();

            let mut stmt = tx
                .prepare(
                    "SELECT * FROM fenix_records
                     WHERE agent_name = ?1 AND consumed_at IS NULL
                     ORDER BY created_at DESC, id DESC",
                )
                .map_err(map_sql)?;
            let records: Vec<FenixRecord> = stmt
                .query_map(params![agent.as_str()], fenix_from_row)
                .map_err(map_sql)?
                .collect::<Result<_, _>>()
                .map_err(map_sql)?;
            drop(stmt);

            for record in &records {
                tx.execute(
                    "UPDATE fenix_records SET consumed_at = ?1 WHERE id = ?2",
                    params![to_db(ts), record.id.as_i64()],
                )
                .map_err(map_sql)?;
            }

            let mut stmt = tx
                .prepare(
                    "SELECT * FROM tasks WHERE assigned_to = ?1
                     AND status NOT IN ('closed') ORDER BY updated_at DESC",
                )
                .map_err(map_sql)?;
            let open_tasks: Vec<Task> = stmt
                .query_map(params![agent.as_str()], task_from_row)
                .map_err(map_sql)?
                .collect::<Result<_, _>>()
                .map_err(map_sql)?;
            drop(stmt);

            let mut stmt = tx
                .prepare("SELECT name, status FROM agents ORDER BY last_seen DESC")
                .map_err(map_sql)?;
            let roster: Vec<(AgentName, String)> = stmt
                .query_map([], |r| {
                    Ok((AgentName::from(r.get::<_, String>(0)?), r.get::<_, String>(1)?))
                })
                .map_err(map_sql)?
                .collect::<Result<_, _>>()
                .map_err(map_sql)?;
            drop(stmt);

            let recent_log = recent_log_entries(tx, 20)?;

            tx.execute(
                "UPDATE agents SET last_seen = ?1 WHERE name = ?2",
                params![to_db(ts), agent.as_str()],
            )
            .map_err(map_sql)?;

            Ok(ColdStart {
                agent: agent.clone(),
                fenix_records: records,
                battle_plan: active_plan(tx)?,
                open_tasks,
                last_hp: row.hp.reading().summary(),
                recent_log,
                roster,
            })
        })
    }

    /// Unconsumed fenix records for an agent without consuming them - the
    /// daemon peeks at these to enrich the compaction recovery prompt.
    pub fn peek_fenix(&mut self, agent: &AgentName) -> MinionResult<Vec<FenixRecord>> {
        let agent = agent.clone();
        self.with_tx(|tx| {
            let mut stmt = tx
                .prepare(
                    "SELECT * FROM fenix_records
                     WHERE agent_name = ?1 AND consumed_at IS NULL
                     ORDER BY created_at DESC, id DESC",
                )
                .map_err(map_sql)?;
            let records: Vec<FenixRecord> = stmt
                .query_map(params![agent.as_str()], fenix_from_row)
                .map_err(map_sql)?
                .collect::<Result<_, _>>()
                .map_err(map_sql)?;
            Ok(records)
        })
    }

    /// Last HP summary for an agent, `HP unknown` when unregistered.
    pub fn last_hp(&mut self, agent: &AgentName) -> MinionResult<String> {
        let agent = agent.clone();
        self.with_tx(|tx| {
            let row = tx
                .query_row(
                    "SELECT * FROM agents WHERE name = ?1",
                    params![agent.as_str()],
                    agent_from_row,
                )
                .map_err(map_sql);
            Ok(match row {
                Ok(a) => a.hp.reading().summary(),
                Err(_) => HpReading::Unknown.summary(),
            })
        })
    }
}

pub(crate) fn recent_log_entries(
    tx: &Transaction<'_>,
    count: usize,
) -> MinionResult<Vec<crate::LogView>> {
    let mut stmt = tx
        .prepare("SELECT * FROM raid_log ORDER BY created_at DESC, id DESC LIMIT ?1")
        .map_err(map_sql)?;
    let entries = stmt
        .query_map(params![count as i64], |row| {
            let priority: String = row.get("priority")?;
            Ok(minion_core::LogEntry {
                id: minion_core::LogEntryId::new(row.get("id")?),
                agent: AgentName::from(row.get::<_, String>("agent_name")?),
                entry_file: row.get("entry_file")?,
                priority: minion_core::LogPriority::from_db_str(&priority)
                    .unwrap_or(minion_core::LogPriority::Normal),
                created_at: opt_from_db(Some(row.get::<_, String>("created_at")?))
                    .unwrap_or_else(chrono::Utc::now),
            })
        })
        .map_err(map_sql)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(map_sql)?;
    Ok(entries
        .into_iter()
        .map(|entry| crate::LogView {
            content: crate::read_content(&entry.entry_file),
            entry,
        })
        .collect())
}

fn fenix_from_row(row: &Row<'_>) -> rusqlite::Result<FenixRecord> {
    let files_raw: String = row.get("files")?;
    Ok(FenixRecord {
        id: FenixRecordId::new(row.get("id")?),
        agent: AgentName::from(row.get::<_, String>("agent_name")?),
        files: serde_json::from_str(&files_raw).unwrap_or_default(),
        manifest: row.get("manifest")?,
        created_at: opt_from_db(Some(row.get::<_, String>("created_at")?))
            .unwrap_or_else(chrono::Utc::now),
        consumed_at: opt_from_db(row.get("consumed_at")?),
    })
}
