//! Monitoring - HP telemetry writes, threshold alerts, and fused pictures.

use crate::agents::{agent_from_row, enrich, find_lead, require_agent};
use crate::messages::insert_system_message;
use crate::store::{map_sql, now, to_db};
use crate::tasks::task_from_row;
use crate::warroom::active_plan;
use crate::{PlanView, Store, WorkPaths};
use chrono::{DateTime, Utc};
use minion_core::{
    alerts_to_fire, clears_alerts, AgentName, AgentView, FileClaim, HpMode, HpReading,
    MinionResult, Task,
};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// One daemon-observed telemetry sample for an agent's turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HpSample {
    /// Cumulative session input tokens (accounting only).
    pub input_tokens: u64,
    /// Cumulative session output tokens (accounting only).
    pub output_tokens: u64,
    /// Context-window limit the turn ran against.
    pub limit: u64,
    pub turn_input: Option<u64>,
    pub turn_output: Option<u64>,
}

/// What update-hp reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HpWriteOutcome {
    pub agent: AgentName,
    pub hp: String,
    /// The write was skipped because the agent is in self-reported mode.
    pub skipped_self_reported: bool,
    pub alerts_fired: Vec<u8>,
}

/// Fused common operating picture for `sitrep`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sitrep {
    pub agents: Vec<AgentView>,
    pub active_tasks: Vec<Task>,
    pub file_claims: Vec<FileClaim>,
    pub flags: Vec<serde_json::Value>,
    pub battle_plan: Option<PlanView>,
    pub recent_comms: Vec<serde_json::Value>,
}

/// Activity judgment for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityReport {
    pub agent: AgentName,
    pub status: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub active_tasks: Vec<Task>,
    pub claimed_files: Vec<FileClaim>,
    /// "active", "idle", or "possibly dead", judged from task updates and
    /// claim mtimes, not just heartbeats.
    pub judgment: String,
}

/// Freshness of files against an agent's last set-context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshnessReport {
    pub agent: AgentName,
    pub context_updated_at: Option<DateTime<Utc>>,
    pub files: Vec<FileFreshness>,
    pub stale_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFreshness {
    pub file_path: String,
    pub exists: bool,
    pub mtime: Option<DateTime<Utc>>,
    /// Modified after the agent last refreshed its context.
    pub stale: bool,
}

impl Store {
    /// Daemon-only HP write. Ignored while the agent self-reports; threshold
    /// alerts to the lead ride in the same transaction as the telemetry row.
    pub fn update_hp(&mut self, agent: &AgentName, sample: &HpSample) -> MinionResult<HpWriteOutcome> {
        let agent = agent.clone();
        let sample = *sample;
        let paths = self.paths.clone();
        self.with_tx(|tx| {
            let row = require_agent(tx, &agent)?;
            // A self-report wins until the next completed provider turn. A
            // turn-bearing sample is that turn; turnless writes (generation
            // resets) defer to the agent's own report.
            let observed_turn = sample.turn_input.map(|t| t > 0).unwrap_or(false);
            if row.hp.mode == HpMode::SelfReported && !observed_turn {
                return Ok(HpWriteOutcome {
                    agent: agent.clone(),
                    hp: row.hp.reading().summary(),
                    skipped_self_reported: true,
                    alerts_fired: Vec::new(),
                });
            }

            let ts = to_db(now());
            tx.execute(
                "UPDATE agents SET hp_mode = 'daemon', hp_input_tokens = ?1,
                    hp_output_tokens = ?2, hp_tokens_limit = ?3, hp_turn_input = ?4,
                    hp_turn_output = ?5, hp_updated_at = ?6, last_seen = ?6
                 WHERE name = ?7",
                params![
                    sample.input_tokens as i64,
                    sample.output_tokens as i64,
                    sample.limit as i64,
                    sample.turn_input.map(|v| v as i64),
                    sample.turn_output.map(|v| v as i64),
                    ts,
                    agent.as_str(),
                ],
            )
            .map_err(map_sql)?;

            let reading = HpReading::from_telemetry(
                HpMode::Daemon,
                sample.turn_input,
                Some(sample.input_tokens),
                Some(sample.limit),
            );
            let alerts = match reading.pct() {
                Some(pct) => fire_hp_alerts(tx, &paths, &agent, pct)?,
                None => Vec::new(),
            };

            Ok(HpWriteOutcome {
                agent: agent.clone(),
                hp: reading.summary(),
                skipped_self_reported: false,
                alerts_fired: alerts,
            })
        })
    }

    /// The full party dashboard: every agent enriched with open-task counts
    /// and claim holdings.
    pub fn party_status(&mut self) -> MinionResult<Vec<serde_json::Value>> {
        self.with_tx(|tx| {
            let ts = now();
            let mut stmt = tx
                .prepare("SELECT * FROM agents ORDER BY last_seen DESC")
                .map_err(map_sql)?;
            let agents = stmt
                .query_map([], agent_from_row)
                .map_err(map_sql)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_sql)?;
            drop(stmt);

            let mut out = Vec::new();
            for agent in agents {
                let name = agent.name.to_string();
                let (open_tasks, total_activity): (i64, i64) = tx
                    .query_row(
                        "SELECT COUNT(*), COALESCE(SUM(activity_count), 0) FROM tasks
                         WHERE assigned_to = ?1 AND status NOT IN ('closed')",
                        params![name],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .map_err(map_sql)?;
                let claims: i64 = tx
                    .query_row(
                        "SELECT COUNT(*) FROM file_claims WHERE agent_name = ?1",
                        params![name],
                        |r| r.get(0),
                    )
                    .map_err(map_sql)?;
                let view = enrich(agent, ts);
                let mut value = serde_json::to_value(&view).unwrap_or_default();
                if let Some(obj) = value.as_object_mut() {
                    obj.insert("open_tasks".into(), open_tasks.into());
                    obj.insert("total_activity".into(), total_activity.into());
                    obj.insert("claimed_files".into(), claims.into());
                }
                out.push(value);
            }
            Ok(out)
        })
    }

    /// Fused picture: agents, active tasks, claims, flags, plan, recent
    /// comms. One call, one consistent snapshot.
    pub fn sitrep(&mut self) -> MinionResult<Sitrep> {
        self.with_tx(|tx| {
            let ts = now();
            let mut stmt = tx
                .prepare("SELECT * FROM agents ORDER BY last_seen DESC")
                .map_err(map_sql)?;
            let agents: Vec<AgentView> = stmt
                .query_map([], agent_from_row)
                .map_err(map_sql)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_sql)?
                .into_iter()
                .map(|a| enrich(a, ts))
                .collect();
            drop(stmt);

            let mut stmt = tx
                .prepare(
                    "SELECT * FROM tasks WHERE status NOT IN ('closed') ORDER BY updated_at DESC",
                )
                .map_err(map_sql)?;
            let active_tasks = stmt
                .query_map([], task_from_row)
                .map_err(map_sql)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_sql)?;
            drop(stmt);

            let mut stmt = tx
                .prepare("SELECT file_path, agent_name, claimed_at FROM file_claims ORDER BY agent_name")
                .map_err(map_sql)?;
            let file_claims = stmt
                .query_map([], |row| {
                    Ok(FileClaim {
                        file_path: row.get(0)?,
                        holder: AgentName::from(row.get::<_, String>(1)?),
                        acquired_at: crate::store::opt_from_db(Some(row.get::<_, String>(2)?))
                            .unwrap_or_else(Utc::now),
                    })
                })
                .map_err(map_sql)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_sql)?;
            drop(stmt);

            let mut stmt = tx
                .prepare("SELECT key, value, set_by, set_at FROM flags")
                .map_err(map_sql)?;
            let flags = stmt
                .query_map([], |row| {
                    Ok(serde_json::json!({
                        "key": row.get::<_, String>(0)?,
                        "value": row.get::<_, String>(1)?,
                        "set_by": row.get::<_, String>(2)?,
                        "set_at": row.get::<_, String>(3)?,
                    }))
                })
                .map_err(map_sql)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_sql)?;
            drop(stmt);

            let mut stmt = tx
                .prepare(
                    "SELECT from_agent, to_agent, timestamp, is_cc FROM messages
                     ORDER BY timestamp DESC, id DESC LIMIT 10",
                )
                .map_err(map_sql)?;
            let mut recent_comms = stmt
                .query_map([], |row| {
                    Ok(serde_json::json!({
                        "from": row.get::<_, String>(0)?,
                        "to": row.get::<_, String>(1)?,
                        "timestamp": row.get::<_, String>(2)?,
                        "is_cc": row.get::<_, i64>(3)? != 0,
                    }))
                })
                .map_err(map_sql)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_sql)?;
            recent_comms.reverse();
            drop(stmt);

            Ok(Sitrep {
                agents,
                active_tasks,
                file_claims,
                flags,
                battle_plan: active_plan(tx)?,
                recent_comms,
            })
        })
    }

    /// Judge one agent's activity from heartbeats, task updates, and the
    /// mtimes of its claimed files.
    pub fn check_activity(&mut self, agent: &AgentName) -> MinionResult<ActivityReport> {
        let agent = agent.clone();
        self.with_tx(|tx| {
            let row = require_agent(tx, &agent)?;

            let mut stmt = tx
                .prepare(
                    "SELECT * FROM tasks WHERE assigned_to = ?1 AND status NOT IN ('closed')
                     ORDER BY updated_at DESC",
                )
                .map_err(map_sql)?;
            let active_tasks: Vec<Task> = stmt
                .query_map(params![agent.as_str()], task_from_row)
                .map_err(map_sql)?
                .collect::<Result<_, _>>()
                .map_err(map_sql)?;
            drop(stmt);

            let mut stmt = tx
                .prepare("SELECT file_path, agent_name, claimed_at FROM file_claims WHERE agent_name = ?1")
                .map_err(map_sql)?;
            let claimed_files: Vec<FileClaim> = stmt
                .query_map(params![agent.as_str()], |r| {
                    Ok(FileClaim {
                        file_path: r.get(0)?,
                        holder: AgentName::from(r.get::<_, String>(1)?),
                        acquired_at: crate::store::opt_from_db(Some(r.get::<_, String>(2)?))
                            .unwrap_or_else(Utc::now),
                    })
                })
                .map_err(map_sql)?
                .collect::<Result<_, _>>()
                .map_err(map_sql)?;
            drop(stmt);

            let ts = now();
            let claim_mtimes: Vec<DateTime<Utc>> = claimed_files
                .iter()
                .filter_map(|c| file_mtime(&c.file_path))
                .collect();
            let last_task_update = active_tasks.first().map(|t| t.updated_at);
            let judgment = judge_activity(ts, row.last_seen, last_task_update, &claim_mtimes);

            Ok(ActivityReport {
                agent: agent.clone(),
                status: row.status.clone(),
                last_seen: row.last_seen,
                active_tasks,
                claimed_files,
                judgment: judgment.to_string(),
            })
        })
    }

    /// Compare file mtimes against the agent's context_updated_at. A file
    /// newer than the context means the agent is reasoning from stale reads.
    pub fn check_freshness(&mut self, agent: &AgentName, files: &[String]) -> MinionResult<FreshnessReport> {
        let agent = agent.clone();
        let files: Vec<String> = files.to_vec();
        self.with_tx(|tx| {
            let row = require_agent(tx, &agent)?;
            let context_ts = row.context_updated_at;

            let mut out = Vec::new();
            let mut stale_count = 0usize;
            for fp in &files {
                let exists = std::path::Path::new(fp).exists();
                let mtime = file_mtime(fp);
                let stale = match (context_ts, mtime) {
                    (Some(ctx), Some(mt)) => mt > ctx,
                    // Never set context: everything readable counts stale.
                    (None, _) => exists,
                    _ => false,
                };
                if stale && exists {
                    stale_count += 1;
                }
                out.push(FileFreshness {
                    file_path: fp.clone(),
                    exists,
                    mtime,
                    stale,
                });
            }

            Ok(FreshnessReport {
                agent: agent.clone(),
                context_updated_at: context_ts,
                files: out,
                stale_count,
            })
        })
    }
}

/// Fire any newly-crossed HP thresholds for an agent: a system message to
/// the lead inside the caller's transaction, and the fired set persisted so
/// each threshold alerts at most once per run. Recovery above 50% re-arms.
pub(crate) fn fire_hp_alerts(
    tx: &Transaction<'_>,
    paths: &WorkPaths,
    agent: &AgentName,
    pct: u8,
) -> MinionResult<Vec<u8>> {
    let fired_raw: Option<String> = tx
        .query_row(
            "SELECT hp_alerts_fired FROM agents WHERE name = ?1",
            params![agent.as_str()],
            |r| r.get(0),
        )
        .optional()
        .map_err(map_sql)?
        .flatten();
    let mut fired: Vec<u8> = fired_raw
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();

    if clears_alerts(pct) {
        if !fired.is_empty() {
            tx.execute(
                "UPDATE agents SET hp_alerts_fired = NULL WHERE name = ?1",
                params![agent.as_str()],
            )
            .map_err(map_sql)?;
        }
        return Ok(Vec::new());
    }

    let to_fire = alerts_to_fire(pct, &fired);
    if to_fire.is_empty() {
        return Ok(Vec::new());
    }

    let lead = match find_lead(tx)? {
        Some(lead) => lead,
        None => {
            warn!(agent = %agent, pct, "HP threshold crossed but no lead registered");
            return Ok(Vec::new());
        }
    };

    for threshold in &to_fire {
        let body = match threshold {
            10 => format!("{} at {}% HP - fenix-down NOW or lose knowledge", agent, pct),
            _ => format!("{} at {}% HP - consider fenix-down", agent, pct),
        };
        insert_system_message(tx, paths, &lead, &body)?;
        info!(agent = %agent, threshold, pct, "HP alert sent to lead");
        fired.push(*threshold);
    }

    tx.execute(
        "UPDATE agents SET hp_alerts_fired = ?1 WHERE name = ?2",
        params![serde_json::to_string(&fired).unwrap_or_default(), agent.as_str()],
    )
    .map_err(map_sql)?;

    Ok(to_fire)
}

fn judge_activity(
    at: DateTime<Utc>,
    last_seen: Option<DateTime<Utc>>,
    last_task_update: Option<DateTime<Utc>>,
    claim_mtimes: &[DateTime<Utc>],
) -> &'static str {
    for mt in claim_mtimes {
        if (at - *mt).num_seconds() < 5 * 60 {
            return "active";
        }
    }
    for probe in [last_seen, last_task_update].into_iter().flatten() {
        let mins = (at - probe).num_seconds() / 60;
        if mins < 5 {
            return "active";
        }
        if mins < 15 {
            return "idle";
        }
    }
    "possibly dead"
}

fn file_mtime(path: &str) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn judgment_prefers_recent_claim_writes() {
        let at = Utc::now();
        let old = Some(at - Duration::minutes(30));
        assert_eq!(judge_activity(at, old, None, &[at - Duration::minutes(1)]), "active");
        assert_eq!(judge_activity(at, old, None, &[]), "possibly dead");
        assert_eq!(
            judge_activity(at, Some(at - Duration::minutes(10)), None, &[]),
            "idle"
        );
    }
}
