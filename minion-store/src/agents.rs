//! Agent registry - register, deregister, rename, status, context freshness.

use crate::store::{from_db, map_sql, now, opt_from_db, to_db};
use crate::Store;
use chrono::{DateTime, Duration, Utc};
use minion_core::{
    liveness, staleness_window, Agent, AgentClass, AgentName, AgentView, HpMode, HpTelemetry,
    MinionResult, PreconditionError, Transport,
};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Result of an idempotent register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub agent: AgentName,
    pub class: AgentClass,
    pub transport: Transport,
    /// True when the name already existed and was refreshed in place.
    pub refreshed: bool,
}

/// Inputs for set-context.
#[derive(Debug, Clone, Default)]
pub struct ContextUpdate {
    pub context: String,
    pub tokens_used: Option<u64>,
    pub tokens_limit: Option<u64>,
    /// Self-reported HP percentage; switches the agent to self-reported mode.
    pub hp: Option<u8>,
    pub files_modified: Vec<String>,
}

/// What set-context reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextOutcome {
    pub agent: AgentName,
    pub hp_summary: Option<String>,
    /// Files the agent says it modified without holding a claim.
    pub unclaimed_files: Vec<String>,
}

impl Store {
    /// Register an agent. Idempotent on name: re-register refreshes class,
    /// model, transport, and last_seen, clears any retire record, and
    /// auto-dismisses broadcasts older than an hour so a late joiner is not
    /// buried in history.
    pub fn register(
        &mut self,
        name: &AgentName,
        class: AgentClass,
        model: Option<&str>,
        transport: Transport,
        description: Option<&str>,
    ) -> MinionResult<Registration> {
        let name = name.clone();
        self.with_tx(|tx| {
            let ts = now();
            let existing: Option<String> = tx
                .query_row(
                    "SELECT name FROM agents WHERE name = ?1",
                    params![name.as_str()],
                    |r| r.get(0),
                )
                .optional()
                .map_err(map_sql)?;

            tx.execute(
                "INSERT INTO agents (name, agent_class, model, transport, description, status, registered_at, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'waiting for work', ?6, ?6)
                 ON CONFLICT(name) DO UPDATE SET
                    agent_class     = excluded.agent_class,
                    model           = COALESCE(excluded.model, agents.model),
                    transport       = excluded.transport,
                    description     = COALESCE(excluded.description, agents.description),
                    status          = 'waiting for work',
                    last_seen       = excluded.last_seen,
                    hp_alerts_fired = NULL",
                params![
                    name.as_str(),
                    class.as_db_str(),
                    model,
                    transport.as_db_str(),
                    description,
                    to_db(ts),
                ],
            )
            .map_err(map_sql)?;

            // A re-spawned agent is no longer retired.
            tx.execute(
                "DELETE FROM agent_retire WHERE agent_name = ?1",
                params![name.as_str()],
            )
            .map_err(map_sql)?;

            let cutoff = to_db(ts - Duration::hours(1));
            tx.execute(
                "INSERT OR IGNORE INTO broadcast_reads (agent_name, message_id)
                 SELECT ?1, id FROM messages WHERE to_agent = 'all' AND timestamp < ?2",
                params![name.as_str(), cutoff],
            )
            .map_err(map_sql)?;

            info!(agent = %name, class = %class, "registered");
            Ok(Registration {
                agent: name.clone(),
                class,
                transport,
                refreshed: existing.is_some(),
            })
        })
    }

    /// Remove an agent, releasing every claim it holds and dropping it from
    /// all waitlists. Returns the released file paths.
    pub fn deregister(&mut self, name: &AgentName) -> MinionResult<Vec<String>> {
        let name = name.clone();
        self.with_tx(|tx| {
            require_agent(tx, &name)?;

            let mut stmt = tx
                .prepare("SELECT file_path FROM file_claims WHERE agent_name = ?1")
                .map_err(map_sql)?;
            let held: Vec<String> = stmt
                .query_map(params![name.as_str()], |r| r.get(0))
                .map_err(map_sql)?
                .collect::<Result<_, _>>()
                .map_err(map_sql)?;
            drop(stmt);

            for path in &held {
                crate::claims::handoff_or_remove(tx, path)?;
            }
            tx.execute(
                "DELETE FROM file_waitlist WHERE agent_name = ?1",
                params![name.as_str()],
            )
            .map_err(map_sql)?;
            tx.execute("DELETE FROM agents WHERE name = ?1", params![name.as_str()])
                .map_err(map_sql)?;

            info!(agent = %name, released = held.len(), "deregistered");
            Ok(held)
        })
    }

    /// Rename an agent, rewriting message addressing so history follows.
    pub fn rename(&mut self, old: &AgentName, new: &AgentName) -> MinionResult<()> {
        let (old, new) = (old.clone(), new.clone());
        self.with_tx(|tx| {
            require_agent(tx, &old)?;
            let clash: Option<String> = tx
                .query_row(
                    "SELECT name FROM agents WHERE name = ?1",
                    params![new.as_str()],
                    |r| r.get(0),
                )
                .optional()
                .map_err(map_sql)?;
            if clash.is_some() {
                return Err(minion_core::MinionError::invalid(format!(
                    "agent '{}' already exists",
                    new
                )));
            }
            for sql in [
                "UPDATE agents SET name = ?1 WHERE name = ?2",
                "UPDATE messages SET from_agent = ?1 WHERE from_agent = ?2",
                "UPDATE messages SET to_agent = ?1 WHERE to_agent = ?2",
                "UPDATE messages SET cc_original_to = ?1 WHERE cc_original_to = ?2",
                "UPDATE broadcast_reads SET agent_name = ?1 WHERE agent_name = ?2",
                "UPDATE tasks SET assigned_to = ?1 WHERE assigned_to = ?2",
                "UPDATE file_claims SET agent_name = ?1 WHERE agent_name = ?2",
                "UPDATE file_waitlist SET agent_name = ?1 WHERE agent_name = ?2",
            ] {
                tx.execute(sql, params![new.as_str(), old.as_str()])
                    .map_err(map_sql)?;
            }
            Ok(())
        })
    }

    /// Point an agent at a zone (and optionally a role within it).
    pub fn set_zone(
        &mut self,
        name: &AgentName,
        zone: Option<&str>,
        role: Option<&str>,
    ) -> MinionResult<()> {
        let name = name.clone();
        let zone = zone.map(str::to_string);
        let role = role.map(str::to_string);
        self.with_tx(|tx| {
            require_agent(tx, &name)?;
            tx.execute(
                "UPDATE agents SET current_zone = ?1, current_role = COALESCE(?2, current_role),
                    last_seen = ?3 WHERE name = ?4",
                params![zone, role, to_db(now()), name.as_str()],
            )
            .map_err(map_sql)?;
            Ok(())
        })
    }

    pub fn set_status(&mut self, name: &AgentName, status: &str) -> MinionResult<()> {
        let name = name.clone();
        let status = status.to_string();
        self.with_tx(|tx| {
            require_agent(tx, &name)?;
            tx.execute(
                "UPDATE agents SET status = ?1, last_seen = ?2 WHERE name = ?3",
                params![status, to_db(now()), name.as_str()],
            )
            .map_err(map_sql)?;
            Ok(())
        })
    }

    /// Update context summary and touch `context_updated_at`. Supplying
    /// `--hp` switches the agent to self-reported mode; daemon telemetry is
    /// ignored until the next provider turn.
    pub fn set_context(&mut self, name: &AgentName, update: &ContextUpdate) -> MinionResult<ContextOutcome> {
        let name = name.clone();
        let update = update.clone();
        let paths = self.paths.clone();
        self.with_tx(|tx| {
            require_agent(tx, &name)?;
            let ts = to_db(now());

            let hp_summary = if let Some(hp) = update.hp {
                let hp = hp.min(100);
                // Stored as a percentage against a nominal 100 limit, valid
                // only together with hp_mode = self_reported.
                let turn_input = (100 - hp).max(1) as i64;
                tx.execute(
                    "UPDATE agents SET context_summary = ?1, context_updated_at = ?2,
                        last_seen = ?2, hp_mode = 'self_reported', hp_turn_input = ?3,
                        hp_tokens_limit = 100, hp_updated_at = ?2
                     WHERE name = ?4",
                    params![update.context, ts, turn_input, name.as_str()],
                )
                .map_err(map_sql)?;
                crate::monitoring::fire_hp_alerts(tx, &paths, &name, hp)?;
                Some(minion_core::HpReading::compute(u64::from(100 - hp), 100).summary())
            } else {
                tx.execute(
                    "UPDATE agents SET context_summary = ?1, context_updated_at = ?2, last_seen = ?2
                     WHERE name = ?3",
                    params![update.context, ts, name.as_str()],
                )
                .map_err(map_sql)?;
                match (update.tokens_used, update.tokens_limit) {
                    (Some(used), Some(limit)) if limit > 0 => {
                        Some(minion_core::HpReading::compute(used, limit).summary())
                    }
                    _ => None,
                }
            };

            // Warn about files edited without a claim; advisory only.
            let mut unclaimed = Vec::new();
            for file in &update.files_modified {
                let holder: Option<String> = tx
                    .query_row(
                        "SELECT agent_name FROM file_claims WHERE file_path = ?1",
                        params![file],
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(map_sql)?;
                if holder.as_deref() != Some(name.as_str()) {
                    unclaimed.push(file.clone());
                }
            }

            Ok(ContextOutcome {
                agent: name.clone(),
                hp_summary,
                unclaimed_files: unclaimed,
            })
        })
    }

    /// All registered agents with computed liveness and HP summaries.
    pub fn who(&mut self) -> MinionResult<Vec<AgentView>> {
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
            Ok(agents.into_iter().map(|a| enrich(a, ts)).collect())
        })
    }

    pub fn get_agent(&mut self, name: &AgentName) -> MinionResult<Option<Agent>> {
        let name = name.clone();
        self.with_tx(|tx| lookup_agent(tx, &name))
    }
}

/// Compute the enriched view used by `who` and the dashboards.
pub(crate) fn enrich(agent: Agent, at: DateTime<Utc>) -> AgentView {
    let live = liveness(agent.last_seen, at);
    let stale = match agent.context_updated_at {
        None => true,
        Some(updated) => {
            (at - updated).num_seconds() > staleness_window(agent.class).as_secs() as i64
        }
    };
    AgentView {
        hp_summary: agent.hp.reading().summary(),
        liveness: live,
        context_stale: stale,
        agent,
    }
}

/// Fetch an agent row or fail with `UnknownAgent`.
pub(crate) fn require_agent(tx: &Transaction<'_>, name: &AgentName) -> MinionResult<Agent> {
    lookup_agent(tx, name)?.ok_or_else(|| {
        PreconditionError::UnknownAgent {
            name: name.to_string(),
        }
        .into()
    })
}

pub(crate) fn lookup_agent(tx: &Transaction<'_>, name: &AgentName) -> MinionResult<Option<Agent>> {
    tx.query_row(
        "SELECT * FROM agents WHERE name = ?1",
        params![name.as_str()],
        agent_from_row,
    )
    .optional()
    .map_err(map_sql)
}

/// First registered lead, if any. The auto-CC and alert targets.
pub(crate) fn find_lead(tx: &Transaction<'_>) -> MinionResult<Option<AgentName>> {
    tx.query_row(
        "SELECT name FROM agents WHERE agent_class = 'lead' ORDER BY registered_at ASC LIMIT 1",
        [],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(map_sql)
    .map(|opt| opt.map(AgentName::from))
}

/// Blocked-sender staleness check. `None` means fresh.
pub(crate) fn staleness_violation(agent: &Agent, at: DateTime<Utc>) -> Option<PreconditionError> {
    let threshold = staleness_window(agent.class).as_secs() as i64;
    let age = match agent.context_updated_at {
        None => i64::MAX,
        Some(updated) => (at - updated).num_seconds(),
    };
    if age > threshold {
        Some(PreconditionError::StaleContext {
            class: agent.class,
            age_secs: age.min(99 * 3600),
            threshold_secs: threshold,
        })
    } else {
        None
    }
}

pub(crate) fn touch_last_seen(tx: &Transaction<'_>, name: &AgentName) -> MinionResult<()> {
    tx.execute(
        "UPDATE agents SET last_seen = ?1 WHERE name = ?2",
        params![to_db(now()), name.as_str()],
    )
    .map_err(map_sql)?;
    Ok(())
}

pub(crate) fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let class: String = row.get("agent_class")?;
    let transport: String = row.get("transport")?;
    let hp_mode: String = row.get("hp_mode")?;
    let alerts_raw: Option<String> = row.get("hp_alerts_fired")?;
    let alerts_fired: Vec<u8> = alerts_raw
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();

    Ok(Agent {
        name: AgentName::from(row.get::<_, String>("name")?),
        class: AgentClass::from_db_str(&class).unwrap_or(AgentClass::Coder),
        model: row.get("model")?,
        transport: Transport::from_db_str(&transport).unwrap_or(Transport::Terminal),
        status: row.get("status")?,
        description: row.get("description")?,
        context_summary: row.get("context_summary")?,
        context_updated_at: opt_from_db(row.get("context_updated_at")?),
        last_seen: opt_from_db(row.get("last_seen")?),
        last_inbox_check: opt_from_db(row.get("last_inbox_check")?),
        registered_at: from_db(&row.get::<_, String>("registered_at")?).unwrap_or_else(Utc::now),
        current_zone: row.get("current_zone")?,
        current_role: row.get("current_role")?,
        pid: row.get("pid")?,
        session_id: row.get("session_id")?,
        hp: HpTelemetry {
            mode: HpMode::from_db_str(&hp_mode).unwrap_or(HpMode::None),
            input_tokens: row.get::<_, Option<i64>>("hp_input_tokens")?.map(|v| v.max(0) as u64),
            output_tokens: row.get::<_, Option<i64>>("hp_output_tokens")?.map(|v| v.max(0) as u64),
            turn_input: row.get::<_, Option<i64>>("hp_turn_input")?.map(|v| v.max(0) as u64),
            turn_output: row.get::<_, Option<i64>>("hp_turn_output")?.map(|v| v.max(0) as u64),
            tokens_limit: row.get::<_, Option<i64>>("hp_tokens_limit")?.map(|v| v.max(0) as u64),
            updated_at: opt_from_db(row.get("hp_updated_at")?),
            alerts_fired,
        },
    })
}
