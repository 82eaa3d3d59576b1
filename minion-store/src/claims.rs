//! File claim service - exclusive cooperative locks with FIFO waitlists.

use crate::agents::{require_agent, touch_last_seen};
use crate::store::{map_sql, now, opt_from_db, to_db};
use crate::Store;
use minion_core::{
    has_capability, AgentName, Capability, FileClaim, MinionResult, PreconditionError,
    WaitlistEntry,
};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Outcome of a claim attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClaimOutcome {
    /// The caller now holds (or already held) the claim.
    Granted { file: String, refreshed: bool },
    /// Someone else holds it; the caller is enqueued.
    Waitlisted {
        file: String,
        holder: AgentName,
        position: usize,
    },
}

/// Outcome of a release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    pub file: String,
    pub was_held_by: AgentName,
    pub forced: bool,
    /// The waitlist head promoted to holder, if any.
    pub handed_to: Option<AgentName>,
}

impl Store {
    /// Claim a file for exclusive editing. Idempotent for the holder;
    /// everyone else joins a FIFO waitlist.
    pub fn claim_file(&mut self, agent: &AgentName, file: &str) -> MinionResult<ClaimOutcome> {
        let agent = agent.clone();
        let file = normalize_path(file);
        self.with_tx(|tx| {
            require_agent(tx, &agent)?;
            let ts = to_db(now());

            let holder: Option<String> = tx
                .query_row(
                    "SELECT agent_name FROM file_claims WHERE file_path = ?1",
                    params![file],
                    |r| r.get(0),
                )
                .optional()
                .map_err(map_sql)?;

            match holder {
                None => {
                    tx.execute(
                        "INSERT INTO file_claims (file_path, agent_name, claimed_at) VALUES (?1, ?2, ?3)",
                        params![file, agent.as_str(), ts],
                    )
                    .map_err(map_sql)?;
                    touch_last_seen(tx, &agent)?;
                    info!(agent = %agent, file = %file, "claim granted");
                    Ok(ClaimOutcome::Granted { file: file.clone(), refreshed: false })
                }
                Some(h) if h == agent.as_str() => {
                    tx.execute(
                        "UPDATE file_claims SET claimed_at = ?1 WHERE file_path = ?2",
                        params![ts, file],
                    )
                    .map_err(map_sql)?;
                    Ok(ClaimOutcome::Granted { file: file.clone(), refreshed: true })
                }
                Some(h) => {
                    tx.execute(
                        "INSERT OR IGNORE INTO file_waitlist (file_path, agent_name, added_at)
                         VALUES (?1, ?2, ?3)",
                        params![file, agent.as_str(), ts],
                    )
                    .map_err(map_sql)?;
                    let position: i64 = tx
                        .query_row(
                            "SELECT COUNT(*) FROM file_waitlist w1
                             WHERE w1.file_path = ?1 AND w1.id <= (
                                SELECT id FROM file_waitlist
                                WHERE file_path = ?1 AND agent_name = ?2)",
                            params![file, agent.as_str()],
                            |r| r.get(0),
                        )
                        .map_err(map_sql)?;
                    Ok(ClaimOutcome::Waitlisted {
                        file: file.clone(),
                        holder: AgentName::from(h),
                        position: position.max(1) as usize,
                    })
                }
            }
        })
    }

    /// Release a claim. Only the holder may release; a lead may force it
    /// when a holder has gone quiet. The waitlist head, if any, is promoted
    /// in the same transaction with a fresh `claimed_at`.
    pub fn release_file(
        &mut self,
        agent: &AgentName,
        file: &str,
        force: bool,
    ) -> MinionResult<ReleaseOutcome> {
        let agent = agent.clone();
        let file = normalize_path(file);
        self.with_tx(|tx| {
            let caller = require_agent(tx, &agent)?;

            let holder: Option<String> = tx
                .query_row(
                    "SELECT agent_name FROM file_claims WHERE file_path = ?1",
                    params![file],
                    |r| r.get(0),
                )
                .optional()
                .map_err(map_sql)?;
            let holder = match holder {
                Some(h) => h,
                None => {
                    return Err(minion_core::MinionError::invalid(format!(
                        "file '{}' is not claimed by anyone",
                        file
                    )))
                }
            };

            let forced = holder != agent.as_str();
            if forced && !(force && has_capability(caller.class, Capability::Manage)) {
                return Err(PreconditionError::ClaimHeld {
                    file: file.clone(),
                    holder: holder.clone(),
                    position: 0,
                }
                .into());
            }

            let handed_to = handoff_or_remove(tx, &file)?;
            touch_last_seen(tx, &agent)?;
            info!(agent = %agent, file = %file, forced, handed_to = ?handed_to, "claim released");

            Ok(ReleaseOutcome {
                file: file.clone(),
                was_held_by: AgentName::from(holder),
                forced,
                handed_to,
            })
        })
    }

    /// All claims plus waitlists, for `list-claims`.
    pub fn list_claims(&mut self) -> MinionResult<(Vec<FileClaim>, Vec<WaitlistEntry>)> {
        self.with_tx(|tx| {
            let mut stmt = tx
                .prepare("SELECT file_path, agent_name, claimed_at FROM file_claims ORDER BY file_path")
                .map_err(map_sql)?;
            let claims: Vec<FileClaim> = stmt
                .query_map([], |row| {
                    Ok(FileClaim {
                        file_path: row.get(0)?,
                        holder: AgentName::from(row.get::<_, String>(1)?),
                        acquired_at: opt_from_db(Some(row.get::<_, String>(2)?))
                            .unwrap_or_else(chrono::Utc::now),
                    })
                })
                .map_err(map_sql)?
                .collect::<Result<_, _>>()
                .map_err(map_sql)?;
            drop(stmt);

            let mut stmt = tx
                .prepare(
                    "SELECT file_path, agent_name, added_at FROM file_waitlist
                     ORDER BY file_path, id",
                )
                .map_err(map_sql)?;
            let waitlist: Vec<WaitlistEntry> = stmt
                .query_map([], |row| {
                    Ok(WaitlistEntry {
                        file_path: row.get(0)?,
                        agent: AgentName::from(row.get::<_, String>(1)?),
                        requested_at: opt_from_db(Some(row.get::<_, String>(2)?))
                            .unwrap_or_else(chrono::Utc::now),
                    })
                })
                .map_err(map_sql)?
                .collect::<Result<_, _>>()
                .map_err(map_sql)?;

            Ok((claims, waitlist))
        })
    }
}

/// Remove a claim row, promoting the earliest waiter to holder. Returns the
/// new holder, if any. Shared by release and deregister.
pub(crate) fn handoff_or_remove(
    tx: &Transaction<'_>,
    file: &str,
) -> MinionResult<Option<AgentName>> {
    tx.execute("DELETE FROM file_claims WHERE file_path = ?1", params![file])
        .map_err(map_sql)?;

    let head: Option<(i64, String)> = tx
        .query_row(
            "SELECT id, agent_name FROM file_waitlist WHERE file_path = ?1 ORDER BY id ASC LIMIT 1",
            params![file],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(map_sql)?;

    match head {
        None => Ok(None),
        Some((id, next)) => {
            tx.execute("DELETE FROM file_waitlist WHERE id = ?1", params![id])
                .map_err(map_sql)?;
            tx.execute(
                "INSERT INTO file_claims (file_path, agent_name, claimed_at) VALUES (?1, ?2, ?3)",
                params![file, next, to_db(now())],
            )
            .map_err(map_sql)?;
            Ok(Some(AgentName::from(next)))
        }
    }
}

/// Claims key on the literal path string; normalization strips redundant
/// separators without touching the filesystem.
fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_sep = false;
    for ch in path.trim().chars() {
        if ch == '/' {
            if !last_sep {
                out.push(ch);
            }
            last_sep = true;
        } else {
            out.push(ch);
            last_sep = false;
        }
    }
    if out.len() > 1 {
        while out.ends_with('/') {
            out.pop();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_normalization() {
        assert_eq!(normalize_path("src//lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path(" src/lib.rs "), "src/lib.rs");
        assert_eq!(normalize_path("dir/"), "dir");
        assert_eq!(normalize_path("/"), "/");
    }
}
