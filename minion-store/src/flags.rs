//! Process-wide flags, retire records, and interrupt records.
//!
//! Flags live in the datastore, never in in-memory singletons; daemons
//! observe them by polling.

use crate::agents::require_agent;
use crate::store::{map_sql, now, to_db};
use crate::Store;
use minion_core::{
    has_capability, AgentName, Capability, FlagKey, MinionResult,
};
use rusqlite::{params, OptionalExtension, Transaction};
use tracing::info;

impl Store {
    /// Current flag state: `Some((set_by, set_at))` when raised.
    pub fn get_flag(&mut self, key: FlagKey) -> MinionResult<Option<(String, String)>> {
        self.with_tx(|tx| flag_state(tx, key))
    }

    /// Raise the stand_down flag: every daemon exits after its current turn.
    pub fn stand_down(&mut self, by: &AgentName) -> MinionResult<()> {
        let by = by.clone();
        self.with_tx(|tx| {
            require_manage(tx, &by)?;
            set_flag(tx, FlagKey::StandDown, &by)?;
            info!(by = %by, "stand_down flag raised");
            Ok(())
        })
    }

    /// Clear the moon_crash emergency flag. Requires `manage`.
    pub fn clear_moon_crash(&mut self, by: &AgentName) -> MinionResult<bool> {
        let by = by.clone();
        self.with_tx(|tx| {
            require_manage(tx, &by)?;
            let cleared = tx
                .execute(
                    "DELETE FROM flags WHERE key = ?1",
                    params![FlagKey::MoonCrash.as_db_str()],
                )
                .map_err(map_sql)?;
            if cleared > 0 {
                info!(by = %by, "moon_crash flag cleared");
            }
            Ok(cleared > 0)
        })
    }

    /// Mark one agent for graceful exit.
    pub fn retire_agent(&mut self, by: &AgentName, target: &AgentName) -> MinionResult<()> {
        let (by, target) = (by.clone(), target.clone());
        self.with_tx(|tx| {
            require_manage(tx, &by)?;
            require_agent(tx, &target)?;
            tx.execute(
                "INSERT INTO agent_retire (agent_name, set_by, set_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(agent_name) DO UPDATE SET set_by = excluded.set_by, set_at = excluded.set_at",
                params![target.as_str(), by.as_str(), to_db(now())],
            )
            .map_err(map_sql)?;
            info!(target = %target, by = %by, "retire record set");
            Ok(())
        })
    }

    /// Request an interrupt: the daemon kills its current provider turn and
    /// returns to the poll loop.
    pub fn interrupt_agent(&mut self, by: &AgentName, target: &AgentName) -> MinionResult<()> {
        let (by, target) = (by.clone(), target.clone());
        self.with_tx(|tx| {
            require_manage(tx, &by)?;
            require_agent(tx, &target)?;
            tx.execute(
                "INSERT INTO agent_interrupt (agent_name, set_by, set_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(agent_name) DO UPDATE SET set_by = excluded.set_by, set_at = excluded.set_at",
                params![target.as_str(), by.as_str(), to_db(now())],
            )
            .map_err(map_sql)?;
            info!(target = %target, by = %by, "interrupt requested");
            Ok(())
        })
    }

    /// Consume a pending interrupt for this agent, if any. Used by the
    /// daemon between stream reads.
    pub fn take_interrupt(&mut self, agent: &AgentName) -> MinionResult<bool> {
        let agent = agent.clone();
        self.with_tx(|tx| {
            let removed = tx
                .execute(
                    "DELETE FROM agent_interrupt WHERE agent_name = ?1",
                    params![agent.as_str()],
                )
                .map_err(map_sql)?;
            Ok(removed > 0)
        })
    }

    /// Is a retire record pending for this agent?
    pub fn is_retired(&mut self, agent: &AgentName) -> MinionResult<bool> {
        let agent = agent.clone();
        self.with_tx(|tx| retire_pending(tx, &agent))
    }
}

pub(crate) fn flag_state(
    tx: &Transaction<'_>,
    key: FlagKey,
) -> MinionResult<Option<(String, String)>> {
    tx.query_row(
        "SELECT set_by, set_at FROM flags WHERE key = ?1 AND value = '1'",
        params![key.as_db_str()],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()
    .map_err(map_sql)
}

pub(crate) fn set_flag(tx: &Transaction<'_>, key: FlagKey, by: &AgentName) -> MinionResult<()> {
    tx.execute(
        "INSERT INTO flags (key, value, set_by, set_at) VALUES (?1, '1', ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = '1', set_by = excluded.set_by, set_at = excluded.set_at",
        params![key.as_db_str(), by.as_str(), to_db(now())],
    )
    .map_err(map_sql)?;
    Ok(())
}

pub(crate) fn retire_pending(tx: &Transaction<'_>, agent: &AgentName) -> MinionResult<bool> {
    let hit: Option<String> = tx
        .query_row(
            "SELECT agent_name FROM agent_retire WHERE agent_name = ?1",
            params![agent.as_str()],
            |r| r.get(0),
        )
        .optional()
        .map_err(map_sql)?;
    Ok(hit.is_some())
}

/// Registered-class manage check for flag mutations.
fn require_manage(tx: &Transaction<'_>, by: &AgentName) -> MinionResult<()> {
    let agent = require_agent(tx, by)?;
    if !has_capability(agent.class, Capability::Manage) {
        return Err(minion_core::AuthError::CapabilityMissing {
            class: agent.class,
            capability: Capability::Manage,
            command: "flag mutation",
        }
        .into());
    }
    Ok(())
}
