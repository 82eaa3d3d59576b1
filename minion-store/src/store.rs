//! Store kernel - connection, pragmas, and the transaction helper.

use crate::{schema, WorkPaths};
use chrono::{DateTime, Utc};
use minion_core::{MinionError, MinionResult, RuntimeDefaults, StoreError};
use minion_flow::FlowSet;
use rand::Rng;
use rusqlite::{Connection, ErrorCode, OpenFlags, Transaction, TransactionBehavior};
use std::time::Duration;
use tracing::{debug, warn};

/// Attempts made for a contended transaction before surfacing `Conflict`.
const TX_MAX_ATTEMPTS: u32 = 3;

/// A handle on the datastore. One per process (or per thread in tests);
/// cross-process safety comes from SQLite's WAL + immediate transactions,
/// not from sharing this struct.
pub struct Store {
    pub(crate) conn: Connection,
    pub(crate) paths: WorkPaths,
    pub(crate) flows: FlowSet,
    pub(crate) defaults: RuntimeDefaults,
}

impl Store {
    /// Open (creating if needed) the datastore under the given layout.
    pub fn open(paths: WorkPaths, flows: FlowSet, defaults: RuntimeDefaults) -> MinionResult<Store> {
        let db_path = paths.db_path();
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::io(dir.display().to_string(), e))?;
        }
        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(map_sql)?;

        conn.pragma_update(None, "journal_mode", "WAL").map_err(map_sql)?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(map_sql)?;
        conn.pragma_update(None, "busy_timeout", 5000).map_err(map_sql)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(map_sql)?;

        schema::init(&conn)?;
        debug!(db = %db_path.display(), "datastore opened");

        Ok(Store { conn, paths, flows, defaults })
    }

    /// Open with everything resolved from the environment.
    pub fn open_from_env() -> MinionResult<Store> {
        let paths = WorkPaths::resolve();
        let flows_dir = crate::flows_dir_from_env();
        let flows = FlowSet::load(flows_dir.as_deref())
            .map_err(|e| MinionError::invalid(e.to_string()))?;
        Self::open(paths, flows, RuntimeDefaults::default())
    }

    pub fn paths(&self) -> &WorkPaths {
        &self.paths
    }

    pub fn flows(&self) -> &FlowSet {
        &self.flows
    }

    pub fn defaults(&self) -> &RuntimeDefaults {
        &self.defaults
    }

    /// Run `f` inside one immediate transaction, retrying on busy/locked
    /// conflicts with jittered back-off. Conflicts resolved within the retry
    /// budget never surface to the caller.
    pub fn with_tx<T>(
        &mut self,
        mut f: impl FnMut(&Transaction<'_>) -> MinionResult<T>,
    ) -> MinionResult<T> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let tx = match self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
            {
                Ok(tx) => tx,
                Err(e) => {
                    let err = map_sql(e);
                    if is_conflict(&err) && attempt < TX_MAX_ATTEMPTS {
                        backoff(attempt);
                        continue;
                    }
                    return Err(err);
                }
            };

            match f(&tx) {
                Ok(value) => match tx.commit() {
                    Ok(()) => return Ok(value),
                    Err(e) => {
                        let err = map_sql(e);
                        if is_conflict(&err) && attempt < TX_MAX_ATTEMPTS {
                            warn!(attempt, "commit conflict, retrying");
                            backoff(attempt);
                            continue;
                        }
                        return Err(err);
                    }
                },
                Err(err) => {
                    drop(tx); // rollback
                    if is_conflict(&err) && attempt < TX_MAX_ATTEMPTS {
                        warn!(attempt, "transaction conflict, retrying");
                        backoff(attempt);
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

fn is_conflict(err: &MinionError) -> bool {
    matches!(err, MinionError::Store(StoreError::Conflict { .. }))
}

fn backoff(attempt: u32) {
    let jitter_ms = rand::thread_rng().gen_range(10..60);
    std::thread::sleep(Duration::from_millis(u64::from(attempt) * 25 + jitter_ms));
}

/// Map driver errors onto the kernel error families. Busy/locked becomes a
/// retryable `Conflict`; on-disk corruption is fatal.
pub(crate) fn map_sql(e: rusqlite::Error) -> MinionError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == ErrorCode::DatabaseBusy || f.code == ErrorCode::DatabaseLocked =>
        {
            MinionError::Store(StoreError::Conflict {
                attempts: 1,
                reason: e.to_string(),
            })
        }
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == ErrorCode::DatabaseCorrupt || f.code == ErrorCode::NotADatabase =>
        {
            MinionError::Store(StoreError::Corruption {
                reason: e.to_string(),
            })
        }
        _ => MinionError::Store(StoreError::sql(e)),
    }
}

/// Current UTC instant. All persisted timestamps are RFC 3339 in UTC so
/// lexicographic ordering matches chronological ordering.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

pub(crate) fn to_db(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn from_db(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

pub(crate) fn opt_from_db(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().and_then(from_db)
}

/// Flow search path: `FLOWS_DIR`, else `<DOCS_DIR>/task-flows` when set.
pub fn flows_dir_from_env() -> Option<std::path::PathBuf> {
    if let Ok(dir) = std::env::var(minion_core::ENV_FLOWS_DIR) {
        if !dir.is_empty() {
            return Some(dir.into());
        }
    }
    std::env::var(minion_core::ENV_DOCS_DIR)
        .ok()
        .filter(|d| !d.is_empty())
        .map(|d| std::path::Path::new(&d).join("task-flows"))
}
