//! Schema DDL and versioned migrations.

use minion_core::MinionResult;
use rusqlite::Connection;

use crate::store::map_sql;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    name                TEXT PRIMARY KEY,
    agent_class         TEXT NOT NULL DEFAULT 'coder',
    model               TEXT DEFAULT NULL,
    transport           TEXT NOT NULL DEFAULT 'terminal',
    status              TEXT NOT NULL DEFAULT 'waiting for work',
    description         TEXT DEFAULT NULL,
    context_summary     TEXT DEFAULT NULL,
    context_updated_at  TEXT DEFAULT NULL,
    last_seen           TEXT DEFAULT NULL,
    last_inbox_check    TEXT DEFAULT NULL,
    registered_at       TEXT NOT NULL,
    current_zone        TEXT DEFAULT NULL,
    current_role        TEXT DEFAULT NULL,
    pid                 INTEGER DEFAULT NULL,
    session_id          TEXT DEFAULT NULL,
    hp_mode             TEXT NOT NULL DEFAULT 'none',
    hp_input_tokens     INTEGER DEFAULT NULL,
    hp_output_tokens    INTEGER DEFAULT NULL,
    hp_turn_input       INTEGER DEFAULT NULL,
    hp_turn_output      INTEGER DEFAULT NULL,
    hp_tokens_limit     INTEGER DEFAULT NULL,
    hp_updated_at       TEXT DEFAULT NULL,
    hp_alerts_fired     TEXT DEFAULT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    from_agent      TEXT NOT NULL,
    to_agent        TEXT NOT NULL,
    content_file    TEXT NOT NULL,
    timestamp       TEXT NOT NULL,
    read_flag       INTEGER NOT NULL DEFAULT 0,
    is_cc           INTEGER NOT NULL DEFAULT 0,
    cc_original_to  TEXT DEFAULT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_recipient
    ON messages(to_agent, read_flag);

CREATE TABLE IF NOT EXISTS broadcast_reads (
    agent_name  TEXT NOT NULL,
    message_id  INTEGER NOT NULL,
    PRIMARY KEY (agent_name, message_id)
);

CREATE TABLE IF NOT EXISTS tasks (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    title           TEXT NOT NULL,
    task_file       TEXT NOT NULL,
    project         TEXT DEFAULT NULL,
    zone            TEXT DEFAULT NULL,
    status          TEXT NOT NULL DEFAULT 'open',
    blocked_by      TEXT DEFAULT NULL,
    assigned_to     TEXT DEFAULT NULL,
    created_by      TEXT NOT NULL,
    files           TEXT DEFAULT NULL,
    progress        TEXT DEFAULT NULL,
    class_required  TEXT DEFAULT NULL,
    flow_type       TEXT NOT NULL DEFAULT 'bugfix',
    activity_count  INTEGER NOT NULL DEFAULT 0,
    result_file     TEXT DEFAULT NULL,
    requirement_path TEXT DEFAULT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON tasks(assigned_to, status);

CREATE TABLE IF NOT EXISTS task_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     INTEGER NOT NULL,
    from_status TEXT DEFAULT NULL,
    to_status   TEXT NOT NULL,
    agent       TEXT NOT NULL,
    timestamp   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_history_task ON task_history(task_id, id);

CREATE TABLE IF NOT EXISTS file_claims (
    file_path   TEXT PRIMARY KEY,
    agent_name  TEXT NOT NULL,
    claimed_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS file_waitlist (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path   TEXT NOT NULL,
    agent_name  TEXT NOT NULL,
    added_at    TEXT NOT NULL,
    UNIQUE(file_path, agent_name)
);

CREATE TABLE IF NOT EXISTS battle_plans (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    set_by      TEXT NOT NULL,
    plan_file   TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'active',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS raid_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_name  TEXT NOT NULL,
    entry_file  TEXT NOT NULL,
    priority    TEXT NOT NULL DEFAULT 'normal',
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS flags (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    set_by      TEXT NOT NULL,
    set_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_retire (
    agent_name  TEXT PRIMARY KEY,
    set_by      TEXT NOT NULL,
    set_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_interrupt (
    agent_name  TEXT PRIMARY KEY,
    set_by      TEXT NOT NULL,
    set_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fenix_records (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_name  TEXT NOT NULL,
    files       TEXT NOT NULL DEFAULT '[]',
    manifest    TEXT NOT NULL DEFAULT '',
    consumed_at TEXT DEFAULT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TEXT NOT NULL,
    description TEXT
);
"#;

/// Create all tables if absent, then apply pending migrations.
pub(crate) fn init(conn: &Connection) -> MinionResult<()> {
    conn.execute_batch(SCHEMA_SQL).map_err(map_sql)?;
    run_migrations(conn)?;
    Ok(())
}

type Migration = (i64, &'static str, fn(&Connection) -> rusqlite::Result<()>);

/// Ordered migration ledger. Each entry runs once; the applied set is
/// tracked in `schema_version`.
const MIGRATIONS: &[Migration] = &[
    // v1 reserved the ledger itself; later versions alter live schemas.
];

fn run_migrations(conn: &Connection) -> MinionResult<()> {
    let current: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))
        .map_err(map_sql)?;

    for (version, description, migrate) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        conn.execute_batch("BEGIN").map_err(map_sql)?;
        let applied = migrate(conn).and_then(|_| {
            conn.execute(
                "INSERT INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
                rusqlite::params![version, chrono::Utc::now().to_rfc3339(), description],
            )
            .map(|_| ())
        });
        match applied {
            Ok(()) => {
                conn.execute_batch("COMMIT").map_err(map_sql)?;
                tracing::info!(version, description, "applied schema migration");
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(map_sql(e));
            }
        }
    }
    Ok(())
}
