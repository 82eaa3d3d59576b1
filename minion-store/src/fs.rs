//! Filesystem layout - path builders and atomic writes.
//!
//! Content lives on disk as `<timestamp>-<agent>-<slug>.md`; the datastore
//! stores the path. Writes go to a temp file in the target directory and are
//! renamed into place.

use chrono::{DateTime, Utc};
use minion_core::{
    AgentName, LogPriority, MinionResult, StoreError, ENV_DB_PATH, ENV_PROJECT,
};
use std::path::{Path, PathBuf};

/// Resolved work-directory layout rooted next to `minion.db`.
#[derive(Debug, Clone)]
pub struct WorkPaths {
    root: PathBuf,
}

impl WorkPaths {
    /// Resolve from the environment: `DB_PATH` wins, otherwise
    /// `~/.minion_work/<PROJECT>/minion.db` with the project defaulting to
    /// the current directory's name.
    pub fn resolve() -> Self {
        if let Ok(db) = std::env::var(ENV_DB_PATH) {
            if !db.is_empty() {
                return Self::from_db_path(PathBuf::from(db));
            }
        }
        let project = std::env::var(ENV_PROJECT).ok().filter(|p| !p.is_empty()).unwrap_or_else(|| {
            std::env::current_dir()
                .ok()
                .and_then(|d| d.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "default".to_string())
        });
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            root: PathBuf::from(home).join(".minion_work").join(project),
        }
    }

    /// Root a layout at the directory containing the given datastore file.
    pub fn from_db_path(db_path: PathBuf) -> Self {
        let root = db_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("minion.db")
    }

    pub fn inbox_dir(&self, agent: &str) -> PathBuf {
        self.root.join("inbox").join(agent)
    }

    pub fn battle_plans_dir(&self) -> PathBuf {
        self.root.join("battle-plans")
    }

    pub fn raid_log_dir(&self) -> PathBuf {
        self.root.join("raid-log")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn streams_dir(&self) -> PathBuf {
        self.root.join("streams")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    /// `inbox/<to>/<ts>-<from>-<slug>.md`
    pub fn message_file(&self, to: &str, from: &AgentName, slug: &str, now: DateTime<Utc>) -> PathBuf {
        self.inbox_dir(to).join(format!(
            "{}-{}-{}.md",
            file_timestamp(now),
            slugify(from.as_str(), 20),
            slugify(slug, 20)
        ))
    }

    /// `battle-plans/<ts>-<agent>-plan.md`
    pub fn plan_file(&self, agent: &AgentName, now: DateTime<Utc>) -> PathBuf {
        self.battle_plans_dir().join(format!(
            "{}-{}-plan.md",
            file_timestamp(now),
            slugify(agent.as_str(), 20)
        ))
    }

    /// `raid-log/<ts>-<agent>-<priority>.md`
    pub fn log_file(&self, agent: &AgentName, priority: LogPriority, now: DateTime<Utc>) -> PathBuf {
        self.raid_log_dir().join(format!(
            "{}-{}-{}.md",
            file_timestamp(now),
            slugify(agent.as_str(), 20),
            priority.as_db_str()
        ))
    }

    /// `state/<agent>.json`
    pub fn state_file(&self, agent: &AgentName) -> PathBuf {
        self.state_dir().join(format!("{}.json", slugify(agent.as_str(), 40)))
    }

    /// `state/<agent>.pollfailure` - the out-of-band alert sink used when the
    /// datastore itself may be the problem.
    pub fn poll_failure_file(&self, agent: &AgentName) -> PathBuf {
        self.state_dir().join(format!("{}.pollfailure", slugify(agent.as_str(), 40)))
    }

    /// `streams/<agent>.tail`
    pub fn stream_tail_file(&self, agent: &AgentName) -> PathBuf {
        self.streams_dir().join(format!("{}.tail", slugify(agent.as_str(), 40)))
    }
}

/// Compact timestamp for filenames: `20260219T143022`.
fn file_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%S").to_string()
}

/// Filesystem-safe slug: lowercase alphanumerics joined by single dashes.
pub fn slugify(text: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(text.len().min(max_len));
    let mut last_dash = true;
    for ch in text.chars() {
        if out.len() >= max_len {
            break;
        }
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Write content atomically: temp file in the target directory, then rename.
pub fn atomic_write(path: &Path, content: &str) -> MinionResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir.display().to_string(), e))?;
    let mut tmp = dir.to_path_buf();
    tmp.push(format!(
        ".{}.tmp-{}",
        path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        std::process::id()
    ));
    std::fs::write(&tmp, content).map_err(|e| StoreError::io(tmp.display().to_string(), e))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        StoreError::io(path.display().to_string(), e)
    })?;
    Ok(())
}

/// Read a content file, returning an empty string when the path is missing.
pub fn read_content(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    std::fs::read_to_string(path).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_are_safe() {
        assert_eq!(slugify("Coder One!", 40), "coder-one");
        assert_eq!(slugify("a//b", 40), "a-b");
        assert_eq!(slugify("very long agent name here", 6), "very-l");
    }

    #[test]
    fn atomic_write_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("nested").join("note.md");
        atomic_write(&p, "hello").unwrap();
        assert_eq!(std::fs::read_to_string(&p).unwrap(), "hello");
        // Overwrite in place
        atomic_write(&p, "bye").unwrap();
        assert_eq!(std::fs::read_to_string(&p).unwrap(), "bye");
    }

    #[test]
    fn layout_hangs_off_db_dir() {
        let paths = WorkPaths::from_db_path(PathBuf::from("/work/proj/minion.db"));
        assert_eq!(paths.inbox_dir("c1"), PathBuf::from("/work/proj/inbox/c1"));
        assert_eq!(paths.db_path(), PathBuf::from("/work/proj/minion.db"));
    }
}
