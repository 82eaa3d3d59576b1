//! Daemon state file - `state/<agent>.json`.
//!
//! Small JSON document used by start/stop/status and crash recovery. Also
//! the side channel for poll-failure alerts, since the datastore may itself
//! be the thing that is broken.

use chrono::{DateTime, Utc};
use minion_core::{MinionResult, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonState {
    pub agent: String,
    pub provider: String,
    pub pid: u32,
    pub status: String,
    pub updated_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub resume_ready: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub generation: u32,
}

/// Writer bound to one agent's state path.
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: PathBuf) -> StateFile {
        StateFile { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Option<DaemonState> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn write(&self, state: &DaemonState) -> MinionResult<()> {
        let body = serde_json::to_string_pretty(state)
            .map_err(|e| minion_core::MinionError::invalid(e.to_string()))?;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::io(dir.display().to_string(), e))?;
        }
        std::fs::write(&self.path, body)
            .map_err(|e| StoreError::io(self.path.display().to_string(), e))?;
        Ok(())
    }

    /// Whether the prior run left a resumable session behind.
    pub fn resume_ready(&self) -> bool {
        self.read().map(|s| s.resume_ready).unwrap_or(false)
    }
}

/// Write the out-of-band poll-failure alert file.
pub fn write_poll_failure(path: &Path, agent: &str, failures: u32, last_error: &str) {
    let body = serde_json::json!({
        "agent": agent,
        "consecutive_failures": failures,
        "last_error": last_error,
        "at": Utc::now(),
    });
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    let _ = std::fs::write(path, body.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path().join("state").join("c1.json"));
        assert!(file.read().is_none());
        assert!(!file.resume_ready());

        file.write(&DaemonState {
            agent: "c1".into(),
            provider: "claude".into(),
            pid: 42,
            status: "idle".into(),
            updated_at: Utc::now(),
            consecutive_failures: 0,
            resume_ready: true,
            last_error: None,
            generation: 1,
        })
        .unwrap();

        let state = file.read().unwrap();
        assert_eq!(state.agent, "c1");
        assert!(file.resume_ready());
    }
}
