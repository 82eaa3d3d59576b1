//! Contract documents - external, read-only inputs loaded at runtime.
//!
//! `<DOCS_DIR>/contracts/<name>.json` holds the boot sequence, per-class
//! daemon rules, compaction markers, and numeric defaults. Missing documents
//! fall back to compiled-in conservative values; nothing provider-specific
//! is hard-coded here.

use minion_core::RuntimeDefaults;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Startup commands injected into the boot prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct BootSequence {
    pub steps: Vec<String>,
}

/// Prompt text injected into every turn, keyed by class.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonRules {
    #[serde(default)]
    pub common: String,
    #[serde(default)]
    pub per_class: std::collections::BTreeMap<String, String>,
}

/// Substrings that indicate provider context compaction.
#[derive(Debug, Clone, Deserialize)]
pub struct CompactionMarkers {
    pub substring_markers: Vec<String>,
}

impl Default for CompactionMarkers {
    fn default() -> Self {
        CompactionMarkers {
            substring_markers: [
                "compaction",
                "compacted",
                "context window",
                "summarized prior",
                "summarised prior",
                "auto-compact",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl CompactionMarkers {
    /// Case-insensitive substring scan.
    pub fn detect(&self, text: &str) -> bool {
        let low = text.to_lowercase();
        self.substring_markers.iter().any(|m| low.contains(m.as_str()))
    }
}

/// All contract documents a daemon consults.
#[derive(Debug, Clone)]
pub struct Contracts {
    pub docs_dir: Option<PathBuf>,
    pub boot_sequence: Option<BootSequence>,
    pub daemon_rules: DaemonRules,
    pub compaction_markers: CompactionMarkers,
    pub defaults: RuntimeDefaults,
}

impl Contracts {
    /// Load from `<docs_dir>/contracts/`. Absent or malformed documents use
    /// their defaults - a daemon must boot on a bare install.
    pub fn load(docs_dir: Option<&Path>) -> Contracts {
        let boot_sequence = load_doc(docs_dir, "boot-sequence");
        let daemon_rules = load_doc(docs_dir, "daemon-rules").unwrap_or_default();
        let compaction_markers: CompactionMarkers =
            load_doc(docs_dir, "compaction-markers").unwrap_or_default();
        let defaults: RuntimeDefaults = load_doc(docs_dir, "config-defaults").unwrap_or_default();

        Contracts {
            docs_dir: docs_dir.map(Path::to_path_buf),
            boot_sequence,
            daemon_rules,
            compaction_markers,
            defaults,
        }
    }

    /// Rules text for one class: common rules plus the class addendum.
    pub fn rules_for(&self, class: &str) -> String {
        let mut parts = Vec::new();
        if !self.daemon_rules.common.trim().is_empty() {
            parts.push(self.daemon_rules.common.trim().to_string());
        }
        if let Some(extra) = self.daemon_rules.per_class.get(class) {
            if !extra.trim().is_empty() {
                parts.push(extra.trim().to_string());
            }
        }
        parts.join("\n\n")
    }
}

fn load_doc<T: serde::de::DeserializeOwned>(docs_dir: Option<&Path>, name: &str) -> Option<T> {
    let dir = docs_dir?;
    let path = dir.join("contracts").join(format!("{}.json", name));
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(_) => {
            debug!(doc = name, path = %path.display(), "contract document absent, using defaults");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(doc = name, error = %e, "contract document unparseable, using defaults");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_load_from_contract_document() {
        let dir = tempfile::tempdir().unwrap();
        let contracts_dir = dir.path().join("contracts");
        std::fs::create_dir_all(&contracts_dir).unwrap();
        std::fs::write(
            contracts_dir.join("compaction-markers.json"),
            r#"{"substring_markers":["conversation trimmed"]}"#,
        )
        .unwrap();

        let contracts = Contracts::load(Some(dir.path()));
        assert!(contracts.compaction_markers.detect("NOTE: Conversation Trimmed to fit"));
        assert!(!contracts.compaction_markers.detect("auto-compact")); // replaced, not merged
    }

    #[test]
    fn defaults_survive_missing_docs_dir() {
        let contracts = Contracts::load(None);
        assert!(contracts.compaction_markers.detect("context window exceeded, auto-compact"));
        assert_eq!(contracts.defaults.poll_interval_secs, 5);
        assert!(contracts.boot_sequence.is_none());
    }

    #[test]
    fn class_rules_compose() {
        let dir = tempfile::tempdir().unwrap();
        let contracts_dir = dir.path().join("contracts");
        std::fs::create_dir_all(&contracts_dir).unwrap();
        std::fs::write(
            contracts_dir.join("daemon-rules.json"),
            r#"{"common":"check inbox before sending","per_class":{"coder":"claim files before editing"}}"#,
        )
        .unwrap();

        let contracts = Contracts::load(Some(dir.path()));
        let rules = contracts.rules_for("coder");
        assert!(rules.contains("check inbox"));
        assert!(rules.contains("claim files"));
        assert_eq!(contracts.rules_for("oracle"), "check inbox before sending");
    }
}
