//! YAML loading, inheritance resolution, and validation for task flows.
//!
//! Flows live as `<name>.yaml` documents under a search directory
//! (underscore-prefixed files are inheritance-only parents). The crate ships
//! `base`, `bugfix`, and `investigation` built in, so a bare install routes
//! tasks without any on-disk documents.

use crate::{Stage, StageGate, TaskFlow};
use minion_core::AgentClass;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

const BASE_YAML: &str = include_str!("../flows/_base.yaml");
const BUGFIX_YAML: &str = include_str!("../flows/bugfix.yaml");
const INVESTIGATION_YAML: &str = include_str!("../flows/investigation.yaml");

/// The flow type assumed when a task row carries none.
pub const DEFAULT_FLOW_TYPE: &str = "bugfix";

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("failed to read flow file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse flow '{name}': {source}")]
    Yaml {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("flow '{0}' not found")]
    UnknownFlow(String),

    #[error("flow '{name}' inherits unknown parent '{parent}'")]
    UnknownParent { name: String, parent: String },

    #[error("flow '{name}' has an inheritance cycle through '{parent}'")]
    InheritanceCycle { name: String, parent: String },

    #[error("flow '{name}' has no stages")]
    NoStages { name: String },

    #[error("flow '{name}': initial stage '{initial}' is not defined")]
    UnknownInitial { name: String, initial: String },

    #[error("flow '{name}', stage '{stage}': missing description")]
    MissingDescription { name: String, stage: String },

    #[error("flow '{name}', stage '{stage}': '{edge}' references unknown stage '{target}'")]
    UnknownStageRef {
        name: String,
        stage: String,
        edge: &'static str,
        target: String,
    },

    #[error("flow '{name}', stage '{stage}': terminal stage must not have 'next'")]
    TerminalWithNext { name: String, stage: String },

    #[error("flow '{name}', stage '{stage}': non-terminal stage must have 'next'")]
    MissingNext { name: String, stage: String },

    #[error("flow '{name}', stage '{stage}': unknown gate '{gate}' (valid: submit_result)")]
    UnknownGate {
        name: String,
        stage: String,
        gate: String,
    },

    #[error("flow '{name}', stage '{stage}': invalid worker class '{class}'")]
    InvalidWorkerClass {
        name: String,
        stage: String,
        class: String,
    },

    #[error("flow '{name}' must have exactly one terminal stage (found {found})")]
    TerminalCount { name: String, found: usize },

    #[error("flow '{name}' has unreachable stages: {stages}")]
    UnreachableStages { name: String, stages: String },
}

// ============================================================================
// RAW SCHEMA (what the YAML deserializes into, pre-merge)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFlow {
    name: String,
    description: String,
    #[serde(default)]
    initial: Option<String>,
    #[serde(default)]
    inherits: Option<String>,
    #[serde(default)]
    stages: BTreeMap<String, RawStage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStage {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    fail: Option<String>,
    #[serde(default)]
    requires: Option<Vec<String>>,
    #[serde(default)]
    workers: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    terminal: Option<bool>,
}

impl RawStage {
    /// Per-stage merge: keys present in the override replace the base keys;
    /// absent keys are inherited verbatim.
    fn merged_over(&self, base: &RawStage) -> RawStage {
        RawStage {
            description: self.description.clone().or_else(|| base.description.clone()),
            next: self.next.clone().or_else(|| base.next.clone()),
            fail: self.fail.clone().or_else(|| base.fail.clone()),
            requires: self.requires.clone().or_else(|| base.requires.clone()),
            workers: self.workers.clone().or_else(|| base.workers.clone()),
            terminal: self.terminal.or(base.terminal),
        }
    }
}

// ============================================================================
// FLOW SET
// ============================================================================

/// All loadable flows, resolved and validated.
#[derive(Debug, Clone)]
pub struct FlowSet {
    flows: BTreeMap<String, TaskFlow>,
}

impl FlowSet {
    /// The compiled-in flows only.
    pub fn builtin() -> FlowSet {
        Self::load(None::<&Path>).expect("built-in flows must validate")
    }

    /// Load flows from a directory, layered over the built-ins. A `None`
    /// directory (or a missing one) yields the built-ins alone. A document
    /// that fails to parse or validate is skipped with a warning; it never
    /// poisons the rest of the set.
    pub fn load(dir: Option<impl AsRef<Path>>) -> Result<FlowSet, FlowError> {
        let mut raws: BTreeMap<String, RawFlow> = BTreeMap::new();
        for (name, yaml) in [
            ("base", BASE_YAML),
            ("bugfix", BUGFIX_YAML),
            ("investigation", INVESTIGATION_YAML),
        ] {
            raws.insert(name.to_string(), parse_raw(name, yaml)?);
        }

        if let Some(dir) = dir {
            let dir = dir.as_ref();
            if dir.is_dir() {
                for entry in std::fs::read_dir(dir).map_err(|e| FlowError::Io {
                    path: dir.display().to_string(),
                    source: e,
                })? {
                    let entry = entry.map_err(|e| FlowError::Io {
                        path: dir.display().to_string(),
                        source: e,
                    })?;
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                        continue;
                    }
                    let stem = match path.file_stem().and_then(|s| s.to_str()) {
                        Some(s) => s.trim_start_matches('_').to_string(),
                        None => continue,
                    };
                    let text = std::fs::read_to_string(&path).map_err(|e| FlowError::Io {
                        path: path.display().to_string(),
                        source: e,
                    })?;
                    match parse_raw(&stem, &text) {
                        Ok(raw) => {
                            debug!(flow = %stem, path = %path.display(), "loaded flow document");
                            raws.insert(stem, raw);
                        }
                        Err(err) => {
                            warn!(flow = %stem, %err, "skipping unparseable flow document");
                        }
                    }
                }
            }
        }

        let mut flows = BTreeMap::new();
        for name in raws.keys().cloned().collect::<Vec<_>>() {
            // Underscore-prefixed files resolve under their bare name; the
            // `base` parent itself is still addressable and valid.
            let result = resolve_inheritance(&name, &raws, &mut Vec::new())
                .and_then(|resolved| validate(&name, resolved));
            match result {
                Ok(flow) => {
                    flows.insert(name, flow);
                }
                Err(err) if name_is_builtin(&name) => return Err(err),
                Err(err) => {
                    warn!(flow = %name, %err, "skipping invalid flow document");
                }
            }
        }

        Ok(FlowSet { flows })
    }

    pub fn get(&self, name: &str) -> Option<&TaskFlow> {
        self.flows.get(name)
    }

    /// Get a flow or fail with `UnknownFlow`.
    pub fn require(&self, name: &str) -> Result<&TaskFlow, FlowError> {
        self.get(name).ok_or_else(|| FlowError::UnknownFlow(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.flows.keys().map(|k| k.as_str()).collect()
    }
}

fn name_is_builtin(name: &str) -> bool {
    matches!(name, "base" | "bugfix" | "investigation")
}

fn parse_raw(name: &str, yaml: &str) -> Result<RawFlow, FlowError> {
    serde_yaml::from_str(yaml).map_err(|source| FlowError::Yaml {
        name: name.to_string(),
        source,
    })
}

/// Depth-first single-parent inheritance: stages of the child override stages
/// of the parent key-by-key; unnamed stages are inherited verbatim.
fn resolve_inheritance(
    name: &str,
    raws: &BTreeMap<String, RawFlow>,
    seen: &mut Vec<String>,
) -> Result<RawFlow, FlowError> {
    let raw = raws
        .get(name)
        .ok_or_else(|| FlowError::UnknownFlow(name.to_string()))?
        .clone();

    let parent_name = match &raw.inherits {
        None => return Ok(raw),
        Some(p) => p.clone(),
    };

    if seen.contains(&parent_name) || parent_name == name {
        return Err(FlowError::InheritanceCycle {
            name: name.to_string(),
            parent: parent_name,
        });
    }
    seen.push(name.to_string());

    if !raws.contains_key(&parent_name) {
        return Err(FlowError::UnknownParent {
            name: name.to_string(),
            parent: parent_name,
        });
    }
    let parent = resolve_inheritance(&parent_name, raws, seen)?;

    let mut stages = parent.stages.clone();
    for (stage_name, child_stage) in &raw.stages {
        let merged = match stages.get(stage_name) {
            Some(base) => child_stage.merged_over(base),
            None => child_stage.clone(),
        };
        stages.insert(stage_name.clone(), merged);
    }

    Ok(RawFlow {
        name: raw.name,
        description: raw.description,
        initial: raw.initial.or(parent.initial),
        inherits: None,
        stages,
    })
}

/// Structural validation - hard fail on any error.
fn validate(name: &str, raw: RawFlow) -> Result<TaskFlow, FlowError> {
    if raw.stages.is_empty() {
        return Err(FlowError::NoStages { name: name.to_string() });
    }

    let initial = raw.initial.unwrap_or_else(|| "open".to_string());
    if !raw.stages.contains_key(&initial) {
        return Err(FlowError::UnknownInitial {
            name: name.to_string(),
            initial,
        });
    }

    let stage_names: Vec<String> = raw.stages.keys().cloned().collect();
    let mut stages = BTreeMap::new();
    let mut terminal_count = 0usize;

    for (stage_name, cfg) in raw.stages {
        let description = cfg.description.ok_or_else(|| FlowError::MissingDescription {
            name: name.to_string(),
            stage: stage_name.clone(),
        })?;

        let terminal = cfg.terminal.unwrap_or(false);
        if terminal {
            terminal_count += 1;
            if cfg.next.is_some() {
                return Err(FlowError::TerminalWithNext {
                    name: name.to_string(),
                    stage: stage_name,
                });
            }
        } else if cfg.next.is_none() {
            return Err(FlowError::MissingNext {
                name: name.to_string(),
                stage: stage_name,
            });
        }

        for (edge, target) in [("next", &cfg.next), ("fail", &cfg.fail)] {
            if let Some(target) = target {
                if !stage_names.contains(target) {
                    return Err(FlowError::UnknownStageRef {
                        name: name.to_string(),
                        stage: stage_name,
                        edge,
                        target: target.clone(),
                    });
                }
            }
        }

        let mut requires = Vec::new();
        for gate in cfg.requires.unwrap_or_default() {
            match gate.as_str() {
                "submit_result" => requires.push(StageGate::SubmitResult),
                other => {
                    return Err(FlowError::UnknownGate {
                        name: name.to_string(),
                        stage: stage_name,
                        gate: other.to_string(),
                    })
                }
            }
        }

        let mut workers: BTreeMap<String, Vec<AgentClass>> = BTreeMap::new();
        match cfg.workers {
            Some(raw_workers) => {
                for (key, classes) in raw_workers {
                    if key != "default" && AgentClass::from_db_str(&key).is_err() {
                        return Err(FlowError::InvalidWorkerClass {
                            name: name.to_string(),
                            stage: stage_name,
                            class: key,
                        });
                    }
                    let mut parsed = Vec::new();
                    for class in classes {
                        parsed.push(AgentClass::from_db_str(&class).map_err(|_| {
                            FlowError::InvalidWorkerClass {
                                name: name.to_string(),
                                stage: stage_name.clone(),
                                class: class.clone(),
                            }
                        })?);
                    }
                    workers.insert(key, parsed);
                }
            }
            None => {
                workers.insert("default".to_string(), vec![AgentClass::Lead]);
            }
        }
        if !workers.contains_key("default") {
            workers.insert("default".to_string(), vec![AgentClass::Lead]);
        }

        stages.insert(
            stage_name.clone(),
            Stage {
                name: stage_name,
                description,
                next: cfg.next,
                fail: cfg.fail,
                requires,
                workers,
                terminal,
            },
        );
    }

    if terminal_count != 1 {
        return Err(FlowError::TerminalCount {
            name: name.to_string(),
            found: terminal_count,
        });
    }

    let flow = TaskFlow {
        name: raw.name,
        description: raw.description,
        initial,
        stages,
    };

    let unreachable = flow.unreachable_stages();
    if !unreachable.is_empty() {
        return Err(FlowError::UnreachableStages {
            name: name.to_string(),
            stages: unreachable.join(", "),
        });
    }

    Ok(flow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtins_load_and_inherit() {
        let set = FlowSet::builtin();
        assert_eq!(set.names(), vec!["base", "bugfix", "investigation"]);

        let bugfix = set.get("bugfix").unwrap();
        // Inherited from base untouched
        assert_eq!(bugfix.stage("open").unwrap().next.as_deref(), Some("assigned"));
        // Overridden description, inherited edges
        assert!(bugfix.stage("in_progress").unwrap().description.contains("defect"));
        assert_eq!(bugfix.stage("in_progress").unwrap().next.as_deref(), Some("fixed"));
        // Per-requesting-class worker override
        let fixed = bugfix.stage("fixed").unwrap();
        assert!(fixed.workers_for(AgentClass::Builder).contains(&AgentClass::Auditor));
        assert!(!fixed.workers_for(AgentClass::Coder).contains(&AgentClass::Auditor));
    }

    #[test]
    fn directory_flows_layer_over_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("hotfix.yaml")).unwrap();
        write!(
            f,
            "name: hotfix\ndescription: fast path\ninherits: base\nstages:\n  verified:\n    description: lead spot-check\n    next: closed\n    workers:\n      default: [lead]\n"
        )
        .unwrap();

        let set = FlowSet::load(Some(dir.path())).unwrap();
        assert!(set.get("hotfix").is_some());
        assert!(set.get("bugfix").is_some());
        assert_eq!(set.get("hotfix").unwrap().initial, "open");
    }

    #[test]
    fn invalid_directory_flow_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("broken.yaml"),
            "name: broken\ndescription: bad edge\nstages:\n  open:\n    description: x\n    next: nowhere\n",
        )
        .unwrap();

        let set = FlowSet::load(Some(dir.path())).unwrap();
        assert!(set.get("broken").is_none());
        assert!(set.get("bugfix").is_some());
    }

    #[test]
    fn unknown_gate_is_rejected() {
        let raw = parse_raw(
            "g",
            "name: g\ndescription: d\nstages:\n  open:\n    description: x\n    next: done\n    requires: [sign_off]\n  done:\n    description: y\n    terminal: true\n",
        )
        .unwrap();
        assert!(matches!(
            validate("g", raw),
            Err(FlowError::UnknownGate { .. })
        ));
    }

    #[test]
    fn unreachable_stage_is_rejected() {
        let raw = parse_raw(
            "u",
            "name: u\ndescription: d\nstages:\n  open:\n    description: x\n    next: done\n  island:\n    description: z\n    next: done\n  done:\n    description: y\n    terminal: true\n",
        )
        .unwrap();
        assert!(matches!(
            validate("u", raw),
            Err(FlowError::UnreachableStages { .. })
        ));
    }

    #[test]
    fn inheritance_cycle_is_rejected() {
        let mut raws = BTreeMap::new();
        raws.insert("a".to_string(), parse_raw("a", "name: a\ndescription: d\ninherits: b\nstages: {}\n").unwrap());
        raws.insert("b".to_string(), parse_raw("b", "name: b\ndescription: d\ninherits: a\nstages: {}\n").unwrap());
        assert!(matches!(
            resolve_inheritance("a", &raws, &mut Vec::new()),
            Err(FlowError::InheritanceCycle { .. })
        ));
    }
}
