//! In-memory flow graph.

use minion_core::AgentClass;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Gate vocabulary for `requires`. Only `submit_result` is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageGate {
    /// The task must carry a result file before entering the stage.
    SubmitResult,
}

/// One status in a flow, with its outgoing edges and worker policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub description: String,
    /// Pass edge. Absent on terminal stages.
    pub next: Option<String>,
    /// Fail edge. May route back to an earlier stage (cycles are fine).
    pub fail: Option<String>,
    /// Gates that must hold before a task enters this stage.
    pub requires: Vec<StageGate>,
    /// Allow list of worker classes, keyed by the requesting class with a
    /// `default` fallback.
    pub workers: BTreeMap<String, Vec<AgentClass>>,
    pub terminal: bool,
}

impl Stage {
    /// Resolve the worker allow list for a requesting class: exact key first,
    /// then `default`.
    pub fn workers_for(&self, class: AgentClass) -> &[AgentClass] {
        self.workers
            .get(class.as_db_str())
            .or_else(|| self.workers.get("default"))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Whether this stage names explicit workers (a handoff point) rather
    /// than inheriting the loader's `default: [lead]` fill.
    pub fn is_handoff(&self) -> bool {
        self.workers.keys().any(|k| k != "default")
            || self
                .workers
                .get("default")
                .map(|v| v.as_slice() != [AgentClass::Lead])
                .unwrap_or(false)
    }
}

/// A resolved task flow: the state machine a task of this `flow_type` runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFlow {
    pub name: String,
    pub description: String,
    /// First stage for newly created tasks.
    pub initial: String,
    pub stages: BTreeMap<String, Stage>,
}

impl TaskFlow {
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.get(name)
    }

    pub fn is_terminal(&self, status: &str) -> bool {
        self.stages.get(status).map(|s| s.terminal).unwrap_or(false)
    }

    /// The terminal stage reachable from the pass spine. Flows validate to
    /// exactly one.
    pub fn terminal_stage(&self) -> Option<&Stage> {
        self.stages.values().find(|s| s.terminal)
    }

    /// Valid next statuses out of `current` (pass and fail edges).
    pub fn valid_transitions(&self, current: &str) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        if let Some(stage) = self.stages.get(current) {
            if let Some(n) = &stage.next {
                out.insert(n.as_str());
            }
            if let Some(f) = &stage.fail {
                out.insert(f.as_str());
            }
        }
        out
    }

    /// The routed next status from `current` for a pass/fail outcome.
    pub fn next_status(&self, current: &str, passed: bool) -> Option<&str> {
        let stage = self.stages.get(current)?;
        if passed {
            stage.next.as_deref()
        } else {
            stage.fail.as_deref()
        }
    }

    /// Is `(from, to)` an edge of this flow? Creation rows (`from = None`)
    /// are valid only into the initial stage.
    pub fn is_edge(&self, from: Option<&str>, to: &str) -> bool {
        match from {
            None => to == self.initial,
            Some(f) => self.valid_transitions(f).contains(to),
        }
    }

    /// Stages unreachable from the initial stage via pass/fail edges.
    pub fn unreachable_stages(&self) -> Vec<&str> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        if self.stages.contains_key(self.initial.as_str()) {
            seen.insert(self.initial.as_str());
            queue.push_back(self.initial.as_str());
        }
        while let Some(cur) = queue.pop_front() {
            for next in self.valid_transitions(cur) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        self.stages
            .keys()
            .map(|k| k.as_str())
            .filter(|k| !seen.contains(k))
            .collect()
    }

    /// Ordered walk of the pass spine from the initial stage, for rendering.
    pub fn spine(&self) -> Vec<&str> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        let mut cur = Some(self.initial.as_str());
        while let Some(name) = cur {
            if !seen.insert(name) {
                break;
            }
            out.push(name);
            cur = self.stages.get(name).and_then(|s| s.next.as_deref());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FlowSet;

    fn bugfix() -> TaskFlow {
        FlowSet::builtin().get("bugfix").unwrap().clone()
    }

    #[test]
    fn base_pipeline_spine() {
        let flow = bugfix();
        assert_eq!(
            flow.spine(),
            vec!["open", "assigned", "in_progress", "fixed", "verified", "closed"]
        );
        assert!(flow.is_terminal("closed"));
        assert!(!flow.is_terminal("verified"));
    }

    #[test]
    fn fail_edges_route_backwards() {
        let flow = bugfix();
        assert_eq!(flow.next_status("fixed", false), Some("in_progress"));
        assert_eq!(flow.next_status("fixed", true), Some("verified"));
        assert_eq!(flow.next_status("closed", true), None);
    }

    #[test]
    fn edge_check_covers_creation() {
        let flow = bugfix();
        assert!(flow.is_edge(None, "open"));
        assert!(!flow.is_edge(None, "fixed"));
        assert!(flow.is_edge(Some("in_progress"), "fixed"));
        assert!(!flow.is_edge(Some("open"), "fixed"));
    }

    #[test]
    fn review_stage_workers_resolve_with_default_fallback() {
        let flow = bugfix();
        let fixed = flow.stage("fixed").unwrap();
        assert!(fixed.workers_for(AgentClass::Coder).contains(&AgentClass::Oracle));
        assert!(fixed.is_handoff());
        let open = flow.stage("open").unwrap();
        assert_eq!(open.workers_for(AgentClass::Coder), [AgentClass::Lead]);
        assert!(!open.is_handoff());
    }

    #[test]
    fn everything_reachable_in_builtins() {
        assert!(bugfix().unreachable_stages().is_empty());
    }
}
