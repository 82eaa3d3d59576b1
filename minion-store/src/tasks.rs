//! Task DAG engine - typed state machine execution over loaded flows.
//!
//! Every transition is audited in `task_history`. Contended operations
//! (pull, complete) are single-transaction compare-and-set.

use crate::agents::{lookup_agent, require_agent, touch_last_seen};
use crate::store::{map_sql, now, opt_from_db, to_db};
use crate::Store;
use chrono::{DateTime, Utc};
use minion_core::{
    has_capability, AgentClass, AgentName, Capability, HpState, MinionError, MinionResult,
    PreconditionError, RowIdType, Task, TaskId, TaskTransition,
};
use minion_flow::StageGate;
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Activity level at which the drag warning fires.
const DRAG_WARNING_ACTIVITY: i64 = 4;

/// Inputs for create-task.
#[derive(Debug, Clone, Default)]
pub struct CreateTask {
    pub title: String,
    pub task_file: String,
    pub project: Option<String>,
    pub zone: Option<String>,
    pub blocked_by: Vec<TaskId>,
    pub class_required: Option<AgentClass>,
    pub flow_type: Option<String>,
    pub requirement_path: Option<String>,
}

/// Inputs for update-task. Status may only re-affirm the current stage;
/// stage movement goes through complete-phase or transition.
#[derive(Debug, Clone, Default)]
pub struct UpdateTask {
    pub status: Option<String>,
    pub progress: Option<String>,
    pub files: Option<String>,
}

/// Filters for list-tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<String>,
    pub project: Option<String>,
    pub zone: Option<String>,
    pub assigned_to: Option<AgentName>,
    pub class_required: Option<AgentClass>,
    /// Closed tasks are excluded unless a status filter names them.
    pub count: usize,
}

/// A task plus any advisory warnings an operation produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task: Task,
    pub warnings: Vec<String>,
}

/// Result of a successful pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullOutcome {
    pub task: Task,
    /// Spec file contents, inlined when readable.
    pub task_content: Option<String>,
}

/// Result of a phase completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteOutcome {
    pub task: Task,
    pub from_status: String,
    pub to_status: String,
    /// Worker classes eligible for the new stage.
    pub eligible: Vec<AgentClass>,
    /// The assignment was cleared for re-pull by an eligible class.
    pub unassigned: bool,
    pub terminal: bool,
    pub warnings: Vec<String>,
}

/// Ordered history plus the resolved flow, for DAG rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLineage {
    pub task: Task,
    pub history: Vec<TaskTransition>,
    pub flow_type: String,
    /// Pass-spine order of the flow's stages.
    pub stages: Vec<String>,
    /// Stages the task has actually been through.
    pub visited: Vec<String>,
}

impl Store {
    /// Create a task. Requires `manage`, an active plan, and an existing
    /// spec file; blockers must name real tasks.
    pub fn create_task(&mut self, creator: &AgentName, req: &CreateTask) -> MinionResult<Task> {
        let creator = creator.clone();
        let req = req.clone();
        let flows = self.flows.clone();
        self.with_tx(|tx| {
            let caller = require_agent(tx, &creator)?;
            if !has_capability(caller.class, Capability::Manage) {
                return Err(minion_core::AuthError::CapabilityMissing {
                    class: caller.class,
                    capability: Capability::Manage,
                    command: "create-task",
                }
                .into());
            }

            let active: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM battle_plans WHERE status = 'active'",
                    [],
                    |r| r.get(0),
                )
                .map_err(map_sql)?;
            if active == 0 {
                return Err(PreconditionError::NoActivePlan.into());
            }

            if !std::path::Path::new(&req.task_file).exists() {
                return Err(PreconditionError::MissingFile {
                    path: req.task_file.clone(),
                }
                .into());
            }

            let flow_type = req
                .flow_type
                .clone()
                .unwrap_or_else(|| minion_flow::DEFAULT_FLOW_TYPE.to_string());
            let flow = flows
                .require(&flow_type)
                .map_err(|e| MinionError::invalid(e.to_string()))?;

            for blocker in &req.blocked_by {
                let exists: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM tasks WHERE id = ?1",
                        params![blocker.as_i64()],
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(map_sql)?;
                if exists.is_none() {
                    return Err(MinionError::invalid(format!(
                        "blocked_by task #{} does not exist",
                        blocker
                    )));
                }
            }

            let ts = now();
            let blocked = encode_blockers(&req.blocked_by);
            tx.execute(
                "INSERT INTO tasks (title, task_file, project, zone, status, blocked_by,
                    class_required, flow_type, created_by, activity_count, requirement_path,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11, ?11)",
                params![
                    req.title,
                    req.task_file,
                    req.project,
                    req.zone,
                    flow.initial,
                    blocked,
                    req.class_required.map(|c| c.as_db_str()),
                    flow_type,
                    creator.as_str(),
                    req.requirement_path,
                    to_db(ts),
                ],
            )
            .map_err(map_sql)?;
            let id = TaskId::new(tx.last_insert_rowid());
            log_transition(tx, id, None, &flow.initial, &creator, ts)?;

            info!(task = %id, title = %req.title, flow = %flow_type, "task created");
            get_task_row(tx, id)
        })
    }

    /// Assign a task. Lead routing: `open` tasks transition to `assigned`;
    /// tasks sitting at `assigned` or a review handoff are re-pointed
    /// without a stage change. A CRITICAL assignee draws a warning, not a
    /// block.
    pub fn assign_task(
        &mut self,
        by: &AgentName,
        task_id: TaskId,
        assignee: &AgentName,
    ) -> MinionResult<TaskOutcome> {
        let (by, assignee) = (by.clone(), assignee.clone());
        let flows = self.flows.clone();
        self.with_tx(|tx| {
            if let Some((set_by, set_at)) = crate::flags::flag_state(tx, minion_core::FlagKey::MoonCrash)? {
                return Err(PreconditionError::MoonCrash { set_by, set_at }.into());
            }

            let caller = require_agent(tx, &by)?;
            if !has_capability(caller.class, Capability::Manage) {
                return Err(minion_core::AuthError::CapabilityMissing {
                    class: caller.class,
                    capability: Capability::Manage,
                    command: "assign-task",
                }
                .into());
            }
            let target = require_agent(tx, &assignee)?;

            let task = get_task_row(tx, task_id)?;
            let flow = flows
                .require(&task.flow_type)
                .map_err(|e| MinionError::invalid(e.to_string()))?;
            if flow.is_terminal(&task.status) {
                return Err(PreconditionError::TerminalTask {
                    task_id,
                    status: task.status.clone(),
                }
                .into());
            }

            let open_blockers = unclosed_blockers(tx, &task.blocked_by)?;
            if !open_blockers.is_empty() {
                return Err(blocked_by_error(task_id, &open_blockers));
            }

            let mut warnings = Vec::new();
            if target.hp.reading().state() == Some(HpState::Critical) {
                warnings.push(format!(
                    "{} is CRITICAL ({}) - consider fenix-down before new work",
                    assignee,
                    target.hp.reading().summary()
                ));
            }

            let ts = now();
            if task.status == flow.initial {
                tx.execute(
                    "UPDATE tasks SET assigned_to = ?1, status = 'assigned', updated_at = ?2 WHERE id = ?3",
                    params![assignee.as_str(), to_db(ts), task_id.as_i64()],
                )
                .map_err(map_sql)?;
                log_transition(tx, task_id, Some(&task.status), "assigned", &assignee, ts)?;
            } else {
                // Mid-flow reassignment keeps the stage.
                tx.execute(
                    "UPDATE tasks SET assigned_to = ?1, updated_at = ?2 WHERE id = ?3",
                    params![assignee.as_str(), to_db(ts), task_id.as_i64()],
                )
                .map_err(map_sql)?;
            }

            Ok(TaskOutcome {
                task: get_task_row(tx, task_id)?,
                warnings,
            })
        })
    }

    /// Race-safe task claim. Exactly one concurrent caller wins; losers see
    /// `AlreadyPulled`. From `open`/`assigned` the winner lands at
    /// `in_progress`; at a review handoff the stage holds and only the
    /// assignment changes hands.
    pub fn pull_task(&mut self, agent: &AgentName, task_id: TaskId) -> MinionResult<PullOutcome> {
        let agent = agent.clone();
        let flows = self.flows.clone();
        self.with_tx(|tx| {
            if let Some((set_by, set_at)) = crate::flags::flag_state(tx, minion_core::FlagKey::MoonCrash)? {
                return Err(PreconditionError::MoonCrash { set_by, set_at }.into());
            }
            let caller = require_agent(tx, &agent)?;
            let task = get_task_row(tx, task_id)?;
            let flow = flows
                .require(&task.flow_type)
                .map_err(|e| MinionError::invalid(e.to_string()))?;

            if flow.is_terminal(&task.status) {
                return Err(PreconditionError::TerminalTask {
                    task_id,
                    status: task.status.clone(),
                }
                .into());
            }

            let open_blockers = unclosed_blockers(tx, &task.blocked_by)?;
            if !open_blockers.is_empty() {
                return Err(blocked_by_error(task_id, &open_blockers));
            }

            let ts = now();
            let early = task.status == "open" || task.status == "assigned";
            if early {
                // Class gate: the task's required class, lead excepted.
                if let Some(required) = task.class_required {
                    if caller.class != required && caller.class != AgentClass::Lead {
                        return Err(PreconditionError::WorkerClassMismatch {
                            class: caller.class,
                            stage: task.status.clone(),
                            allowed: required.as_db_str().to_string(),
                        }
                        .into());
                    }
                }

                let changed = tx
                    .execute(
                        "UPDATE tasks SET status = 'in_progress', assigned_to = ?1,
                            activity_count = activity_count + 1, updated_at = ?2
                         WHERE id = ?3 AND status IN ('open', 'assigned')
                           AND (assigned_to IS NULL OR assigned_to = ?1)",
                        params![agent.as_str(), to_db(ts), task_id.as_i64()],
                    )
                    .map_err(map_sql)?;
                if changed == 0 {
                    return Err(PreconditionError::AlreadyPulled { task_id }.into());
                }

                if task.status == "open" {
                    log_transition(tx, task_id, Some("open"), "assigned", &agent, ts)?;
                }
                log_transition(tx, task_id, Some("assigned"), "in_progress", &agent, ts)?;
            } else if task.status == "in_progress" {
                // Another agent already holds the work stage.
                return Err(PreconditionError::AlreadyPulled { task_id }.into());
            } else {
                // Review handoff: the stage holds, the pull takes the seat.
                let stage = flow.stage(&task.status).ok_or_else(|| {
                    MinionError::invalid(format!(
                        "task #{} status '{}' is not a stage of flow '{}'",
                        task_id, task.status, task.flow_type
                    ))
                })?;
                let allowed = stage.workers_for(caller.class);
                if !allowed.contains(&caller.class) {
                    return Err(PreconditionError::WorkerClassMismatch {
                        class: caller.class,
                        stage: task.status.clone(),
                        allowed: classes_label(allowed),
                    }
                    .into());
                }
                let changed = tx
                    .execute(
                        "UPDATE tasks SET assigned_to = ?1, updated_at = ?2
                         WHERE id = ?3 AND status = ?4 AND (assigned_to IS NULL OR assigned_to = ?1)",
                        params![agent.as_str(), to_db(ts), task_id.as_i64(), task.status],
                    )
                    .map_err(map_sql)?;
                if changed == 0 {
                    return Err(PreconditionError::AlreadyPulled { task_id }.into());
                }
            }

            // Pulling is an implicit context refresh.
            tx.execute(
                "UPDATE agents SET context_updated_at = ?1, last_seen = ?1 WHERE name = ?2",
                params![to_db(ts), agent.as_str()],
            )
            .map_err(map_sql)?;

            let task = get_task_row(tx, task_id)?;
            let task_content = std::fs::read_to_string(&task.task_file).ok();
            info!(task = %task_id, agent = %agent, status = %task.status, "task pulled");
            Ok(PullOutcome { task, task_content })
        })
    }

    /// Mutate progress/files within the current stage. A status argument is
    /// accepted only when it re-affirms the current stage; stage movement
    /// must route through complete-phase.
    pub fn update_task(
        &mut self,
        agent: &AgentName,
        task_id: TaskId,
        update: &UpdateTask,
    ) -> MinionResult<TaskOutcome> {
        let agent = agent.clone();
        let update = update.clone();
        let flows = self.flows.clone();
        self.with_tx(|tx| {
            require_agent(tx, &agent)?;
            let task = get_task_row(tx, task_id)?;
            let flow = flows
                .require(&task.flow_type)
                .map_err(|e| MinionError::invalid(e.to_string()))?;
            if flow.is_terminal(&task.status) {
                return Err(PreconditionError::TerminalTask {
                    task_id,
                    status: task.status.clone(),
                }
                .into());
            }

            if let Some(requested) = &update.status {
                if *requested != task.status {
                    return Err(PreconditionError::InvalidTransition {
                        flow: task.flow_type.clone(),
                        from: task.status.clone(),
                        to: requested.clone(),
                    }
                    .into());
                }
            }

            let mut warnings = Vec::new();
            if let Some(assignee) = &task.assigned_to {
                if assignee.as_str() != agent.as_str() {
                    warnings.push(format!(
                        "task assigned to {}, updated by {}",
                        assignee, agent
                    ));
                }
            }

            let ts = now();
            tx.execute(
                "UPDATE tasks SET progress = COALESCE(?1, progress),
                    files = COALESCE(?2, files),
                    activity_count = activity_count + 1, updated_at = ?3
                 WHERE id = ?4",
                params![update.progress, update.files, to_db(ts), task_id.as_i64()],
            )
            .map_err(map_sql)?;
            touch_last_seen(tx, &agent)?;

            let task = get_task_row(tx, task_id)?;
            if task.activity_count >= DRAG_WARNING_ACTIVITY {
                warnings.push(drag_warning(task.activity_count));
            }
            Ok(TaskOutcome { task, warnings })
        })
    }

    /// Record the result file for a task. Required before any transition
    /// gated on `submit_result`.
    pub fn submit_result(
        &mut self,
        agent: &AgentName,
        task_id: TaskId,
        result_file: &str,
    ) -> MinionResult<Task> {
        let agent = agent.clone();
        let result_file = result_file.to_string();
        self.with_tx(|tx| {
            require_agent(tx, &agent)?;
            get_task_row(tx, task_id)?;
            if !std::path::Path::new(&result_file).exists() {
                return Err(PreconditionError::MissingFile {
                    path: result_file.clone(),
                }
                .into());
            }
            tx.execute(
                "UPDATE tasks SET result_file = ?1, updated_at = ?2 WHERE id = ?3",
                params![result_file, to_db(now()), task_id.as_i64()],
            )
            .map_err(map_sql)?;
            touch_last_seen(tx, &agent)?;
            get_task_row(tx, task_id)
        })
    }

    /// Complete the caller's phase; the flow decides where the task goes.
    pub fn complete_phase(
        &mut self,
        agent: &AgentName,
        task_id: TaskId,
        failed: bool,
    ) -> MinionResult<CompleteOutcome> {
        let agent = agent.clone();
        let flows = self.flows.clone();
        self.with_tx(|tx| {
            let caller = require_agent(tx, &agent)?;
            let task = get_task_row(tx, task_id)?;
            let flow = flows
                .require(&task.flow_type)
                .map_err(|e| MinionError::invalid(e.to_string()))?;
            let stage = flow.stage(&task.status).ok_or_else(|| {
                MinionError::invalid(format!(
                    "task #{} status '{}' is not a stage of flow '{}'",
                    task_id, task.status, task.flow_type
                ))
            })?;
            if stage.terminal {
                return Err(PreconditionError::TerminalTask {
                    task_id,
                    status: task.status.clone(),
                }
                .into());
            }

            // Worker check on the *current* stage: the assignee may always
            // finish their own phase; anyone else must be in the stage's
            // worker allow list.
            let is_assignee = task.assigned_to.as_ref().map(|a| a.as_str()) == Some(agent.as_str());
            let current_workers = stage.workers_for(caller.class);
            if !is_assignee && !current_workers.contains(&caller.class) {
                return Err(PreconditionError::WorkerClassMismatch {
                    class: caller.class,
                    stage: task.status.clone(),
                    allowed: classes_label(current_workers),
                }
                .into());
            }

            let to_status = flow
                .next_status(&task.status, !failed)
                .ok_or_else(|| PreconditionError::InvalidTransition {
                    flow: task.flow_type.clone(),
                    from: task.status.clone(),
                    to: if failed { "(fail)" } else { "(next)" }.to_string(),
                })?
                .to_string();
            let next_stage = flow.stage(&to_status).expect("validated edge target");

            // Gates guard entry to the target stage.
            if next_stage.requires.contains(&StageGate::SubmitResult) && task.result_file.is_none() {
                return Err(PreconditionError::MissingResult { task_id }.into());
            }

            let eligible = next_stage.workers_for(caller.class).to_vec();
            let unassigned = !next_stage.terminal && !eligible.contains(&caller.class);

            let ts = now();
            if unassigned {
                tx.execute(
                    "UPDATE tasks SET status = ?1, assigned_to = NULL,
                        activity_count = activity_count + 1, updated_at = ?2
                     WHERE id = ?3",
                    params![to_status, to_db(ts), task_id.as_i64()],
                )
                .map_err(map_sql)?;
            } else {
                tx.execute(
                    "UPDATE tasks SET status = ?1,
                        activity_count = activity_count + 1, updated_at = ?2
                     WHERE id = ?3",
                    params![to_status, to_db(ts), task_id.as_i64()],
                )
                .map_err(map_sql)?;
            }
            log_transition(tx, task_id, Some(&task.status), &to_status, &agent, ts)?;
            touch_last_seen(tx, &agent)?;

            let updated = get_task_row(tx, task_id)?;
            let mut warnings = Vec::new();
            if updated.activity_count >= DRAG_WARNING_ACTIVITY {
                warnings.push(drag_warning(updated.activity_count));
            }

            info!(
                task = %task_id, agent = %agent,
                from = %task.status, to = %to_status, failed, "phase completed"
            );
            Ok(CompleteOutcome {
                terminal: flow.is_terminal(&to_status),
                from_status: task.status.clone(),
                to_status,
                eligible,
                unassigned,
                task: updated,
                warnings,
            })
        })
    }

    /// Lead-only terminal transition. Requires a result file and a flow
    /// edge into the terminal stage.
    pub fn close_task(&mut self, by: &AgentName, task_id: TaskId) -> MinionResult<Task> {
        let by = by.clone();
        let flows = self.flows.clone();
        self.with_tx(|tx| {
            let caller = require_agent(tx, &by)?;
            if !has_capability(caller.class, Capability::Manage) {
                return Err(minion_core::AuthError::CapabilityMissing {
                    class: caller.class,
                    capability: Capability::Manage,
                    command: "close-task",
                }
                .into());
            }
            let task = get_task_row(tx, task_id)?;
            let flow = flows
                .require(&task.flow_type)
                .map_err(|e| MinionError::invalid(e.to_string()))?;
            if flow.is_terminal(&task.status) {
                return Err(PreconditionError::TerminalTask {
                    task_id,
                    status: task.status.clone(),
                }
                .into());
            }
            if task.result_file.is_none() {
                return Err(PreconditionError::MissingResult { task_id }.into());
            }
            let terminal = flow
                .terminal_stage()
                .map(|s| s.name.clone())
                .ok_or_else(|| MinionError::invalid("flow has no terminal stage"))?;
            if !flow.is_edge(Some(&task.status), &terminal) {
                return Err(PreconditionError::InvalidTransition {
                    flow: task.flow_type.clone(),
                    from: task.status.clone(),
                    to: terminal,
                }
                .into());
            }

            let ts = now();
            tx.execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![terminal, to_db(ts), task_id.as_i64()],
            )
            .map_err(map_sql)?;
            log_transition(tx, task_id, Some(&task.status), &terminal, &by, ts)?;
            info!(task = %task_id, by = %by, "task closed");
            get_task_row(tx, task_id)
        })
    }

    /// Lead-only: move a terminal task back to a named earlier stage and
    /// clear the assignment. The override is audited like everything else.
    pub fn reopen_task(
        &mut self,
        by: &AgentName,
        task_id: TaskId,
        to_status: &str,
    ) -> MinionResult<Task> {
        let by = by.clone();
        let to_status = to_status.to_string();
        let flows = self.flows.clone();
        self.with_tx(|tx| {
            let caller = require_agent(tx, &by)?;
            if !has_capability(caller.class, Capability::Manage) {
                return Err(minion_core::AuthError::CapabilityMissing {
                    class: caller.class,
                    capability: Capability::Manage,
                    command: "reopen-task",
                }
                .into());
            }
            let task = get_task_row(tx, task_id)?;
            let flow = flows
                .require(&task.flow_type)
                .map_err(|e| MinionError::invalid(e.to_string()))?;
            if !flow.is_terminal(&task.status) {
                return Err(MinionError::invalid(format!(
                    "task #{} is not terminal (status '{}')",
                    task_id, task.status
                )));
            }
            if flow.stage(&to_status).is_none() || flow.is_terminal(&to_status) {
                return Err(MinionError::invalid(format!(
                    "invalid reopen target '{}' for flow '{}'",
                    to_status, task.flow_type
                )));
            }

            let ts = now();
            tx.execute(
                "UPDATE tasks SET status = ?1, assigned_to = NULL, updated_at = ?2 WHERE id = ?3",
                params![to_status, to_db(ts), task_id.as_i64()],
            )
            .map_err(map_sql)?;
            log_transition(tx, task_id, Some(&task.status), &to_status, &by, ts)?;
            info!(task = %task_id, by = %by, to = %to_status, "task reopened");
            get_task_row(tx, task_id)
        })
    }

    /// Manual transition along a flow edge, for lead intervention.
    pub fn transition_task(
        &mut self,
        by: &AgentName,
        task_id: TaskId,
        to_status: &str,
    ) -> MinionResult<Task> {
        let by = by.clone();
        let to_status = to_status.to_string();
        let flows = self.flows.clone();
        self.with_tx(|tx| {
            let caller = require_agent(tx, &by)?;
            if !has_capability(caller.class, Capability::Manage) {
                return Err(minion_core::AuthError::CapabilityMissing {
                    class: caller.class,
                    capability: Capability::Manage,
                    command: "transition",
                }
                .into());
            }
            let task = get_task_row(tx, task_id)?;
            let flow = flows
                .require(&task.flow_type)
                .map_err(|e| MinionError::invalid(e.to_string()))?;
            if !flow.is_edge(Some(&task.status), &to_status) {
                return Err(PreconditionError::InvalidTransition {
                    flow: task.flow_type.clone(),
                    from: task.status.clone(),
                    to: to_status.clone(),
                }
                .into());
            }
            if let Some(stage) = flow.stage(&to_status) {
                if stage.requires.contains(&StageGate::SubmitResult) && task.result_file.is_none() {
                    return Err(PreconditionError::MissingResult { task_id }.into());
                }
            }
            let ts = now();
            tx.execute(
                "UPDATE tasks SET status = ?1, activity_count = activity_count + 1, updated_at = ?2
                 WHERE id = ?3",
                params![to_status, to_db(ts), task_id.as_i64()],
            )
            .map_err(map_sql)?;
            log_transition(tx, task_id, Some(&task.status), &to_status, &by, ts)?;
            get_task_row(tx, task_id)
        })
    }

    /// Preview where complete-phase would send a task.
    pub fn next_status(&mut self, task_id: TaskId, failed: bool) -> MinionResult<Option<String>> {
        let flows = self.flows.clone();
        self.with_tx(|tx| {
            let task = get_task_row(tx, task_id)?;
            let flow = flows
                .require(&task.flow_type)
                .map_err(|e| MinionError::invalid(e.to_string()))?;
            Ok(flow.next_status(&task.status, !failed).map(String::from))
        })
    }

    pub fn get_task(&mut self, task_id: TaskId) -> MinionResult<Task> {
        self.with_tx(|tx| get_task_row(tx, task_id))
    }

    pub fn list_tasks(&mut self, filter: &TaskFilter) -> MinionResult<Vec<Task>> {
        let filter = filter.clone();
        self.with_tx(|tx| {
            let mut sql = String::from("SELECT * FROM tasks WHERE 1=1");
            let mut args: Vec<String> = Vec::new();
            match &filter.status {
                Some(status) => {
                    sql.push_str(" AND status = ?");
                    args.push(status.clone());
                }
                None => sql.push_str(" AND status NOT IN ('closed')"),
            }
            if let Some(project) = &filter.project {
                sql.push_str(" AND project = ?");
                args.push(project.clone());
            }
            if let Some(zone) = &filter.zone {
                sql.push_str(" AND zone = ?");
                args.push(zone.clone());
            }
            if let Some(assignee) = &filter.assigned_to {
                sql.push_str(" AND assigned_to = ?");
                args.push(assignee.to_string());
            }
            if let Some(class) = filter.class_required {
                sql.push_str(" AND class_required = ?");
                args.push(class.as_db_str().to_string());
            }
            let limit = if filter.count == 0 { 50 } else { filter.count };
            sql.push_str(&format!(" ORDER BY created_at DESC, id DESC LIMIT {}", limit));

            let mut stmt = tx.prepare(&sql).map_err(map_sql)?;
            let tasks = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), task_from_row)
                .map_err(map_sql)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_sql)?;
            Ok(tasks)
        })
    }

    /// Ordered history plus the resolved flow for lineage rendering.
    pub fn task_lineage(&mut self, task_id: TaskId) -> MinionResult<TaskLineage> {
        let flows = self.flows.clone();
        self.with_tx(|tx| {
            let task = get_task_row(tx, task_id)?;
            let flow = flows
                .require(&task.flow_type)
                .map_err(|e| MinionError::invalid(e.to_string()))?;

            let history = task_history(tx, task_id)?;
            let mut visited: Vec<String> = Vec::new();
            for row in &history {
                if !visited.iter().any(|v| v == &row.to_status) {
                    visited.push(row.to_status.clone());
                }
            }

            Ok(TaskLineage {
                flow_type: task.flow_type.clone(),
                stages: flow.spine().into_iter().map(String::from).collect(),
                visited,
                history,
                task,
            })
        })
    }

    /// Full audited history for a task, ordered by insertion.
    pub fn get_task_history(&mut self, task_id: TaskId) -> MinionResult<Vec<TaskTransition>> {
        self.with_tx(|tx| task_history(tx, task_id))
    }
}

// ============================================================================
// SHARED HELPERS
// ============================================================================

pub(crate) fn get_task_row(tx: &Transaction<'_>, id: TaskId) -> MinionResult<Task> {
    tx.query_row(
        "SELECT * FROM tasks WHERE id = ?1",
        params![id.as_i64()],
        task_from_row,
    )
    .optional()
    .map_err(map_sql)?
    .ok_or_else(|| PreconditionError::UnknownTask { task_id: id }.into())
}

pub(crate) fn log_transition(
    tx: &Transaction<'_>,
    task_id: TaskId,
    from: Option<&str>,
    to: &str,
    agent: &AgentName,
    ts: DateTime<Utc>,
) -> MinionResult<()> {
    tx.execute(
        "INSERT INTO task_history (task_id, from_status, to_status, agent, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![task_id.as_i64(), from, to, agent.as_str(), to_db(ts)],
    )
    .map_err(map_sql)?;
    Ok(())
}

fn task_history(tx: &Transaction<'_>, task_id: TaskId) -> MinionResult<Vec<TaskTransition>> {
    let mut stmt = tx
        .prepare(
            "SELECT task_id, from_status, to_status, agent, timestamp
             FROM task_history WHERE task_id = ?1 ORDER BY id ASC",
        )
        .map_err(map_sql)?;
    let rows = stmt
        .query_map(params![task_id.as_i64()], |row| {
            Ok(TaskTransition {
                task_id: TaskId::new(row.get(0)?),
                from_status: row.get(1)?,
                to_status: row.get(2)?,
                agent: AgentName::from(row.get::<_, String>(3)?),
                timestamp: opt_from_db(Some(row.get::<_, String>(4)?))
                    .unwrap_or_else(chrono::Utc::now),
            })
        })
        .map_err(map_sql)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(map_sql)?;
    Ok(rows)
}

/// Blockers still open (anything not closed counts as open).
pub(crate) fn unclosed_blockers(
    tx: &Transaction<'_>,
    blockers: &[TaskId],
) -> MinionResult<Vec<TaskId>> {
    let mut open = Vec::new();
    for id in blockers {
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM tasks WHERE id = ?1",
                params![id.as_i64()],
                |r| r.get(0),
            )
            .optional()
            .map_err(map_sql)?;
        match status {
            Some(s) if s == "closed" => {}
            // A vanished blocker no longer blocks.
            None => {}
            Some(_) => open.push(*id),
        }
    }
    Ok(open)
}

fn blocked_by_error(task_id: TaskId, open: &[TaskId]) -> MinionError {
    PreconditionError::BlockedBy {
        task_id,
        open: open.len(),
        blockers: open
            .iter()
            .map(|id| format!("#{}", id))
            .collect::<Vec<_>>()
            .join(", "),
    }
    .into()
}

fn drag_warning(activity: i64) -> String {
    format!(
        "activity count at {} - this fight is dragging, consider reassessing",
        activity
    )
}

fn classes_label(classes: &[AgentClass]) -> String {
    classes
        .iter()
        .map(|c| c.as_db_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn encode_blockers(blockers: &[TaskId]) -> Option<String> {
    if blockers.is_empty() {
        None
    } else {
        Some(
            blockers
                .iter()
                .map(|id| id.as_i64().to_string())
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

pub(crate) fn decode_blockers(raw: Option<String>) -> Vec<TaskId> {
    raw.map(|s| {
        s.split(',')
            .filter_map(|part| part.trim().parse::<i64>().ok())
            .map(TaskId::new)
            .collect()
    })
    .unwrap_or_default()
}

pub(crate) fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let class_required: Option<String> = row.get("class_required")?;
    Ok(Task {
        id: TaskId::new(row.get("id")?),
        title: row.get("title")?,
        task_file: row.get("task_file")?,
        project: row.get("project")?,
        zone: row.get("zone")?,
        status: row.get("status")?,
        blocked_by: decode_blockers(row.get("blocked_by")?),
        assigned_to: row
            .get::<_, Option<String>>("assigned_to")?
            .map(AgentName::from),
        created_by: AgentName::from(row.get::<_, String>("created_by")?),
        files: row.get("files")?,
        progress: row.get("progress")?,
        class_required: class_required
            .as_deref()
            .and_then(|c| AgentClass::from_db_str(c).ok()),
        flow_type: row.get("flow_type")?,
        activity_count: row.get("activity_count")?,
        result_file: row.get("result_file")?,
        requirement_path: row.get("requirement_path")?,
        created_at: opt_from_db(Some(row.get::<_, String>("created_at")?))
            .unwrap_or_else(chrono::Utc::now),
        updated_at: opt_from_db(Some(row.get::<_, String>("updated_at")?))
            .unwrap_or_else(chrono::Utc::now),
    })
}
