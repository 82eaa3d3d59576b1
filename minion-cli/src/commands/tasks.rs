//! Task engine commands.

use crate::commands::agents::AgentClassArg;
use crate::Ctx;
use clap::Subcommand;
use minion_core::{AgentName, Command, MinionResult, TaskId};
use minion_store::{CreateTask, TaskFilter, UpdateTask};
use serde_json::{json, Value};

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Create a task from a spec file.
    CreateTask {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        task_file: String,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        zone: Option<String>,
        /// Comma-separated blocker task ids.
        #[arg(long)]
        blocked_by: Option<String>,
        #[arg(long)]
        class_required: Option<AgentClassArg>,
        #[arg(long, value_name = "FLOW")]
        flow_type: Option<String>,
        #[arg(long)]
        requirement_path: Option<String>,
    },
    /// Assign a task to an agent.
    AssignTask {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        task_id: i64,
        #[arg(long)]
        to: String,
    },
    /// Race-safe claim of an actionable task.
    PullTask {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        task_id: i64,
    },
    /// Update progress/files within the current stage.
    UpdateTask {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        task_id: i64,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        progress: Option<String>,
        #[arg(long)]
        files: Option<String>,
    },
    /// Record the result file for a task.
    SubmitResult {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        task_id: i64,
        #[arg(long)]
        result_file: String,
    },
    /// Complete your phase; the flow routes the task onward.
    CompletePhase {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        task_id: i64,
        /// Route along the fail edge instead of next.
        #[arg(long)]
        failed: bool,
    },
    /// Lead-only terminal transition (requires a result file).
    CloseTask {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        task_id: i64,
    },
    /// Lead-only: reopen a terminal task to an earlier stage.
    ReopenTask {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        task_id: i64,
        #[arg(long, default_value = "assigned")]
        to_status: String,
    },
    /// Full detail for one task.
    GetTask {
        #[arg(long)]
        task_id: i64,
    },
    /// List tasks with filters (closed excluded by default).
    ListTasks {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        zone: Option<String>,
        #[arg(long)]
        assigned_to: Option<String>,
        #[arg(long)]
        class_required: Option<AgentClassArg>,
        #[arg(long, default_value_t = 50)]
        count: usize,
    },
    /// History plus resolved flow, for DAG rendering.
    TaskLineage {
        #[arg(long)]
        task_id: i64,
    },
}

impl TaskCommands {
    pub fn gate(&self) -> Command {
        match self {
            TaskCommands::CreateTask { .. } => Command::CreateTask,
            TaskCommands::AssignTask { .. } => Command::AssignTask,
            TaskCommands::PullTask { .. } => Command::PullTask,
            TaskCommands::UpdateTask { .. } => Command::UpdateTask,
            TaskCommands::SubmitResult { .. } => Command::SubmitResult,
            TaskCommands::CompletePhase { .. } => Command::CompletePhase,
            TaskCommands::CloseTask { .. } => Command::CloseTask,
            TaskCommands::ReopenTask { .. } => Command::ReopenTask,
            TaskCommands::GetTask { .. } => Command::GetTask,
            TaskCommands::ListTasks { .. } => Command::ListTasks,
            TaskCommands::TaskLineage { .. } => Command::TaskLineage,
        }
    }

    pub fn handle(self, ctx: &mut Ctx) -> MinionResult<Value> {
        match self {
            TaskCommands::CreateTask {
                agent,
                title,
                task_file,
                project,
                zone,
                blocked_by,
                class_required,
                flow_type,
                requirement_path,
            } => {
                let blocked_by = parse_task_ids(blocked_by.as_deref())?;
                let task = ctx.store.create_task(
                    &AgentName::from(agent),
                    &CreateTask {
                        title,
                        task_file,
                        project,
                        zone,
                        blocked_by,
                        class_required: class_required.map(|c| c.0),
                        flow_type,
                        requirement_path,
                    },
                )?;
                Ok(json!({ "status": "created", "task": task }))
            }
            TaskCommands::AssignTask { agent, task_id, to } => {
                let outcome = ctx.store.assign_task(
                    &AgentName::from(agent),
                    TaskId::from(task_id),
                    &AgentName::from(to),
                )?;
                Ok(serde_json::to_value(outcome).unwrap_or_default())
            }
            TaskCommands::PullTask { agent, task_id } => {
                let outcome = ctx
                    .store
                    .pull_task(&AgentName::from(agent), TaskId::from(task_id))?;
                Ok(serde_json::to_value(outcome).unwrap_or_default())
            }
            TaskCommands::UpdateTask {
                agent,
                task_id,
                status,
                progress,
                files,
            } => {
                let outcome = ctx.store.update_task(
                    &AgentName::from(agent),
                    TaskId::from(task_id),
                    &UpdateTask { status, progress, files },
                )?;
                Ok(serde_json::to_value(outcome).unwrap_or_default())
            }
            TaskCommands::SubmitResult { agent, task_id, result_file } => {
                let task = ctx.store.submit_result(
                    &AgentName::from(agent),
                    TaskId::from(task_id),
                    &result_file,
                )?;
                Ok(json!({ "status": "submitted", "task": task }))
            }
            TaskCommands::CompletePhase { agent, task_id, failed } => {
                let outcome = ctx.store.complete_phase(
                    &AgentName::from(agent),
                    TaskId::from(task_id),
                    failed,
                )?;
                Ok(serde_json::to_value(outcome).unwrap_or_default())
            }
            TaskCommands::CloseTask { agent, task_id } => {
                let task = ctx
                    .store
                    .close_task(&AgentName::from(agent), TaskId::from(task_id))?;
                Ok(json!({ "status": "closed", "task": task }))
            }
            TaskCommands::ReopenTask { agent, task_id, to_status } => {
                let task = ctx.store.reopen_task(
                    &AgentName::from(agent),
                    TaskId::from(task_id),
                    &to_status,
                )?;
                Ok(json!({ "status": "reopened", "task": task }))
            }
            TaskCommands::GetTask { task_id } => {
                let task = ctx.store.get_task(TaskId::from(task_id))?;
                Ok(json!({ "task": task }))
            }
            TaskCommands::ListTasks {
                status,
                project,
                zone,
                assigned_to,
                class_required,
                count,
            } => {
                let tasks = ctx.store.list_tasks(&TaskFilter {
                    status,
                    project,
                    zone,
                    assigned_to: assigned_to.map(AgentName::from),
                    class_required: class_required.map(|c| c.0),
                    count,
                })?;
                Ok(json!({ "tasks": tasks }))
            }
            TaskCommands::TaskLineage { task_id } => {
                let lineage = ctx.store.task_lineage(TaskId::from(task_id))?;
                Ok(serde_json::to_value(lineage).unwrap_or_default())
            }
        }
    }
}

fn parse_task_ids(raw: Option<&str>) -> MinionResult<Vec<TaskId>> {
    let mut out = Vec::new();
    if let Some(raw) = raw {
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let id: i64 = part.parse().map_err(|_| {
                minion_core::MinionError::invalid(format!("invalid task id '{}'", part))
            })?;
            out.push(TaskId::from(id));
        }
    }
    Ok(out)
}
