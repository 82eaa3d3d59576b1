//! Flow inspection and manual transitions.

use crate::Ctx;
use clap::Subcommand;
use minion_core::{AgentName, Command, MinionError, MinionResult, TaskId};
use serde_json::{json, Value};

#[derive(Subcommand)]
pub enum FlowCommands {
    /// List available task flow types.
    ListFlows,
    /// Show a resolved flow definition.
    ShowFlow {
        #[arg(long)]
        name: String,
    },
    /// Preview where complete-phase would route a task.
    NextStatus {
        #[arg(long)]
        task_id: i64,
        #[arg(long)]
        failed: bool,
    },
    /// Manually transition a task along a flow edge.
    Transition {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        task_id: i64,
        #[arg(long)]
        to_status: String,
    },
}

impl FlowCommands {
    pub fn gate(&self) -> Command {
        match self {
            FlowCommands::ListFlows => Command::ListFlows,
            FlowCommands::ShowFlow { .. } => Command::ShowFlow,
            FlowCommands::NextStatus { .. } => Command::NextStatus,
            FlowCommands::Transition { .. } => Command::Transition,
        }
    }

    pub fn handle(self, ctx: &mut Ctx) -> MinionResult<Value> {
        match self {
            FlowCommands::ListFlows => Ok(json!({ "flows": ctx.store.flows().names() })),
            FlowCommands::ShowFlow { name } => {
                let flow = ctx
                    .store
                    .flows()
                    .require(&name)
                    .map_err(|e| MinionError::invalid(e.to_string()))?;
                Ok(serde_json::to_value(flow).unwrap_or_default())
            }
            FlowCommands::NextStatus { task_id, failed } => {
                let next = ctx.store.next_status(TaskId::from(task_id), failed)?;
                Ok(json!({ "task_id": task_id, "failed": failed, "next_status": next }))
            }
            FlowCommands::Transition { agent, task_id, to_status } => {
                let task = ctx.store.transition_task(
                    &AgentName::from(agent),
                    TaskId::from(task_id),
                    &to_status,
                )?;
                Ok(json!({ "status": "transitioned", "task": task }))
            }
        }
    }
}
