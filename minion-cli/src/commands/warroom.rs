//! War-room commands - plans and the raid log.

use crate::Ctx;
use clap::Subcommand;
use minion_core::{AgentName, Command, LogPriority, MinionError, MinionResult, PlanId, PlanStatus};
use serde_json::{json, Value};

#[derive(Subcommand)]
pub enum WarRoomCommands {
    /// Set the active battle plan (supersedes any prior active plan).
    SetPlan {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        plan: String,
    },
    /// Get plans by status.
    GetPlan {
        #[arg(long, default_value = "active")]
        status: String,
    },
    /// Update a plan's status.
    UpdatePlanStatus {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        plan_id: i64,
        #[arg(long)]
        status: String,
    },
    /// Append an entry to the raid log.
    Log {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        entry: String,
        #[arg(long, default_value = "normal")]
        priority: String,
    },
    /// Read the raid log, newest first.
    GetLog {
        #[arg(long)]
        priority: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long, default_value_t = 20)]
        count: usize,
    },
}

impl WarRoomCommands {
    pub fn gate(&self) -> Command {
        match self {
            WarRoomCommands::SetPlan { .. } => Command::SetPlan,
            WarRoomCommands::GetPlan { .. } => Command::GetPlan,
            WarRoomCommands::UpdatePlanStatus { .. } => Command::UpdatePlanStatus,
            WarRoomCommands::Log { .. } => Command::Log,
            WarRoomCommands::GetLog { .. } => Command::GetLog,
        }
    }

    pub fn handle(self, ctx: &mut Ctx) -> MinionResult<Value> {
        match self {
            WarRoomCommands::SetPlan { agent, plan } => {
                let plan = ctx.store.set_plan(&AgentName::from(agent), &plan)?;
                Ok(json!({ "status": "active", "plan": plan }))
            }
            WarRoomCommands::GetPlan { status } => {
                let status = PlanStatus::from_db_str(&status)
                    .map_err(|e| MinionError::invalid(e.to_string()))?;
                let plans = ctx.store.get_plans(status)?;
                Ok(json!({ "plans": plans }))
            }
            WarRoomCommands::UpdatePlanStatus { agent, plan_id, status } => {
                let status = PlanStatus::from_db_str(&status)
                    .map_err(|e| MinionError::invalid(e.to_string()))?;
                ctx.store
                    .update_plan_status(&AgentName::from(agent), PlanId::from(plan_id), status)?;
                Ok(json!({ "status": "updated", "plan_id": plan_id, "new_status": status }))
            }
            WarRoomCommands::Log { agent, entry, priority } => {
                let priority = LogPriority::from_db_str(&priority)
                    .map_err(|e| MinionError::invalid(e.to_string()))?;
                let entry = ctx.store.log(&AgentName::from(agent), &entry, priority)?;
                Ok(json!({ "status": "logged", "entry": entry }))
            }
            WarRoomCommands::GetLog { priority, agent, count } => {
                let priority = priority
                    .map(|p| LogPriority::from_db_str(&p))
                    .transpose()
                    .map_err(|e| MinionError::invalid(e.to_string()))?;
                let agent = agent.map(AgentName::from);
                let entries = ctx.store.get_log(priority, agent.as_ref(), count)?;
                Ok(json!({ "entries": entries }))
            }
        }
    }
}
