//! Messaging commands.

use crate::commands::agents::split_list;
use crate::Ctx;
use clap::Subcommand;
use minion_core::{AgentName, Command, MinionResult};
use serde_json::{json, Value};

#[derive(Subcommand)]
pub enum CommsCommands {
    /// Send a message to an agent, a class name, or "all".
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        message: String,
        /// Comma-separated explicit CC list.
        #[arg(long)]
        cc: Option<String>,
    },
    /// Drain unread messages (marks them read).
    CheckInbox {
        #[arg(long)]
        agent: String,
    },
    /// Delete read messages older than the window.
    PurgeInbox {
        #[arg(long)]
        agent: String,
        #[arg(long, default_value_t = 2)]
        older_than_hours: i64,
    },
    /// Last N messages across all agents.
    GetHistory {
        #[arg(long, default_value_t = 20)]
        count: usize,
    },
    /// The trigger word codebook.
    ListTriggers,
    /// Clear the moon_crash emergency flag.
    ClearMoonCrash {
        #[arg(long)]
        agent: String,
    },
}

impl CommsCommands {
    pub fn gate(&self) -> Command {
        match self {
            CommsCommands::Send { .. } => Command::Send,
            CommsCommands::CheckInbox { .. } => Command::CheckInbox,
            CommsCommands::PurgeInbox { .. } => Command::PurgeInbox,
            CommsCommands::GetHistory { .. } => Command::GetHistory,
            CommsCommands::ListTriggers => Command::ListTriggers,
            CommsCommands::ClearMoonCrash { .. } => Command::ClearMoonCrash,
        }
    }

    pub fn handle(self, ctx: &mut Ctx) -> MinionResult<Value> {
        match self {
            CommsCommands::Send { from, to, message, cc } => {
                let cc: Vec<AgentName> = split_list(cc.as_deref())
                    .into_iter()
                    .map(AgentName::from)
                    .collect();
                let outcome = ctx.store.send(&AgentName::from(from), &to, &message, &cc)?;
                Ok(serde_json::to_value(outcome).unwrap_or_default())
            }
            CommsCommands::CheckInbox { agent } => {
                let messages = ctx.store.check_inbox(&AgentName::from(agent))?;
                Ok(json!({ "messages": messages }))
            }
            CommsCommands::PurgeInbox { agent, older_than_hours } => {
                let deleted = ctx
                    .store
                    .purge_inbox(&AgentName::from(agent.as_str()), older_than_hours)?;
                Ok(json!({
                    "status": "purged",
                    "agent": agent,
                    "deleted": deleted,
                    "older_than_hours": older_than_hours,
                }))
            }
            CommsCommands::GetHistory { count } => {
                let messages = ctx.store.get_history(count)?;
                Ok(json!({ "messages": messages }))
            }
            CommsCommands::ListTriggers => Ok(json!({ "triggers": minion_store::trigger_codebook() })),
            CommsCommands::ClearMoonCrash { agent } => {
                let cleared = ctx.store.clear_moon_crash(&AgentName::from(agent))?;
                Ok(json!({ "status": if cleared { "cleared" } else { "not_set" } }))
            }
        }
    }
}
