//! Agent registry commands.

use crate::Ctx;
use clap::Subcommand;
use minion_core::{
    AgentClass, AgentName, Command, MinionError, MinionResult, Transport,
};
use minion_store::ContextUpdate;
use serde_json::{json, Value};

#[derive(Subcommand)]
pub enum AgentCommands {
    /// Register an agent (idempotent on name).
    Register {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        class: AgentClassArg,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value = "terminal")]
        transport: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Remove an agent, releasing its claims.
    Deregister {
        #[arg(long)]
        agent: String,
    },
    /// Rename an agent; message addressing follows.
    Rename {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// List all registered agents with liveness and HP.
    Who,
    /// Update context summary (and optionally self-reported HP).
    SetContext {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        context: String,
        #[arg(long)]
        tokens_used: Option<u64>,
        #[arg(long)]
        tokens_limit: Option<u64>,
        /// Self-reported HP percentage (switches HP mode).
        #[arg(long)]
        hp: Option<u8>,
        /// Comma-separated files modified since the last update.
        #[arg(long)]
        files_modified: Option<String>,
    },
    /// Set the agent's status line.
    SetStatus {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        status: String,
    },
    /// Recovery briefing: fenix records, plan, open tasks, HP.
    ColdStart {
        #[arg(long)]
        agent: String,
    },
    /// Record a knowledge dump before context death.
    FenixDown {
        #[arg(long)]
        agent: String,
        /// Comma-separated file paths written this session.
        #[arg(long)]
        files: String,
        #[arg(long, default_value = "")]
        manifest: String,
    },
    /// Daemon-only: write observed HP telemetry.
    UpdateHp {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        input_tokens: u64,
        #[arg(long)]
        output_tokens: u64,
        #[arg(long)]
        limit: u64,
        #[arg(long)]
        turn_input: Option<u64>,
        #[arg(long)]
        turn_output: Option<u64>,
    },
    /// Judge an agent's activity from tasks and claim mtimes.
    CheckActivity {
        #[arg(long)]
        agent: String,
    },
    /// Compare file mtimes against an agent's last set-context.
    CheckFreshness {
        #[arg(long)]
        agent: String,
        /// Comma-separated file paths.
        #[arg(long)]
        files: String,
    },
}

/// Clap-parseable wrapper for agent classes.
#[derive(Clone, Copy, Debug)]
pub struct AgentClassArg(pub AgentClass);

impl std::str::FromStr for AgentClassArg {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentClass::from_db_str(s)
            .map(AgentClassArg)
            .map_err(|e| e.to_string())
    }
}

impl AgentCommands {
    pub fn gate(&self) -> Command {
        match self {
            AgentCommands::Register { .. } => Command::Register,
            AgentCommands::Deregister { .. } => Command::Deregister,
            AgentCommands::Rename { .. } => Command::Rename,
            AgentCommands::Who => Command::Who,
            AgentCommands::SetContext { .. } => Command::SetContext,
            AgentCommands::SetStatus { .. } => Command::SetStatus,
            AgentCommands::ColdStart { .. } => Command::ColdStart,
            AgentCommands::FenixDown { .. } => Command::FenixDown,
            AgentCommands::UpdateHp { .. } => Command::UpdateHp,
            AgentCommands::CheckActivity { .. } => Command::CheckActivity,
            AgentCommands::CheckFreshness { .. } => Command::CheckFreshness,
        }
    }

    pub fn handle(self, ctx: &mut Ctx) -> MinionResult<Value> {
        match self {
            AgentCommands::Register {
                agent,
                class,
                model,
                transport,
                description,
            } => {
                let transport = Transport::from_db_str(&transport)
                    .map_err(|e| MinionError::invalid(e.to_string()))?;
                let registration = ctx.store.register(
                    &AgentName::from(agent),
                    class.0,
                    model.as_deref(),
                    transport,
                    description.as_deref(),
                )?;
                Ok(json!({
                    "status": if registration.refreshed { "refreshed" } else { "registered" },
                    "agent": registration.agent,
                    "class": registration.class,
                    "transport": registration.transport,
                    "tools": tools_catalog(registration.class),
                    "triggers": minion_store::trigger_codebook(),
                }))
            }
            AgentCommands::Deregister { agent } => {
                let released = ctx.store.deregister(&AgentName::from(agent.as_str()))?;
                Ok(json!({ "status": "deregistered", "agent": agent, "released_claims": released }))
            }
            AgentCommands::Rename { from, to } => {
                ctx.store
                    .rename(&AgentName::from(from.as_str()), &AgentName::from(to.as_str()))?;
                Ok(json!({ "status": "renamed", "from": from, "to": to }))
            }
            AgentCommands::Who => {
                let agents = ctx.store.who()?;
                Ok(json!({ "agents": agents }))
            }
            AgentCommands::SetContext {
                agent,
                context,
                tokens_used,
                tokens_limit,
                hp,
                files_modified,
            } => {
                let outcome = ctx.store.set_context(
                    &AgentName::from(agent),
                    &ContextUpdate {
                        context,
                        tokens_used,
                        tokens_limit,
                        hp,
                        files_modified: split_list(files_modified.as_deref()),
                    },
                )?;
                Ok(serde_json::to_value(outcome).unwrap_or_default())
            }
            AgentCommands::SetStatus { agent, status } => {
                ctx.store.set_status(&AgentName::from(agent.as_str()), &status)?;
                Ok(json!({ "status": "ok", "agent": agent, "new_status": status }))
            }
            AgentCommands::ColdStart { agent } => {
                let briefing = ctx.store.cold_start(&AgentName::from(agent))?;
                Ok(serde_json::to_value(briefing).unwrap_or_default())
            }
            AgentCommands::FenixDown { agent, files, manifest } => {
                let record = ctx.store.fenix_down(
                    &AgentName::from(agent.as_str()),
                    &split_list(Some(&files)),
                    &manifest,
                )?;
                Ok(json!({ "status": "recorded", "agent": agent, "record_id": record }))
            }
            AgentCommands::UpdateHp {
                agent,
                input_tokens,
                output_tokens,
                limit,
                turn_input,
                turn_output,
            } => {
                let outcome = ctx.store.update_hp(
                    &AgentName::from(agent),
                    &minion_store::HpSample {
                        input_tokens,
                        output_tokens,
                        limit,
                        turn_input,
                        turn_output,
                    },
                )?;
                Ok(serde_json::to_value(outcome).unwrap_or_default())
            }
            AgentCommands::CheckActivity { agent } => {
                let report = ctx.store.check_activity(&AgentName::from(agent))?;
                Ok(serde_json::to_value(report).unwrap_or_default())
            }
            AgentCommands::CheckFreshness { agent, files } => {
                let report = ctx
                    .store
                    .check_freshness(&AgentName::from(agent), &split_list(Some(&files)))?;
                Ok(serde_json::to_value(report).unwrap_or_default())
            }
        }
    }
}

pub(crate) fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

pub(crate) fn tools_catalog(class: AgentClass) -> Vec<Value> {
    minion_core::tools_for_class(class)
        .into_iter()
        .map(|cmd| {
            json!({
                "command": format!("minion {}", cmd.cli_name()),
                "description": cmd.description(),
            })
        })
        .collect()
}
