//! Observability commands.

use crate::commands::agents::tools_catalog;
use crate::Ctx;
use clap::Subcommand;
use minion_core::{AgentName, Command, MinionResult};
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Subcommand)]
pub enum ObserveCommands {
    /// Full party health dashboard.
    PartyStatus,
    /// Fused picture: agents + tasks + claims + flags + plan + comms.
    Sitrep,
    /// Block until messages or tasks arrive (exit 0), the timeout passes
    /// (exit 1), or a shutdown signal lands (exit 3).
    Poll {
        #[arg(long)]
        agent: String,
        #[arg(long, default_value_t = 5)]
        interval: u64,
        /// 0 means block forever.
        #[arg(long, default_value_t = 0)]
        timeout: u64,
    },
    /// Commands available to your class.
    ListTools,
}

impl ObserveCommands {
    pub fn gate(&self) -> Command {
        match self {
            ObserveCommands::PartyStatus => Command::PartyStatus,
            ObserveCommands::Sitrep => Command::Sitrep,
            ObserveCommands::Poll { .. } => Command::Poll,
            ObserveCommands::ListTools => Command::ListTools,
        }
    }

    pub fn handle(self, ctx: &mut Ctx) -> MinionResult<Value> {
        match self {
            ObserveCommands::PartyStatus => {
                let agents = ctx.store.party_status()?;
                Ok(json!({ "agents": agents }))
            }
            ObserveCommands::Sitrep => {
                let sitrep = ctx.store.sitrep()?;
                Ok(serde_json::to_value(sitrep).unwrap_or_default())
            }
            ObserveCommands::Poll { agent, interval, timeout } => {
                let agent = AgentName::from(agent);
                let interval = interval.max(1);
                let mut elapsed = 0u64;
                loop {
                    let result = ctx.store.poll_once(&agent)?;
                    if !result.is_empty() {
                        let code = result.exit_code();
                        crate::output::print(
                            &serde_json::to_value(&result).unwrap_or_default(),
                            false,
                        );
                        std::process::exit(code);
                    }
                    std::thread::sleep(Duration::from_secs(interval));
                    elapsed += interval;
                    if timeout > 0 && elapsed >= timeout {
                        crate::output::print(&json!({ "exit_code": 1, "timeout": true }), false);
                        std::process::exit(1);
                    }
                }
            }
            ObserveCommands::ListTools => {
                Ok(json!({ "class": ctx.caller.class, "tools": tools_catalog(ctx.caller.class) }))
            }
        }
    }
}
