//! File claim commands.

use crate::Ctx;
use clap::Subcommand;
use minion_core::{AgentName, Command, MinionResult};
use serde_json::{json, Value};

#[derive(Subcommand)]
pub enum FileCommands {
    /// Claim a file for exclusive editing (or join its waitlist).
    ClaimFile {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        file: String,
    },
    /// Release a claim; the waitlist head is promoted.
    ReleaseFile {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        file: String,
        /// Lead override for a gone-quiet holder.
        #[arg(long)]
        force: bool,
    },
    /// All claims and waitlists.
    ListClaims,
}

impl FileCommands {
    pub fn gate(&self) -> Command {
        match self {
            FileCommands::ClaimFile { .. } => Command::ClaimFile,
            FileCommands::ReleaseFile { .. } => Command::ReleaseFile,
            FileCommands::ListClaims => Command::ListClaims,
        }
    }

    pub fn handle(self, ctx: &mut Ctx) -> MinionResult<Value> {
        match self {
            FileCommands::ClaimFile { agent, file } => {
                let outcome = ctx.store.claim_file(&AgentName::from(agent), &file)?;
                Ok(serde_json::to_value(outcome).unwrap_or_default())
            }
            FileCommands::ReleaseFile { agent, file, force } => {
                let outcome = ctx.store.release_file(&AgentName::from(agent), &file, force)?;
                Ok(serde_json::to_value(outcome).unwrap_or_default())
            }
            FileCommands::ListClaims => {
                let (claims, waitlist) = ctx.store.list_claims()?;
                Ok(json!({ "claims": claims, "waitlist": waitlist }))
            }
        }
    }
}
