//! The `minion` binary - coordination CLI for agent fleets.
//!
//! Every command emits a structured JSON record. Exit codes: 0 success,
//! 1 user error, 2 precondition failure, 3 graceful shutdown, 4 denied.

use clap::{Parser, Subcommand};
use minion_core::{authorize, AgentClass, Caller, MinionError, MinionResult, ENV_CALLER_CLASS};
use minion_flow::FlowSet;
use minion_store::{Store, WorkPaths};
use std::path::PathBuf;

mod commands;
mod output;

use commands::{
    agents::AgentCommands, comms::CommsCommands, crew::CrewCommands, files::FileCommands,
    flows::FlowCommands, observe::ObserveCommands, tasks::TaskCommands, warroom::WarRoomCommands,
};

#[derive(Parser)]
#[command(name = "minion", version, about = "Coordination substrate for agent fleets")]
struct Cli {
    /// Datastore location (defaults to ~/.minion_work/<project>/minion.db).
    #[arg(long, global = true, env = "DB_PATH", value_name = "FILE")]
    db_path: Option<PathBuf>,

    /// Project name used to derive default paths.
    #[arg(long, global = true, env = "PROJECT")]
    project: Option<String>,

    /// Caller class for authorization ("coder", or "daemon:coder" for the
    /// daemon identity).
    #[arg(long, global = true, env = "CALLER_CLASS", value_name = "CLASS")]
    caller_class: Option<String>,

    /// Directory holding contract documents and task flows.
    #[arg(long, global = true, env = "DOCS_DIR", value_name = "DIR")]
    docs_dir: Option<PathBuf>,

    /// Human-oriented output instead of the JSON contract.
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Agents(AgentCommands),
    #[command(flatten)]
    Comms(CommsCommands),
    #[command(flatten)]
    Tasks(TaskCommands),
    #[command(flatten)]
    Flows(FlowCommands),
    #[command(flatten)]
    Files(FileCommands),
    #[command(flatten)]
    WarRoom(WarRoomCommands),
    #[command(flatten)]
    Crew(CrewCommands),
    #[command(flatten)]
    Observe(ObserveCommands),
}

/// Everything a command handler needs.
pub struct Ctx {
    pub store: Store,
    pub caller: Caller,
    pub docs_dir: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let pretty = cli.pretty;
    match run(cli) {
        Ok(value) => {
            output::print(&value, pretty);
        }
        Err(err) => {
            let record = serde_json::json!({ "error": err.to_string() });
            eprintln!("{}", serde_json::to_string_pretty(&record).unwrap_or_default());
            std::process::exit(err.exit_code());
        }
    }
}

fn run(cli: Cli) -> MinionResult<serde_json::Value> {
    let caller = parse_caller(cli.caller_class.as_deref())?;
    let store = open_store(&cli)?;
    let mut ctx = Ctx {
        store,
        caller,
        docs_dir: cli.docs_dir.clone(),
    };

    let command = match &cli.command {
        Commands::Agents(c) => c.gate(),
        Commands::Comms(c) => c.gate(),
        Commands::Tasks(c) => c.gate(),
        Commands::Flows(c) => c.gate(),
        Commands::Files(c) => c.gate(),
        Commands::WarRoom(c) => c.gate(),
        Commands::Crew(c) => c.gate(),
        Commands::Observe(c) => c.gate(),
    };
    authorize(ctx.caller, command)?;

    match cli.command {
        Commands::Agents(c) => c.handle(&mut ctx),
        Commands::Comms(c) => c.handle(&mut ctx),
        Commands::Tasks(c) => c.handle(&mut ctx),
        Commands::Flows(c) => c.handle(&mut ctx),
        Commands::Files(c) => c.handle(&mut ctx),
        Commands::WarRoom(c) => c.handle(&mut ctx),
        Commands::Crew(c) => c.handle(&mut ctx),
        Commands::Observe(c) => c.handle(&mut ctx),
    }
}

/// `CALLER_CLASS` is a class name, or `daemon:<class>` for the daemon
/// identity (which holds `hp_write` and nothing more). Default is lead so a
/// human at the keyboard can drive everything.
fn parse_caller(raw: Option<&str>) -> MinionResult<Caller> {
    let raw = match raw {
        None | Some("") => return Ok(Caller::class(AgentClass::Lead)),
        Some(raw) => raw,
    };
    if let Some(class) = raw.strip_prefix("daemon:") {
        let class = AgentClass::from_db_str(class)
            .map_err(|e| MinionError::invalid(format!("{} ({})", e, ENV_CALLER_CLASS)))?;
        return Ok(Caller::daemon(class));
    }
    let class = AgentClass::from_db_str(raw)
        .map_err(|e| MinionError::invalid(format!("{} ({})", e, ENV_CALLER_CLASS)))?;
    Ok(Caller::class(class))
}

fn open_store(cli: &Cli) -> MinionResult<Store> {
    let paths = match &cli.db_path {
        Some(db) => WorkPaths::from_db_path(db.clone()),
        None => {
            if let Some(project) = &cli.project {
                std::env::set_var(minion_core::ENV_PROJECT, project);
            }
            WorkPaths::resolve()
        }
    };
    let flows_dir = minion_store::flows_dir_from_env().or_else(|| {
        cli.docs_dir.as_ref().map(|d| d.join("task-flows"))
    });
    let flows = FlowSet::load(flows_dir.as_deref())
        .map_err(|e| MinionError::invalid(e.to_string()))?;
    let defaults = minion_daemon::Contracts::load(cli.docs_dir.as_deref()).defaults;
    Store::open(paths, flows, defaults)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_parsing_covers_classes_and_daemon_identity() {
        assert_eq!(parse_caller(None).unwrap(), Caller::class(AgentClass::Lead));
        assert_eq!(
            parse_caller(Some("oracle")).unwrap(),
            Caller::class(AgentClass::Oracle)
        );
        assert_eq!(
            parse_caller(Some("daemon:coder")).unwrap(),
            Caller::daemon(AgentClass::Coder)
        );
        assert!(parse_caller(Some("wizard")).is_err());
    }

    #[test]
    fn cli_parses_the_full_surface() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
