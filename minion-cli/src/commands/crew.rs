//! Crew lifecycle - spawning, dismissing, and steering daemon processes.
//!
//! The crew layer stays thin: process spawns and flag writes. Terminal
//! multiplexers and installers live outside the kernel.

use crate::commands::agents::AgentClassArg;
use crate::Ctx;
use clap::Subcommand;
use minion_core::{AgentName, Command, MinionError, MinionResult, Transport};
use minion_daemon::{AgentDaemon, DaemonConfig};
use minion_provider::provider_for;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;

#[derive(Subcommand)]
pub enum CrewCommands {
    /// Spawn daemon workers from a crew definition.
    SpawnParty {
        /// Crew name (resolved under <DOCS_DIR>/crews/<name>.toml) or a
        /// path to a crew file.
        #[arg(long)]
        crew: String,
        /// Working directory handed to each daemon.
        #[arg(long)]
        project_dir: Option<PathBuf>,
    },
    /// Dismiss the party: daemons exit after their current turn.
    StandDown {
        #[arg(long)]
        agent: String,
    },
    /// Signal a single daemon to exit gracefully.
    RetireAgent {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        target: String,
    },
    /// Register and spawn one extra daemon.
    Recruit {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        class: AgentClassArg,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value = "claude")]
        provider: String,
        #[arg(long)]
        project_dir: Option<PathBuf>,
    },
    /// Direct zone handoff between agents.
    HandOffZone {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        zone: String,
    },
    /// Kill an agent's current provider turn.
    Interrupt {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        target: String,
    },
    /// Unblock an interrupted agent by delivering a message.
    Resume {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        target: String,
        #[arg(long)]
        message: String,
    },
    /// List available crew definitions.
    ListCrews,
    /// Run one agent daemon in the foreground (spawn-party's child).
    #[command(hide = true)]
    Daemon {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        class: AgentClassArg,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value = "claude")]
        provider: String,
        #[arg(long)]
        project_dir: Option<PathBuf>,
    },
}

/// One crew member in a crew TOML document.
#[derive(Debug, Clone, Deserialize)]
struct CrewAgent {
    name: String,
    class: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    provider: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CrewConfig {
    agents: Vec<CrewAgent>,
}

impl CrewCommands {
    pub fn gate(&self) -> Command {
        match self {
            CrewCommands::SpawnParty { .. } => Command::SpawnParty,
            CrewCommands::StandDown { .. } => Command::StandDown,
            CrewCommands::RetireAgent { .. } => Command::RetireAgent,
            CrewCommands::Recruit { .. } => Command::Recruit,
            CrewCommands::HandOffZone { .. } => Command::HandOffZone,
            CrewCommands::Interrupt { .. } => Command::Interrupt,
            CrewCommands::Resume { .. } => Command::Resume,
            CrewCommands::ListCrews => Command::ListCrews,
            // The daemon entrypoint is spawned infrastructure, not a gated
            // user command.
            CrewCommands::Daemon { .. } => Command::Poll,
        }
    }

    pub fn handle(self, ctx: &mut Ctx) -> MinionResult<Value> {
        match self {
            CrewCommands::SpawnParty { crew, project_dir } => {
                let config = load_crew(ctx, &crew)?;
                let project_dir = project_dir
                    .or_else(|| std::env::current_dir().ok())
                    .unwrap_or_else(|| PathBuf::from("."));
                let mut spawned = Vec::new();
                for member in &config.agents {
                    let pid = spawn_daemon_process(ctx, member, &project_dir)?;
                    spawned.push(json!({ "agent": member.name, "class": member.class, "pid": pid }));
                }
                Ok(json!({ "status": "spawned", "crew": crew, "agents": spawned }))
            }
            CrewCommands::StandDown { agent } => {
                ctx.store.stand_down(&AgentName::from(agent))?;
                Ok(json!({ "status": "stand_down", "note": "daemons exit after their current turn" }))
            }
            CrewCommands::RetireAgent { agent, target } => {
                ctx.store
                    .retire_agent(&AgentName::from(agent), &AgentName::from(target.as_str()))?;
                Ok(json!({ "status": "retiring", "target": target }))
            }
            CrewCommands::Recruit {
                agent: _,
                name,
                class,
                model,
                provider,
                project_dir,
            } => {
                let member = CrewAgent {
                    name: name.clone(),
                    class: class.0.as_db_str().to_string(),
                    model,
                    provider: Some(provider),
                };
                let project_dir = project_dir
                    .or_else(|| std::env::current_dir().ok())
                    .unwrap_or_else(|| PathBuf::from("."));
                let pid = spawn_daemon_process(ctx, &member, &project_dir)?;
                Ok(json!({ "status": "recruited", "agent": name, "pid": pid }))
            }
            CrewCommands::HandOffZone { agent, from, to, zone } => {
                let from = AgentName::from(from);
                let to = AgentName::from(to);
                ctx.store.set_zone(&from, None, None)?;
                ctx.store.set_zone(&to, Some(&zone), None)?;
                ctx.store.system_alert(
                    &to,
                    &format!("zone handoff: {} hands you '{}' (arranged by {})", from, zone, agent),
                )?;
                Ok(json!({ "status": "handed_off", "zone": zone, "from": from, "to": to }))
            }
            CrewCommands::Interrupt { agent, target } => {
                ctx.store
                    .interrupt_agent(&AgentName::from(agent), &AgentName::from(target.as_str()))?;
                Ok(json!({ "status": "interrupting", "target": target }))
            }
            CrewCommands::Resume { agent, target, message } => {
                let target = AgentName::from(target);
                // Make sure no stale interrupt swallows the next turn.
                ctx.store.take_interrupt(&target)?;
                ctx.store.system_alert(
                    &target,
                    &format!("resume from {}: {}", agent, message),
                )?;
                Ok(json!({ "status": "resumed", "target": target }))
            }
            CrewCommands::ListCrews => {
                let dir = crews_dir(ctx);
                let mut crews = Vec::new();
                if let Some(dir) = dir {
                    if let Ok(entries) = std::fs::read_dir(&dir) {
                        for entry in entries.flatten() {
                            let path = entry.path();
                            if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                                    crews.push(stem.to_string());
                                }
                            }
                        }
                    }
                }
                crews.sort();
                Ok(json!({ "crews": crews }))
            }
            CrewCommands::Daemon {
                agent,
                class,
                model,
                provider,
                project_dir,
            } => {
                let provider = provider_for(&provider).ok_or_else(|| {
                    MinionError::invalid(format!("unknown provider '{}'", provider))
                })?;
                let paths = ctx.store.paths().clone();
                let store = minion_store::Store::open(
                    paths,
                    ctx.store.flows().clone(),
                    ctx.store.defaults().clone(),
                )?;
                let config = DaemonConfig {
                    agent: AgentName::from(agent),
                    class: class.0,
                    model,
                    provider: provider.name().to_string(),
                    project_dir: project_dir
                        .or_else(|| std::env::current_dir().ok())
                        .unwrap_or_else(|| PathBuf::from(".")),
                    docs_dir: ctx.docs_dir.clone(),
                    allowed_tools: None,
                    permission_mode: None,
                };
                let mut daemon = AgentDaemon::new(config, store, provider);
                let runtime = tokio::runtime::Runtime::new()
                    .map_err(|e| MinionError::invalid(e.to_string()))?;
                let code = runtime.block_on(daemon.run())?;
                info!(code, "daemon finished");
                // The daemon owns the process outcome.
                std::process::exit(code);
            }
        }
    }
}

fn crews_dir(ctx: &Ctx) -> Option<PathBuf> {
    ctx.docs_dir.as_ref().map(|d| d.join("crews"))
}

fn load_crew(ctx: &Ctx, crew: &str) -> MinionResult<CrewConfig> {
    let path = if crew.ends_with(".toml") {
        PathBuf::from(crew)
    } else {
        crews_dir(ctx)
            .ok_or_else(|| MinionError::invalid("no DOCS_DIR set; pass a crew file path"))?
            .join(format!("{}.toml", crew))
    };
    let raw = std::fs::read_to_string(&path).map_err(|e| {
        MinionError::invalid(format!("cannot read crew file {}: {}", path.display(), e))
    })?;
    toml::from_str(&raw).map_err(|e| MinionError::invalid(format!("invalid crew file: {}", e)))
}

/// Spawn a detached `minion daemon` child for one crew member. Registration
/// happens inside the daemon's boot sequence.
fn spawn_daemon_process(ctx: &mut Ctx, member: &CrewAgent, project_dir: &PathBuf) -> MinionResult<u32> {
    // Pre-register so the roster shows the member immediately.
    let class = minion_core::AgentClass::from_db_str(&member.class)
        .map_err(|e| MinionError::invalid(e.to_string()))?;
    ctx.store.register(
        &AgentName::from(member.name.as_str()),
        class,
        member.model.as_deref(),
        Transport::Daemon,
        None,
    )?;

    let exe = std::env::current_exe()
        .map_err(|e| MinionError::invalid(format!("cannot resolve own binary: {}", e)))?;
    let log_path = ctx
        .store
        .paths()
        .state_dir()
        .join(format!("{}.log", member.name));
    std::fs::create_dir_all(ctx.store.paths().state_dir())
        .map_err(|e| MinionError::invalid(e.to_string()))?;
    let log = std::fs::File::create(&log_path).map_err(|e| MinionError::invalid(e.to_string()))?;

    let mut cmd = std::process::Command::new(exe);
    cmd.arg("daemon")
        .arg("--agent")
        .arg(&member.name)
        .arg("--class")
        .arg(&member.class)
        .arg("--provider")
        .arg(member.provider.as_deref().unwrap_or("claude"))
        .arg("--project-dir")
        .arg(project_dir)
        .env(minion_core::ENV_DB_PATH, ctx.store.paths().db_path())
        .stdout(log.try_clone().map_err(|e| MinionError::invalid(e.to_string()))?)
        .stderr(log)
        .stdin(std::process::Stdio::null());
    if let Some(model) = &member.model {
        cmd.arg("--model").arg(model);
    }
    if let Some(docs) = &ctx.docs_dir {
        cmd.env(minion_core::ENV_DOCS_DIR, docs);
    }

    let child = cmd.spawn().map_err(|e| {
        MinionError::invalid(format!("failed to spawn daemon for {}: {}", member.name, e))
    })?;
    info!(agent = %member.name, pid = child.id(), "daemon spawned");
    Ok(child.id())
}
