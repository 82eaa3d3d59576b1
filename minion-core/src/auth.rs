//! Class-based authorization.
//!
//! Authorization is a pure function: `(caller_class, command) -> allow|deny`.
//! Classes bundle capabilities; each command requires either a capability or
//! membership in a class allowlist. The caller's class arrives via the
//! `CALLER_CLASS` environment variable, resolved at the CLI edge.

use crate::{AgentClass, AuthError, Capability};
use std::time::Duration;

/// Capability bundle for a class. Pure and static - no dynamic dispatch.
pub fn capabilities(class: AgentClass) -> &'static [Capability] {
    use Capability::*;
    match class {
        AgentClass::Lead => &[Manage, Review, Plan],
        AgentClass::Coder => &[Code, Review],
        AgentClass::Builder => &[Build, Test],
        AgentClass::Oracle => &[Review, Test],
        AgentClass::Recon => &[Investigate],
        AgentClass::Planner => &[Plan, Investigate],
        AgentClass::Auditor => &[Review, Investigate],
    }
}

/// Does this class hold the capability?
pub fn has_capability(class: AgentClass, cap: Capability) -> bool {
    capabilities(class).contains(&cap)
}

/// Classes holding a given capability, in declaration order.
pub fn classes_with(cap: Capability) -> Vec<AgentClass> {
    AgentClass::ALL
        .iter()
        .copied()
        .filter(|c| has_capability(*c, cap))
        .collect()
}

/// Context-staleness window per class. A send is blocked when the sender's
/// `context_updated_at` is older than this.
pub fn staleness_window(class: AgentClass) -> Duration {
    match class {
        AgentClass::Lead => Duration::from_secs(15 * 60),
        AgentClass::Oracle => Duration::from_secs(30 * 60),
        _ => Duration::from_secs(5 * 60),
    }
}

// ============================================================================
// COMMAND SURFACE
// ============================================================================

/// Every command in the external surface, used for gating and the tool
/// catalog. Names match the CLI subcommand spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // Agents
    Register,
    Deregister,
    Rename,
    Who,
    SetContext,
    SetStatus,
    ColdStart,
    FenixDown,
    UpdateHp,
    CheckActivity,
    CheckFreshness,
    // Comms
    Send,
    CheckInbox,
    PurgeInbox,
    GetHistory,
    ListTriggers,
    ClearMoonCrash,
    // Tasks
    CreateTask,
    AssignTask,
    PullTask,
    UpdateTask,
    SubmitResult,
    CompletePhase,
    CloseTask,
    ReopenTask,
    GetTask,
    ListTasks,
    TaskLineage,
    // Flows
    ListFlows,
    ShowFlow,
    NextStatus,
    Transition,
    // Files
    ClaimFile,
    ReleaseFile,
    ListClaims,
    // War-room
    SetPlan,
    GetPlan,
    UpdatePlanStatus,
    Log,
    GetLog,
    // Crew lifecycle
    SpawnParty,
    StandDown,
    RetireAgent,
    Recruit,
    HandOffZone,
    Interrupt,
    Resume,
    ListCrews,
    // Observability
    PartyStatus,
    Sitrep,
    Poll,
    ListTools,
}

/// What a command requires: a capability, or a class allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandGate {
    /// Any registered class may call.
    Open,
    /// Caller's class must hold this capability.
    Capability(Capability),
    /// Caller's class must appear in this allowlist.
    Classes(&'static [AgentClass]),
}

impl Command {
    /// The gate protecting this command.
    pub fn gate(&self) -> CommandGate {
        use AgentClass::*;
        use Capability::*;
        match self {
            // Open surface: presence, reading, and self-maintenance.
            Command::Register
            | Command::Deregister
            | Command::Who
            | Command::SetContext
            | Command::SetStatus
            | Command::ColdStart
            | Command::FenixDown
            | Command::CheckActivity
            | Command::Send
            | Command::CheckInbox
            | Command::PurgeInbox
            | Command::GetHistory
            | Command::ListTriggers
            | Command::PullTask
            | Command::UpdateTask
            | Command::SubmitResult
            | Command::CompletePhase
            | Command::GetTask
            | Command::ListTasks
            | Command::TaskLineage
            | Command::ListFlows
            | Command::ShowFlow
            | Command::NextStatus
            | Command::ListClaims
            | Command::GetPlan
            | Command::Log
            | Command::GetLog
            | Command::Sitrep
            | Command::Poll
            | Command::ListTools => CommandGate::Open,

            // HP writes carry their own capability so the daemon never has to
            // impersonate lead.
            Command::UpdateHp => CommandGate::Capability(HpWrite),

            // Management surface.
            Command::Rename
            | Command::CheckFreshness
            | Command::ClearMoonCrash
            | Command::CreateTask
            | Command::AssignTask
            | Command::CloseTask
            | Command::ReopenTask
            | Command::Transition
            | Command::SetPlan
            | Command::UpdatePlanStatus
            | Command::StandDown
            | Command::RetireAgent
            | Command::Recruit
            | Command::Interrupt
            | Command::Resume
            | Command::PartyStatus => CommandGate::Capability(Manage),

            // Editing classes claim files for exclusive writes.
            Command::ClaimFile | Command::ReleaseFile => CommandGate::Classes(&[Lead, Coder, Builder]),

            Command::SpawnParty | Command::ListCrews | Command::HandOffZone => CommandGate::Open,
        }
    }

    /// Short description for the tool catalog.
    pub fn description(&self) -> &'static str {
        match self {
            Command::Register => "Register an agent into the session",
            Command::Deregister => "Remove an agent from the registry",
            Command::Rename => "Rename an agent (zone reassignment)",
            Command::Who => "List all registered agents with liveness",
            Command::SetContext => "Update context summary and HP metrics",
            Command::SetStatus => "Set your current status text",
            Command::ColdStart => "Recovery briefing for a restarted agent",
            Command::FenixDown => "Dump session knowledge before context death",
            Command::UpdateHp => "Daemon-only: write observed HP telemetry",
            Command::CheckActivity => "Check an agent's activity level",
            Command::CheckFreshness => "Check file freshness vs agent's last context",
            Command::Send => "Send a message to an agent, a class, or all",
            Command::CheckInbox => "Check and clear unread messages",
            Command::PurgeInbox => "Delete old read messages",
            Command::GetHistory => "Return last N messages across all agents",
            Command::ListTriggers => "Return the trigger word codebook",
            Command::ClearMoonCrash => "Clear the emergency flag, resume assignments",
            Command::CreateTask => "Create a new task with spec file",
            Command::AssignTask => "Assign a task to an agent",
            Command::PullTask => "Race-safe claim of an actionable task",
            Command::UpdateTask => "Update task progress or files within the current stage",
            Command::SubmitResult => "Submit a result file for a task",
            Command::CompletePhase => "Flow-routed phase completion",
            Command::CloseTask => "Close a task at the terminal stage",
            Command::ReopenTask => "Reopen a terminal task to an earlier stage",
            Command::GetTask => "Get full detail for a single task",
            Command::ListTasks => "List tasks with filters",
            Command::TaskLineage => "Show task history against its flow",
            Command::ListFlows => "List available task flow types",
            Command::ShowFlow => "Show a resolved flow definition",
            Command::NextStatus => "Preview the next status for a task",
            Command::Transition => "Manually transition a task along a flow edge",
            Command::ClaimFile => "Claim a file for exclusive editing",
            Command::ReleaseFile => "Release a file claim",
            Command::ListClaims => "List active file claims and waitlists",
            Command::SetPlan => "Set the active battle plan",
            Command::GetPlan => "Get battle plans by status",
            Command::UpdatePlanStatus => "Update a battle plan's status",
            Command::Log => "Append an entry to the raid log",
            Command::GetLog => "Read the raid log",
            Command::SpawnParty => "Spawn daemon workers from a crew definition",
            Command::StandDown => "Dismiss the party",
            Command::RetireAgent => "Signal a single daemon to exit gracefully",
            Command::Recruit => "Register and spawn one extra daemon",
            Command::HandOffZone => "Direct zone handoff between agents",
            Command::Interrupt => "Kill an agent's current provider turn",
            Command::Resume => "Unblock an interrupted agent with a message",
            Command::ListCrews => "List available crew definitions",
            Command::PartyStatus => "Full party health dashboard",
            Command::Sitrep => "Fused picture: agents + tasks + claims + flags",
            Command::Poll => "Block until messages or tasks arrive",
            Command::ListTools => "List commands available to your class",
        }
    }

    /// Every command, for catalog rendering.
    pub const ALL: &'static [Command] = &[
        Command::Register,
        Command::Deregister,
        Command::Rename,
        Command::Who,
        Command::SetContext,
        Command::SetStatus,
        Command::ColdStart,
        Command::FenixDown,
        Command::UpdateHp,
        Command::CheckActivity,
        Command::CheckFreshness,
        Command::Send,
        Command::CheckInbox,
        Command::PurgeInbox,
        Command::GetHistory,
        Command::ListTriggers,
        Command::ClearMoonCrash,
        Command::CreateTask,
        Command::AssignTask,
        Command::PullTask,
        Command::UpdateTask,
        Command::SubmitResult,
        Command::CompletePhase,
        Command::CloseTask,
        Command::ReopenTask,
        Command::GetTask,
        Command::ListTasks,
        Command::TaskLineage,
        Command::ListFlows,
        Command::ShowFlow,
        Command::NextStatus,
        Command::Transition,
        Command::ClaimFile,
        Command::ReleaseFile,
        Command::ListClaims,
        Command::SetPlan,
        Command::GetPlan,
        Command::UpdatePlanStatus,
        Command::Log,
        Command::GetLog,
        Command::SpawnParty,
        Command::StandDown,
        Command::RetireAgent,
        Command::Recruit,
        Command::HandOffZone,
        Command::Interrupt,
        Command::Resume,
        Command::ListCrews,
        Command::PartyStatus,
        Command::Sitrep,
        Command::Poll,
        Command::ListTools,
    ];

    /// CLI spelling, kebab-case.
    pub fn cli_name(&self) -> &'static str {
        match self {
            Command::Register => "register",
            Command::Deregister => "deregister",
            Command::Rename => "rename",
            Command::Who => "who",
            Command::SetContext => "set-context",
            Command::SetStatus => "set-status",
            Command::ColdStart => "cold-start",
            Command::FenixDown => "fenix-down",
            Command::UpdateHp => "update-hp",
            Command::CheckActivity => "check-activity",
            Command::CheckFreshness => "check-freshness",
            Command::Send => "send",
            Command::CheckInbox => "check-inbox",
            Command::PurgeInbox => "purge-inbox",
            Command::GetHistory => "get-history",
            Command::ListTriggers => "list-triggers",
            Command::ClearMoonCrash => "clear-moon-crash",
            Command::CreateTask => "create-task",
            Command::AssignTask => "assign-task",
            Command::PullTask => "pull-task",
            Command::UpdateTask => "update-task",
            Command::SubmitResult => "submit-result",
            Command::CompletePhase => "complete-phase",
            Command::CloseTask => "close-task",
            Command::ReopenTask => "reopen-task",
            Command::GetTask => "get-task",
            Command::ListTasks => "list-tasks",
            Command::TaskLineage => "task-lineage",
            Command::ListFlows => "list-flows",
            Command::ShowFlow => "show-flow",
            Command::NextStatus => "next-status",
            Command::Transition => "transition",
            Command::ClaimFile => "claim-file",
            Command::ReleaseFile => "release-file",
            Command::ListClaims => "list-claims",
            Command::SetPlan => "set-plan",
            Command::GetPlan => "get-plan",
            Command::UpdatePlanStatus => "update-plan-status",
            Command::Log => "log",
            Command::GetLog => "get-log",
            Command::SpawnParty => "spawn-party",
            Command::StandDown => "stand-down",
            Command::RetireAgent => "retire-agent",
            Command::Recruit => "recruit",
            Command::HandOffZone => "hand-off-zone",
            Command::Interrupt => "interrupt",
            Command::Resume => "resume",
            Command::ListCrews => "list-crews",
            Command::PartyStatus => "party-status",
            Command::Sitrep => "sitrep",
            Command::Poll => "poll",
            Command::ListTools => "list-tools",
        }
    }
}

/// The caller identity used for authorization checks.
///
/// A caller is either an agent class (from `CALLER_CLASS`) or the daemon
/// identity, which holds `hp_write` on top of its agent's class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub class: AgentClass,
    /// Set only for the daemon process driving an agent.
    pub daemon: bool,
}

impl Caller {
    pub fn class(class: AgentClass) -> Self {
        Self { class, daemon: false }
    }

    pub fn daemon(class: AgentClass) -> Self {
        Self { class, daemon: true }
    }

    fn holds(&self, cap: Capability) -> bool {
        if cap == Capability::HpWrite {
            // Never satisfied by class promotion; only the daemon identity.
            return self.daemon;
        }
        has_capability(self.class, cap)
    }
}

/// Pure authorization check. `Ok(())` means allow.
pub fn authorize(caller: Caller, command: Command) -> Result<(), AuthError> {
    match command.gate() {
        CommandGate::Open => Ok(()),
        CommandGate::Capability(cap) => {
            if caller.holds(cap) {
                Ok(())
            } else {
                Err(AuthError::CapabilityMissing {
                    class: caller.class,
                    capability: cap,
                    command: command.cli_name(),
                })
            }
        }
        CommandGate::Classes(allowed) => {
            if allowed.contains(&caller.class) {
                Ok(())
            } else {
                Err(AuthError::ClassDenied {
                    class: caller.class,
                    command: command.cli_name(),
                    allowed: allowed.iter().map(|c| c.as_db_str()).collect::<Vec<_>>().join(", "),
                })
            }
        }
    }
}

/// Commands available to a class, for `list-tools`.
pub fn tools_for_class(class: AgentClass) -> Vec<Command> {
    Command::ALL
        .iter()
        .copied()
        .filter(|cmd| authorize(Caller::class(class), *cmd).is_ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lead_manages_coder_does_not() {
        assert!(authorize(Caller::class(AgentClass::Lead), Command::CreateTask).is_ok());
        assert!(matches!(
            authorize(Caller::class(AgentClass::Coder), Command::CreateTask),
            Err(AuthError::CapabilityMissing { .. })
        ));
    }

    #[test]
    fn hp_write_never_satisfied_by_class() {
        for class in AgentClass::ALL {
            assert!(authorize(Caller::class(*class), Command::UpdateHp).is_err());
        }
        assert!(authorize(Caller::daemon(AgentClass::Coder), Command::UpdateHp).is_ok());
    }

    #[test]
    fn daemon_identity_does_not_widen_other_commands() {
        assert!(authorize(Caller::daemon(AgentClass::Coder), Command::CreateTask).is_err());
        assert!(authorize(Caller::daemon(AgentClass::Recon), Command::ClaimFile).is_err());
    }

    #[test]
    fn claim_allowlist() {
        assert!(authorize(Caller::class(AgentClass::Builder), Command::ClaimFile).is_ok());
        assert!(matches!(
            authorize(Caller::class(AgentClass::Oracle), Command::ClaimFile),
            Err(AuthError::ClassDenied { .. })
        ));
    }

    #[test]
    fn staleness_windows_match_classes() {
        assert_eq!(staleness_window(AgentClass::Lead).as_secs(), 900);
        assert_eq!(staleness_window(AgentClass::Oracle).as_secs(), 1800);
        assert_eq!(staleness_window(AgentClass::Coder).as_secs(), 300);
        assert_eq!(staleness_window(AgentClass::Planner).as_secs(), 300);
    }

    #[test]
    fn every_class_has_capabilities() {
        for class in AgentClass::ALL {
            assert!(!capabilities(*class).is_empty());
            assert!(!capabilities(*class).contains(&Capability::HpWrite));
        }
    }

    #[test]
    fn reviewers_include_oracle_and_auditor() {
        let reviewers = classes_with(Capability::Review);
        assert!(reviewers.contains(&AgentClass::Oracle));
        assert!(reviewers.contains(&AgentClass::Auditor));
        assert!(!reviewers.contains(&AgentClass::Recon));
    }
}
