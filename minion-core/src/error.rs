//! Error types for minion operations
//!
//! One enum per failure family, mirroring the propagation policy: precondition
//! failures surface to the caller verbatim with a remediation hint, datastore
//! conflicts are retried inside the kernel, provider failures feed the circuit
//! breaker, corruption is fatal.

use crate::{AgentClass, Capability, TaskId};
use thiserror::Error;

/// Recoverable rule violations. Each variant carries the observed state and
/// the remediating action - callers see these verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("context stale ({age_secs}s old, threshold {threshold_secs}s for {class}) - run set-context before sending")]
    StaleContext {
        class: AgentClass,
        age_secs: i64,
        threshold_secs: i64,
    },

    #[error("{unread} unread message(s) - run check-inbox first")]
    UnreadInbox { unread: i64 },

    #[error("no active battle plan - lead must run set-plan first")]
    NoActivePlan,

    #[error("moon_crash active (set by {set_by} at {set_at}) - lead must run clear-moon-crash")]
    MoonCrash { set_by: String, set_at: String },

    #[error("task #{task_id} was claimed by another agent")]
    AlreadyPulled { task_id: TaskId },

    #[error("task #{task_id} has {open} unresolved blocker(s): {blockers}")]
    BlockedBy {
        task_id: TaskId,
        open: usize,
        blockers: String,
    },

    #[error("file '{file}' is claimed by '{holder}' - waitlisted at position {position}")]
    ClaimHeld {
        file: String,
        holder: String,
        position: usize,
    },

    #[error("task #{task_id} has no result file - run submit-result first")]
    MissingResult { task_id: TaskId },

    #[error("no transition from '{from}' to '{to}' in flow '{flow}'")]
    InvalidTransition {
        flow: String,
        from: String,
        to: String,
    },

    #[error("class '{class}' is not a worker of stage '{stage}' (allowed: {allowed})")]
    WorkerClassMismatch {
        class: AgentClass,
        stage: String,
        allowed: String,
    },

    #[error("unknown recipient '{recipient}' - not a registered agent, class, or 'all'")]
    UnknownRecipient { recipient: String },

    #[error("agent '{name}' is not registered - run register first")]
    UnknownAgent { name: String },

    #[error("task #{task_id} not found")]
    UnknownTask { task_id: TaskId },

    #[error("task #{task_id} is in terminal status '{status}'")]
    TerminalTask { task_id: TaskId, status: String },

    #[error("required file does not exist: {path}")]
    MissingFile { path: String },
}

/// Authorization failures. Exit code 4.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("class '{class}' cannot run '{command}' (requires: {allowed})")]
    ClassDenied {
        class: AgentClass,
        command: &'static str,
        allowed: String,
    },

    #[error("class '{class}' lacks capability '{capability}' required by '{command}'")]
    CapabilityMissing {
        class: AgentClass,
        capability: Capability,
        command: &'static str,
    },
}

/// Datastore failures. Conflicts are retried inside the kernel with jitter
/// and never surface when resolved; corruption is fatal.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("datastore conflict after {attempts} attempts: {reason}")]
    Conflict { attempts: u32, reason: String },

    #[error("datastore corruption: {reason}")]
    Corruption { reason: String },

    #[error("datastore error: {reason}")]
    Sql { reason: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Wrap a driver error. The store layer decides whether a driver error
    /// is a retryable conflict before reaching for this.
    pub fn sql(err: impl std::fmt::Display) -> Self {
        StoreError::Sql {
            reason: err.to_string(),
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Provider subprocess failures. The daemon applies back-off; these never
/// fail a task.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to spawn provider '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("provider produced no output for {timeout_secs}s")]
    StreamTimeout { timeout_secs: u64 },

    #[error("provider rate limited{}", retry_after_secs.map(|s| format!(", retry after {}s", s)).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("provider stream io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Umbrella error for the whole kernel.
#[derive(Debug, Error)]
pub enum MinionError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{0}")]
    Invalid(String),
}

impl MinionError {
    /// Process exit code contract: 0 success, 1 user error, 2 precondition
    /// failure, 3 graceful shutdown, 4 authorization denial.
    pub fn exit_code(&self) -> i32 {
        match self {
            MinionError::Precondition(_) => 2,
            MinionError::Auth(_) => 4,
            MinionError::Store(StoreError::Corruption { .. }) => 1,
            MinionError::Store(_) => 1,
            MinionError::Provider(_) => 1,
            MinionError::Invalid(_) => 1,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        MinionError::Invalid(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(
            MinionError::from(PreconditionError::NoActivePlan).exit_code(),
            2
        );
        assert_eq!(
            MinionError::from(AuthError::CapabilityMissing {
                class: AgentClass::Coder,
                capability: Capability::Manage,
                command: "create-task",
            })
            .exit_code(),
            4
        );
        assert_eq!(MinionError::invalid("bad flag").exit_code(), 1);
    }

    #[test]
    fn precondition_messages_carry_remediation() {
        let e = PreconditionError::UnreadInbox { unread: 3 };
        assert!(e.to_string().contains("check-inbox"));
        let e = PreconditionError::NoActivePlan;
        assert!(e.to_string().contains("set-plan"));
    }
}
