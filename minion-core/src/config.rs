//! Runtime defaults and environment contract.
//!
//! Numeric defaults can be overridden by the `config-defaults` contract
//! document; everything else is fixed. Env var names are the external
//! contract and never change spelling.

use serde::{Deserialize, Serialize};

/// Env var: override datastore location.
pub const ENV_DB_PATH: &str = "DB_PATH";
/// Env var: project name used to derive default paths.
pub const ENV_PROJECT: &str = "PROJECT";
/// Env var: caller's class for authorization.
pub const ENV_CALLER_CLASS: &str = "CALLER_CLASS";
/// Env var: directory for loaded contract documents.
pub const ENV_DOCS_DIR: &str = "DOCS_DIR";
/// Env var: override the task-flow search path.
pub const ENV_FLOWS_DIR: &str = "FLOWS_DIR";

/// Numeric runtime defaults. Serde defaults match the documented table so a
/// partial `config-defaults` contract overrides only what it names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeDefaults {
    /// Rolling history budget, in tokens (chars ~= tokens * 4).
    pub max_history_tokens: usize,
    /// Per-prompt char cap applied to replay injection.
    pub max_prompt_chars: usize,
    /// Provider stream no-output timeout, seconds.
    pub no_output_timeout_secs: u64,
    /// Circuit-breaker back-off, initial seconds.
    pub retry_backoff_secs: u64,
    /// Circuit-breaker back-off ceiling, seconds.
    pub retry_backoff_max_secs: u64,
    /// Context window assumed when the provider reports none.
    pub default_context_window: u64,
    /// Poll interval, seconds.
    pub poll_interval_secs: u64,
    /// Poll interval floor under back-off, seconds.
    pub poll_interval_min_secs: u64,
    /// Poll interval ceiling under back-off, seconds.
    pub poll_interval_max_secs: u64,
    /// Consecutive failures before the PollFailure alert fires.
    pub failure_alert_threshold: u32,
    /// Read messages older than this are eligible for purge, hours.
    pub purge_after_hours: i64,
}

impl Default for RuntimeDefaults {
    fn default() -> Self {
        Self {
            max_history_tokens: 100_000,
            max_prompt_chars: 120_000,
            no_output_timeout_secs: 600,
            retry_backoff_secs: 30,
            retry_backoff_max_secs: 300,
            default_context_window: 200_000,
            poll_interval_secs: 5,
            poll_interval_min_secs: 1,
            poll_interval_max_secs: 30,
            failure_alert_threshold: 3,
            purge_after_hours: 2,
        }
    }
}

impl RuntimeDefaults {
    /// Exponential poll back-off after `empty_polls` consecutive empty polls,
    /// clamped to the configured band. Tight-looping on empty polls is a bug;
    /// this is the mandatory schedule.
    pub fn poll_backoff_secs(&self, empty_polls: u32) -> u64 {
        let base = self.poll_interval_secs.max(self.poll_interval_min_secs);
        let shifted = base.saturating_mul(1u64 << empty_polls.min(6));
        shifted.clamp(self.poll_interval_min_secs, self.poll_interval_max_secs)
    }

    /// Circuit-breaker back-off after `failures` consecutive failures.
    pub fn failure_backoff_secs(&self, failures: u32) -> u64 {
        let shifted = self
            .retry_backoff_secs
            .saturating_mul(1u64 << failures.saturating_sub(1).min(6));
        shifted.min(self.retry_backoff_max_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_backoff_is_bounded() {
        let d = RuntimeDefaults::default();
        assert_eq!(d.poll_backoff_secs(0), 5);
        assert_eq!(d.poll_backoff_secs(1), 10);
        assert_eq!(d.poll_backoff_secs(2), 20);
        assert_eq!(d.poll_backoff_secs(3), 30);
        assert_eq!(d.poll_backoff_secs(60), 30);
    }

    #[test]
    fn failure_backoff_caps_at_five_minutes() {
        let d = RuntimeDefaults::default();
        assert_eq!(d.failure_backoff_secs(1), 30);
        assert_eq!(d.failure_backoff_secs(2), 60);
        assert_eq!(d.failure_backoff_secs(4), 240);
        assert_eq!(d.failure_backoff_secs(5), 300);
        assert_eq!(d.failure_backoff_secs(12), 300);
    }

    #[test]
    fn partial_contract_overrides_only_named_fields() {
        let d: RuntimeDefaults = serde_json::from_str(r#"{"poll_interval_secs": 2}"#).unwrap();
        assert_eq!(d.poll_interval_secs, 2);
        assert_eq!(d.max_history_tokens, 100_000);
    }
}
