//! The agent daemon - boot sequence, poll loop, turn execution.
//!
//! Single-threaded cooperative: the loop suspends at the poll sleep, the
//! datastore round-trip, and the provider stream read. Concurrency between
//! daemons happens only through the datastore.

use crate::{
    build_boot_prompt, build_turn_prompt, write_poll_failure, Contracts, DaemonState,
    RecoveryBriefing, RollingBuffer, StateFile, StreamTail, TurnStats,
};
use minion_core::{
    authorize, AgentClass, AgentName, Caller, Command, MinionResult, ProviderError,
    Transport, ENV_CALLER_CLASS, ENV_DB_PATH, ENV_DOCS_DIR,
};
use minion_provider::{AgentLaunch, Provider, StreamEvent};
use minion_store::{ContextUpdate, HpSample, PollResult, PollSignal, Store};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Interval between interrupt-flag checks while a stream is quiet.
const INTERRUPT_CHECK_SECS: u64 = 2;

/// Exit code for graceful shutdown (stand_down / retire).
pub const EXIT_GRACEFUL: i32 = 3;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub agent: AgentName,
    pub class: AgentClass,
    pub model: Option<String>,
    pub provider: String,
    pub project_dir: PathBuf,
    pub docs_dir: Option<PathBuf>,
    pub allowed_tools: Option<String>,
    pub permission_mode: Option<String>,
}

pub struct AgentDaemon {
    config: DaemonConfig,
    store: Store,
    provider: Arc<dyn Provider>,
    contracts: Contracts,
    buffer: RollingBuffer,
    tail: StreamTail,
    state: StateFile,

    session_id: Option<String>,
    resume_ready: bool,
    inject_history_next_turn: bool,
    consecutive_failures: u32,
    last_error: Option<String>,
    last_failed_payload: Option<Vec<i64>>,
    empty_polls: u32,
    generation: u32,

    // Accounting totals; never used for the HP percentage.
    session_input_tokens: u64,
    session_output_tokens: u64,
    context_window: u64,
}

impl AgentDaemon {
    pub fn new(config: DaemonConfig, store: Store, provider: Arc<dyn Provider>) -> AgentDaemon {
        let contracts = Contracts::load(config.docs_dir.as_deref());
        let defaults = contracts.defaults.clone();
        let paths = store.paths().clone();
        let state = StateFile::new(paths.state_file(&config.agent));
        let resume_ready = state.resume_ready();
        let context_window = provider.caps().default_context_window.max(1);

        AgentDaemon {
            buffer: RollingBuffer::new(defaults.max_history_tokens),
            tail: StreamTail::new(paths.stream_tail_file(&config.agent), 64 * 1024),
            state,
            session_id: None,
            resume_ready,
            inject_history_next_turn: false,
            consecutive_failures: 0,
            last_error: None,
            last_failed_payload: None,
            empty_polls: 0,
            generation: 0,
            session_input_tokens: 0,
            session_output_tokens: 0,
            context_window,
            contracts,
            config,
            store,
            provider,
        }
    }

    /// Run until stand-down, retire, or a fatal error. Returns the process
    /// exit code.
    pub async fn run(&mut self) -> MinionResult<i32> {
        self.generation += 1;
        self.boot().await?;

        loop {
            let poll = self.store.poll_once(&self.config.agent)?;

            if let Some(signal) = poll.signal {
                let reason = match signal {
                    PollSignal::StandDown => "stand_down",
                    PollSignal::Retire => "retire",
                };
                info!(agent = %self.config.agent, reason, "graceful shutdown");
                self.write_state("stopped")?;
                return Ok(EXIT_GRACEFUL);
            }

            if poll.is_empty() {
                // Mandatory back-off; tight-looping on empty polls is a bug.
                let sleep = self.contracts.defaults.poll_backoff_secs(self.empty_polls);
                self.empty_polls = self.empty_polls.saturating_add(1);
                debug!(agent = %self.config.agent, sleep, "empty poll, backing off");
                tokio::time::sleep(Duration::from_secs(sleep)).await;
                continue;
            }
            self.empty_polls = 0;

            self.write_state("working")?;
            let ok = self.turn(poll).await?;
            if ok {
                self.consecutive_failures = 0;
                self.last_error = None;
                self.last_failed_payload = None;
                self.write_state("idle")?;
            } else {
                self.note_failure().await?;
            }
        }
    }

    /// Boot sequence, executed once per generation: register, set context,
    /// set status, then one provider invocation to run the startup rules.
    async fn boot(&mut self) -> MinionResult<()> {
        self.store.register(
            &self.config.agent,
            self.config.class,
            self.config.model.as_deref(),
            Transport::Daemon,
            None,
        )?;
        self.store.set_context(
            &self.config.agent,
            &ContextUpdate {
                context: "just started".to_string(),
                ..Default::default()
            },
        )?;
        self.store.set_status(&self.config.agent, "ready for orders")?;
        self.write_state("booting")?;

        let prompt = build_boot_prompt(&self.contracts, &self.config.agent, self.config.class.as_db_str());
        match self.invoke(&prompt).await {
            Ok(stats) if stats.ok() => {
                self.resume_ready = true;
                self.credit_turn(&stats)?;
                info!(agent = %self.config.agent, generation = self.generation, "boot complete");
            }
            Ok(stats) => {
                warn!(agent = %self.config.agent, exit = stats.exit_code, "boot invocation failed");
            }
            Err(e) => {
                warn!(agent = %self.config.agent, error = %e, "boot invocation error");
            }
        }
        self.write_state("idle")?;
        Ok(())
    }

    /// One working turn: assemble the prompt, drive the provider, account
    /// for the stream.
    async fn turn(&mut self, poll: PollResult) -> MinionResult<bool> {
        self.track_failed_payload(&poll);

        // Compaction recovery: synthesized briefing plus the rolling replay.
        let (briefing, replay) = if self.inject_history_next_turn && !self.buffer.is_empty() {
            self.inject_history_next_turn = false;
            let cold = self.recovery_briefing()?;
            let replay = self
                .buffer
                .snapshot_capped(self.contracts.defaults.max_prompt_chars);
            (Some(cold), Some(replay))
        } else {
            (None, None)
        };

        let prompt = build_turn_prompt(
            &self.contracts,
            &self.config.agent,
            self.config.class.as_db_str(),
            &poll,
            briefing.as_ref(),
            replay,
            self.contracts.defaults.max_prompt_chars,
        );

        let stats = match self.invoke(&prompt).await {
            Ok(stats) => stats,
            Err(ProviderError::RateLimited { retry_after_secs }) => {
                self.last_error = Some(format!(
                    "rate limited{}",
                    retry_after_secs.map(|s| format!(" (retry after {}s)", s)).unwrap_or_default()
                ));
                return Ok(false);
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                return Ok(false);
            }
        };

        if stats.interrupted {
            info!(agent = %self.config.agent, "turn interrupted, returning to poll loop");
            return Ok(true);
        }

        if stats.compaction_detected {
            // Not an error. Flag the replay for the next prompt.
            self.inject_history_next_turn = true;
            info!(agent = %self.config.agent, "compaction marker observed, history will be re-injected");
        }

        if stats.timed_out {
            self.last_error = Some(format!(
                "no output for {}s",
                self.contracts.defaults.no_output_timeout_secs
            ));
            return Ok(false);
        }
        if stats.exit_code != 0 {
            self.last_error = Some(format!("provider exited with code {}", stats.exit_code));
            return Ok(false);
        }

        self.resume_ready = true;
        self.credit_turn(&stats)?;
        Ok(true)
    }

    /// Drive one provider subprocess to completion, streaming events into
    /// the buffer and the tail mirror.
    async fn invoke(&mut self, prompt: &str) -> Result<TurnStats, ProviderError> {
        let launch = self.launch_spec();
        let mut handle = self.provider.spawn(prompt, &launch).await?;
        let no_output = Duration::from_secs(self.contracts.defaults.no_output_timeout_secs);
        let check_every = Duration::from_secs(INTERRUPT_CHECK_SECS);

        let mut stats = TurnStats::default();
        let mut quiet = Duration::ZERO;

        loop {
            // Short reads so interrupt flags are observed promptly; the
            // no-output budget accumulates across quiet windows.
            match handle.next_event(check_every).await {
                Ok(Some(event)) => {
                    quiet = Duration::ZERO;
                    self.consume_event(&event, &mut stats);
                }
                Ok(None) => break,
                Err(ProviderError::StreamTimeout { .. }) => {
                    quiet += check_every;
                    if quiet >= no_output {
                        stats.timed_out = true;
                        handle.kill().await;
                        break;
                    }
                    if self.store.take_interrupt(&self.config.agent).unwrap_or(false) {
                        stats.interrupted = true;
                        handle.kill().await;
                        break;
                    }
                }
                Err(e) => {
                    let _ = self.tail.flush();
                    return Err(e);
                }
            }
        }

        stats.exit_code = handle.wait().await.unwrap_or(-1);
        let _ = self.tail.flush();
        Ok(stats)
    }

    fn consume_event(&mut self, event: &StreamEvent, stats: &mut TurnStats) {
        self.buffer.append(&event.raw);
        self.buffer.append("\n");
        self.tail.push(&event.raw);
        self.tail.push("\n");

        if self.contracts.compaction_markers.detect(&event.raw) {
            stats.compaction_detected = true;
        }

        // Last usage wins: the result event arrives last with full totals.
        let usage = self.provider.extract_usage(event);
        if let Some(input) = usage.turn_input {
            if input > 0 {
                stats.turn_input = input;
            }
        }
        if let Some(output) = usage.turn_output {
            if output > 0 {
                stats.turn_output = output;
            }
        }
        if let Some(window) = usage.context_window {
            stats.context_window = Some(window);
        }
        if let Some(session) = self.provider.extract_session_id(event) {
            stats.session_id = Some(session);
        }
    }

    /// Credit a successful turn to HP telemetry and the session totals.
    /// Failure-loop turns never reach this, so the accounting columns stay
    /// honest.
    fn credit_turn(&mut self, stats: &TurnStats) -> MinionResult<()> {
        if let Some(window) = stats.context_window {
            self.context_window = window.max(1);
        }
        if let Some(session) = &stats.session_id {
            self.session_id = Some(session.clone());
        }
        if stats.turn_input == 0 && stats.turn_output == 0 {
            return Ok(());
        }

        self.session_input_tokens += stats.turn_input;
        self.session_output_tokens += stats.turn_output;

        // The daemon writes HP under its own capability; it never promotes
        // the agent's class.
        let caller = Caller::daemon(self.config.class);
        authorize(caller, Command::UpdateHp)?;
        let outcome = self.store.update_hp(
            &self.config.agent,
            &HpSample {
                input_tokens: self.session_input_tokens,
                output_tokens: self.session_output_tokens,
                limit: self.context_window,
                turn_input: Some(stats.turn_input),
                turn_output: Some(stats.turn_output),
            },
        )?;
        debug!(agent = %self.config.agent, hp = %outcome.hp, "turn telemetry written");
        Ok(())
    }

    /// The circuit breaker: consecutive failures on the same payload alert
    /// the lead through the datastore *and* a state-dir file, then back off
    /// exponentially.
    async fn note_failure(&mut self) -> MinionResult<()> {
        self.consecutive_failures += 1;
        self.write_state("error")?;

        let threshold = self.contracts.defaults.failure_alert_threshold;
        if self.consecutive_failures == threshold {
            let message = format!(
                "PollFailure: agent {} has {} consecutive failures. Last error: {}",
                self.config.agent,
                self.consecutive_failures,
                self.last_error.as_deref().unwrap_or("unknown")
            );
            error!(agent = %self.config.agent, %message, "circuit breaker tripped");
            // Side channel first - the datastore may be the broken part.
            write_poll_failure(
                &self.store.paths().poll_failure_file(&self.config.agent),
                self.config.agent.as_str(),
                self.consecutive_failures,
                self.last_error.as_deref().unwrap_or("unknown"),
            );
            if let Err(e) = self.alert_lead(&message) {
                warn!(agent = %self.config.agent, error = %e, "lead alert failed");
            }
        }

        let backoff = self
            .contracts
            .defaults
            .failure_backoff_secs(self.consecutive_failures);
        warn!(
            agent = %self.config.agent,
            failures = self.consecutive_failures,
            backoff,
            error = self.last_error.as_deref().unwrap_or("unknown"),
            "turn failed, backing off"
        );
        tokio::time::sleep(Duration::from_secs(backoff)).await;
        Ok(())
    }

    fn alert_lead(&mut self, message: &str) -> MinionResult<()> {
        // System alerts bypass the send gates by design.
        let lead = self
            .store
            .who()?
            .into_iter()
            .find(|a| a.agent.class == AgentClass::Lead)
            .map(|a| a.agent.name);
        if let Some(lead) = lead {
            self.store.system_alert(&lead, message)?;
        }
        Ok(())
    }

    fn recovery_briefing(&mut self) -> MinionResult<RecoveryBriefing> {
        let plan = self.store.sitrep()?;
        let open_tasks = self
            .store
            .available_tasks(&self.config.agent)
            .unwrap_or_default();
        let fenix = self.store.peek_fenix(&self.config.agent).unwrap_or_default();
        let last_hp = self.store.last_hp(&self.config.agent)?;
        Ok(RecoveryBriefing {
            plan_summary: plan.battle_plan.map(|p| p.content),
            open_tasks: open_tasks
                .iter()
                .map(|t| format!("#{} {} [{}]", t.task_id, t.title, t.status))
                .collect(),
            last_hp,
            fenix_manifests: fenix
                .iter()
                .map(|r| format!("{} ({} files)", r.manifest, r.files.len()))
                .collect(),
        })
    }

    fn launch_spec(&self) -> AgentLaunch {
        let paths = self.store.paths();
        AgentLaunch {
            agent: self.config.agent.to_string(),
            model: self.config.model.clone(),
            system_prompt: None,
            allowed_tools: self.config.allowed_tools.clone(),
            permission_mode: self.config.permission_mode.clone(),
            project_dir: Some(self.config.project_dir.clone()),
            resume_session: if self.resume_ready {
                self.session_id.clone()
            } else {
                None
            },
            env: vec![
                (ENV_CALLER_CLASS.to_string(), self.config.class.as_db_str().to_string()),
                (ENV_DB_PATH.to_string(), paths.db_path().display().to_string()),
                (
                    ENV_DOCS_DIR.to_string(),
                    self.config
                        .docs_dir
                        .as_ref()
                        .map(|d| d.display().to_string())
                        .unwrap_or_default(),
                ),
            ],
        }
    }

    /// Track the payload identity so the breaker counts failures of the
    /// *same* work, not unrelated hiccups.
    fn track_failed_payload(&mut self, poll: &PollResult) {
        use minion_core::RowIdType;
        let mut ids: Vec<i64> = poll.messages.iter().map(|m| m.message.id.as_i64()).collect();
        ids.extend(poll.tasks.iter().map(|t| t.task_id.as_i64()));
        ids.sort_unstable();
        if self.last_failed_payload.as_ref() != Some(&ids) {
            // New payload: the failure streak starts over.
            if self.last_failed_payload.is_some() {
                self.consecutive_failures = 0;
            }
            self.last_failed_payload = Some(ids);
        }
    }

    fn write_state(&self, status: &str) -> MinionResult<()> {
        self.state.write(&DaemonState {
            agent: self.config.agent.to_string(),
            provider: self.provider.name().to_string(),
            pid: std::process::id(),
            status: status.to_string(),
            updated_at: chrono::Utc::now(),
            consecutive_failures: self.consecutive_failures,
            resume_ready: self.resume_ready,
            last_error: self.last_error.clone(),
            generation: self.generation,
        })
    }
}
