//! MINION Provider - Model CLI Abstraction
//!
//! A provider wraps one external model CLI as a subprocess emitting
//! line-framed structured events. The daemon is provider-agnostic: it needs
//! spawn, a stream of events, per-event usage extraction, and a handful of
//! static capability flags. Nothing provider-specific leaks above this line.

mod handle;
mod providers;

pub use handle::*;
pub use providers::*;

use async_trait::async_trait;
use minion_core::ProviderError;
use serde::{Deserialize, Serialize};

/// Static capabilities a provider declares up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCaps {
    pub can_read_outside_project: bool,
    pub shell_sandbox: bool,
    pub default_context_window: u64,
    pub supports_resume: bool,
}

/// Token usage extracted from one stream event. Fields absent when the
/// event carries no usage data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnUsage {
    pub turn_input: Option<u64>,
    pub turn_output: Option<u64>,
    /// Context window, when the provider reports one.
    pub context_window: Option<u64>,
}

impl TurnUsage {
    pub fn is_empty(&self) -> bool {
        self.turn_input.is_none() && self.turn_output.is_none() && self.context_window.is_none()
    }
}

/// One line-framed event off the provider's stdout.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub raw: String,
    /// Parsed JSON when the line is a structured event.
    pub json: Option<serde_json::Value>,
}

impl StreamEvent {
    pub fn from_line(line: String) -> StreamEvent {
        let json = serde_json::from_str(line.trim()).ok();
        StreamEvent { raw: line, json }
    }

    /// Human-readable text fragments buried in the event, for console
    /// rendering and the rolling buffer.
    pub fn text_fragments(&self) -> Vec<&str> {
        const TEXT_KEYS: [&str; 4] = ["text", "content", "delta", "output_text"];
        let mut out = Vec::new();
        fn walk<'a>(node: &'a serde_json::Value, keys: &[&str], out: &mut Vec<&'a str>) {
            match node {
                serde_json::Value::Object(map) => {
                    for (key, value) in map {
                        if let (true, Some(s)) = (keys.contains(&key.as_str()), value.as_str()) {
                            out.push(s);
                        } else {
                            walk(value, keys, out);
                        }
                    }
                }
                serde_json::Value::Array(items) => {
                    for item in items {
                        walk(item, keys, out);
                    }
                }
                _ => {}
            }
        }
        if let Some(json) = &self.json {
            walk(json, &TEXT_KEYS, &mut out);
        }
        out
    }
}

/// Everything needed to launch one agent turn.
#[derive(Debug, Clone, Default)]
pub struct AgentLaunch {
    pub agent: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub allowed_tools: Option<String>,
    pub permission_mode: Option<String>,
    pub project_dir: Option<std::path::PathBuf>,
    /// Resume an earlier session instead of starting fresh.
    pub resume_session: Option<String>,
    /// Extra environment handed to the subprocess (caller class, datastore
    /// location).
    pub env: Vec<(String, String)>,
}

/// A model CLI provider. Implementations must be thread-safe.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    fn caps(&self) -> ProviderCaps;

    /// The argv to run for one turn with the given prompt.
    fn build_command(&self, prompt: &str, launch: &AgentLaunch) -> Vec<String>;

    /// Whether the prompt is delivered over stdin rather than argv.
    fn prompt_via_stdin(&self) -> bool {
        false
    }

    /// Extract usage from one event. Provider-specific; everything else in
    /// the daemon is not.
    fn extract_usage(&self, event: &StreamEvent) -> TurnUsage;

    /// Session identifier for resume support, when the event carries one.
    fn extract_session_id(&self, event: &StreamEvent) -> Option<String> {
        let _ = event;
        None
    }

    /// Spawn the subprocess for one turn and hand back the event stream.
    async fn spawn(&self, prompt: &str, launch: &AgentLaunch) -> Result<ProviderHandle, ProviderError> {
        let argv = self.build_command(prompt, launch);
        let stdin_prompt = if self.prompt_via_stdin() {
            Some(prompt.to_string())
        } else {
            None
        };
        ProviderHandle::spawn(argv, launch, stdin_prompt).await
    }
}
