//! Scripted provider for tests - streams canned lines through a real
//! subprocess so the handle plumbing is exercised end to end.

use crate::{AgentLaunch, Provider, ProviderCaps, StreamEvent, TurnUsage};
use serde_json::Value;

/// Streams its scripted lines via `printf` and exits 0.
#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    pub script: Vec<String>,
}

impl MockProvider {
    pub fn with_script(lines: impl IntoIterator<Item = impl Into<String>>) -> MockProvider {
        MockProvider {
            script: lines.into_iter().map(Into::into).collect(),
        }
    }
}

impl Provider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn caps(&self) -> ProviderCaps {
        ProviderCaps {
            can_read_outside_project: false,
            shell_sandbox: true,
            default_context_window: 200_000,
            supports_resume: false,
        }
    }

    fn build_command(&self, _prompt: &str, _launch: &AgentLaunch) -> Vec<String> {
        let mut cmd = vec!["printf".to_string(), "%s\\n".to_string()];
        cmd.extend(self.script.iter().cloned());
        cmd
    }

    fn extract_usage(&self, event: &StreamEvent) -> TurnUsage {
        // Mock events carry a flat usage dict.
        let json = match &event.json {
            Some(json) => json,
            None => return TurnUsage::default(),
        };
        let usage = match json.get("usage") {
            Some(usage) => usage,
            None => return TurnUsage::default(),
        };
        TurnUsage {
            turn_input: usage.get("input").and_then(Value::as_u64),
            turn_output: usage.get("output").and_then(Value::as_u64),
            context_window: usage.get("window").and_then(Value::as_u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn scripted_lines_stream_through_a_real_subprocess() {
        let provider = MockProvider::with_script([
            r#"{"type":"text","text":"hello"}"#,
            r#"{"type":"result","usage":{"input":1200,"output":80,"window":200000}}"#,
        ]);
        let launch = AgentLaunch::default();
        let mut handle = provider.spawn("ignored", &launch).await.unwrap();

        let first = handle
            .next_event(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("first event");
        assert_eq!(first.text_fragments(), vec!["hello"]);

        let second = handle
            .next_event(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("second event");
        let usage = provider.extract_usage(&second);
        assert_eq!(usage.turn_input, Some(1200));
        assert_eq!(usage.context_window, Some(200_000));

        assert!(handle.next_event(Duration::from_secs(5)).await.unwrap().is_none());
        assert_eq!(handle.wait().await.unwrap(), 0);
    }
}
