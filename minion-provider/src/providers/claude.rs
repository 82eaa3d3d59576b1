//! Claude Code CLI provider - stream-json parsing.

use crate::{AgentLaunch, Provider, ProviderCaps, StreamEvent, TurnUsage};
use serde_json::Value;

/// Claude Code CLI, invoked per turn with `--output-format stream-json`.
#[derive(Debug, Clone, Default)]
pub struct ClaudeProvider;

impl ClaudeProvider {
    /// Context consumed this turn is the sum of fresh input plus cache
    /// creation plus cache reads - the split fields individually undercount.
    fn usage_from_dict(usage: &Value) -> Option<(u64, u64)> {
        let get = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
        usage.get("input_tokens")?;
        let input = get("input_tokens") + get("cache_creation_input_tokens") + get("cache_read_input_tokens");
        let output = get("output_tokens");
        Some((input, output))
    }

    /// Find a usage dict anywhere in the event payload.
    fn find_usage(node: &Value) -> Option<&Value> {
        match node {
            Value::Object(map) => {
                if map.contains_key("input_tokens") {
                    return Some(node);
                }
                map.values().find_map(Self::find_usage)
            }
            Value::Array(items) => items.iter().find_map(Self::find_usage),
            _ => None,
        }
    }
}

impl Provider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn caps(&self) -> ProviderCaps {
        ProviderCaps {
            can_read_outside_project: true,
            shell_sandbox: false,
            default_context_window: 200_000,
            supports_resume: true,
        }
    }

    fn build_command(&self, prompt: &str, launch: &AgentLaunch) -> Vec<String> {
        let mut cmd = vec![
            "claude".to_string(),
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(system) = launch.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            cmd.push("--system-prompt".to_string());
            cmd.push(system.to_string());
        }
        if let Some(session) = &launch.resume_session {
            cmd.push("--resume".to_string());
            cmd.push(session.clone());
        }
        if let Some(tools) = &launch.allowed_tools {
            cmd.push("--allowed-tools".to_string());
            cmd.push(tools.clone());
        }
        if let Some(mode) = &launch.permission_mode {
            cmd.push("--permission-mode".to_string());
            cmd.push(mode.clone());
        }
        if let Some(model) = &launch.model {
            cmd.push("--model".to_string());
            cmd.push(model.clone());
        }
        cmd
    }

    fn extract_usage(&self, event: &StreamEvent) -> TurnUsage {
        let json = match &event.json {
            Some(json) => json,
            None => return TurnUsage::default(),
        };

        // Prefer modelUsage off the result event - it carries the context
        // window too.
        if json.get("type").and_then(Value::as_str) == Some("result") {
            if let Some(model_usage) = json.get("modelUsage").and_then(Value::as_object) {
                for info in model_usage.values() {
                    let get = |key: &str| info.get(key).and_then(Value::as_u64).unwrap_or(0);
                    let input = get("inputTokens")
                        + get("cacheCreationInputTokens")
                        + get("cacheReadInputTokens");
                    let output = get("outputTokens");
                    let window = info.get("contextWindow").and_then(Value::as_u64);
                    if input > 0 || output > 0 || window.is_some() {
                        return TurnUsage {
                            turn_input: Some(input),
                            turn_output: Some(output),
                            context_window: window.filter(|w| *w > 0),
                        };
                    }
                }
            }
        }

        match Self::find_usage(json).and_then(Self::usage_from_dict) {
            Some((input, output)) => TurnUsage {
                turn_input: Some(input),
                turn_output: Some(output),
                context_window: None,
            },
            None => TurnUsage::default(),
        }
    }

    fn extract_session_id(&self, event: &StreamEvent) -> Option<String> {
        let json = event.json.as_ref()?;
        if json.get("type").and_then(Value::as_str) != Some("result") {
            return None;
        }
        json.get("session_id")
            .or_else(|| json.get("sessionId"))
            .and_then(Value::as_str)
            .map(String::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(raw: &str) -> StreamEvent {
        StreamEvent::from_line(raw.to_string())
    }

    #[test]
    fn usage_sums_cache_fields() {
        let p = ClaudeProvider;
        let e = event(
            r#"{"type":"assistant","message":{"usage":{"input_tokens":12,"cache_creation_input_tokens":3000,"cache_read_input_tokens":45000,"output_tokens":820}}}"#,
        );
        let usage = p.extract_usage(&e);
        assert_eq!(usage.turn_input, Some(48_012));
        assert_eq!(usage.turn_output, Some(820));
        assert_eq!(usage.context_window, None);
    }

    #[test]
    fn result_event_carries_context_window_and_session() {
        let p = ClaudeProvider;
        let e = event(
            r#"{"type":"result","session_id":"abc-123","modelUsage":{"claude":{"inputTokens":100,"cacheReadInputTokens":55000,"outputTokens":900,"contextWindow":200000}}}"#,
        );
        let usage = p.extract_usage(&e);
        assert_eq!(usage.turn_input, Some(55_100));
        assert_eq!(usage.turn_output, Some(900));
        assert_eq!(usage.context_window, Some(200_000));
        assert_eq!(p.extract_session_id(&e).as_deref(), Some("abc-123"));
    }

    #[test]
    fn non_usage_lines_are_empty() {
        let p = ClaudeProvider;
        assert!(p.extract_usage(&event("plain text, not json")).is_empty());
        assert!(p.extract_usage(&event(r#"{"type":"system","subtype":"init"}"#)).is_empty());
        assert!(p.extract_session_id(&event(r#"{"type":"assistant"}"#)).is_none());
    }

    #[test]
    fn command_includes_resume_and_model() {
        let p = ClaudeProvider;
        let launch = AgentLaunch {
            resume_session: Some("sess-9".into()),
            model: Some("sonnet".into()),
            system_prompt: Some("be terse".into()),
            ..Default::default()
        };
        let cmd = p.build_command("do the thing", &launch);
        assert_eq!(cmd[0], "claude");
        assert!(cmd.windows(2).any(|w| w == ["--resume", "sess-9"]));
        assert!(cmd.windows(2).any(|w| w == ["--model", "sonnet"]));
        assert!(cmd.windows(2).any(|w| w == ["--system-prompt", "be terse"]));
    }
}
