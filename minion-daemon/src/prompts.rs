//! Prompt assembly - boot prompt, turn prompt, and the recovery briefing.

use crate::Contracts;
use minion_core::AgentName;
use minion_store::{ColdStart, PollResult};

/// Synthesized state summary prepended after a compaction: the active plan,
/// the agent's open tasks, and last known HP, ahead of the raw replay.
#[derive(Debug, Clone, Default)]
pub struct RecoveryBriefing {
    pub plan_summary: Option<String>,
    pub open_tasks: Vec<String>,
    pub last_hp: String,
    pub fenix_manifests: Vec<String>,
}

impl RecoveryBriefing {
    pub fn from_cold_start(briefing: &ColdStart) -> RecoveryBriefing {
        RecoveryBriefing {
            plan_summary: briefing
                .battle_plan
                .as_ref()
                .map(|p| truncate(&p.content, 1_000)),
            open_tasks: briefing
                .open_tasks
                .iter()
                .map(|t| format!("#{} {} [{}]", t.id, t.title, t.status))
                .collect(),
            last_hp: briefing.last_hp.clone(),
            fenix_manifests: briefing
                .fenix_records
                .iter()
                .map(|r| format!("{} ({} files)", r.manifest, r.files.len()))
                .collect(),
        }
    }

    fn render(&self) -> String {
        let mut out = String::from("## Recovery briefing\n");
        match &self.plan_summary {
            Some(plan) => {
                out.push_str("Active plan:\n");
                out.push_str(plan);
                out.push('\n');
            }
            None => out.push_str("No active plan.\n"),
        }
        if self.open_tasks.is_empty() {
            out.push_str("No tasks assigned to you.\n");
        } else {
            out.push_str("Your open tasks:\n");
            for task in &self.open_tasks {
                out.push_str("- ");
                out.push_str(task);
                out.push('\n');
            }
        }
        out.push_str(&format!("Last HP: {}\n", self.last_hp));
        for manifest in &self.fenix_manifests {
            out.push_str(&format!("Fenix record pending: {}\n", manifest));
        }
        out
    }
}

/// The first prompt of a generation: rules plus the startup commands.
pub fn build_boot_prompt(contracts: &Contracts, agent: &AgentName, class: &str) -> String {
    let mut sections = Vec::new();
    let rules = contracts.rules_for(class);
    if !rules.is_empty() {
        sections.push(rules);
    }
    sections.push(format!(
        "You are agent '{}' (class {}). The coordination CLI is `minion`.",
        agent, class
    ));
    match &contracts.boot_sequence {
        Some(seq) if !seq.steps.is_empty() => {
            let mut steps = String::from("ON STARTUP:\n");
            for (i, step) in seq.steps.iter().enumerate() {
                steps.push_str(&format!("  {}. {}\n", i + 1, step));
            }
            sections.push(steps);
        }
        _ => {
            sections.push(
                "ON STARTUP:\n  1. Confirm your registration with `minion who`.\n  2. Report readiness with `minion set-status`.\n"
                    .to_string(),
            );
        }
    }
    sections.join("\n\n")
}

/// A working turn: rules, optional recovery material, then the delivered
/// payload. `max_chars` caps the replay so the prompt stays inside the
/// provider's input budget.
pub fn build_turn_prompt(
    contracts: &Contracts,
    agent: &AgentName,
    class: &str,
    poll: &PollResult,
    briefing: Option<&RecoveryBriefing>,
    replay: Option<String>,
    max_chars: usize,
) -> String {
    let mut sections = Vec::new();

    let rules = contracts.rules_for(class);
    if !rules.is_empty() {
        sections.push(rules);
    }

    if let Some(briefing) = briefing {
        sections.push(briefing.render());
    }

    if let Some(replay) = replay {
        let capped = cap_tail(&replay, max_chars);
        sections.push(format!(
            "## Session replay (context was compacted; this is your recent output)\n{}",
            capped
        ));
    }

    let mut payload = String::new();
    if !poll.messages.is_empty() {
        payload.push_str("## Messages\n");
        for msg in &poll.messages {
            let cc_note = if msg.message.is_cc {
                format!(
                    " [CC, originally to {}]",
                    msg.message.cc_original_to.as_deref().unwrap_or("unknown")
                )
            } else {
                String::new()
            };
            payload.push_str(&format!(
                "From {}{}:\n{}\n\n",
                msg.message.from_agent, cc_note, msg.content
            ));
        }
    }
    if !poll.tasks.is_empty() {
        payload.push_str("## Available tasks\n");
        for task in &poll.tasks {
            payload.push_str(&format!(
                "- #{} {} [{}] - claim with `{}`\n",
                task.task_id, task.title, task.status, task.claim_cmd
            ));
        }
    }
    if payload.is_empty() {
        payload.push_str("No new messages or tasks. Continue your current work.\n");
    }
    payload.push_str(&format!(
        "\nYou are agent '{}'. Work the payload above, then report via the minion CLI.",
        agent
    ));
    sections.push(payload);

    sections.join("\n\n")
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

fn cap_tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_prompt_orders_rules_briefing_replay_payload() {
        let contracts = Contracts::load(None);
        let agent = AgentName::from("c1");
        let briefing = RecoveryBriefing {
            plan_summary: Some("ship the fix".into()),
            open_tasks: vec!["#4 fix parser [in_progress]".into()],
            last_hp: "40% HP [120k/200k] - Wounded".into(),
            fenix_manifests: vec![],
        };
        let poll = PollResult {
            signal: None,
            messages: vec![],
            tasks: vec![],
        };
        let prompt = build_turn_prompt(
            &contracts,
            &agent,
            "coder",
            &poll,
            Some(&briefing),
            Some("earlier output".into()),
            1_000,
        );
        let briefing_at = prompt.find("Recovery briefing").unwrap();
        let replay_at = prompt.find("Session replay").unwrap();
        let payload_at = prompt.find("No new messages").unwrap();
        assert!(briefing_at < replay_at && replay_at < payload_at);
        assert!(prompt.contains("#4 fix parser"));
    }

    #[test]
    fn replay_is_capped_from_the_tail() {
        let contracts = Contracts::load(None);
        let agent = AgentName::from("c1");
        let poll = PollResult {
            signal: None,
            messages: vec![],
            tasks: vec![],
        };
        let replay = "x".repeat(10_000) + "THE-END";
        let prompt = build_turn_prompt(&contracts, &agent, "coder", &poll, None, Some(replay), 500);
        assert!(prompt.contains("THE-END"));
        let replay_section = prompt.split("Session replay").nth(1).unwrap();
        assert!(replay_section.len() < 1_200);
    }

    #[test]
    fn boot_prompt_names_the_agent_and_startup() {
        let contracts = Contracts::load(None);
        let prompt = build_boot_prompt(&contracts, &AgentName::from("b7"), "builder");
        assert!(prompt.contains("agent 'b7'"));
        assert!(prompt.contains("ON STARTUP"));
    }
}
