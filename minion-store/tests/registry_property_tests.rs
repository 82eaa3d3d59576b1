//! Property-based tests for the registry, HP telemetry, and recovery.
//!
//! Covers register idempotence, HP alert idempotence across a monotonically
//! falling run, HP modes, and the fenix-down / cold-start cycle.

use minion_core::{AgentClass, HpMode, Liveness, Transport};
use minion_store::{ContextUpdate, HpSample};
use minion_test_utils::TestStore;
use proptest::prelude::*;

fn sample(turn_input: u64, limit: u64) -> HpSample {
    HpSample {
        input_tokens: turn_input,
        output_tokens: 100,
        limit,
        turn_input: Some(turn_input),
        turn_output: Some(50),
    }
}

// ============================================================================
// REGISTER
// ============================================================================

#[test]
fn register_is_idempotent() {
    let mut fixture = TestStore::new();
    let first = fixture.agent("c1", AgentClass::Coder);
    let again = fixture
        .store
        .register(&first, AgentClass::Coder, Some("sonnet"), Transport::Daemon, None)
        .unwrap();
    assert!(again.refreshed);

    let who = fixture.store.who().unwrap();
    assert_eq!(who.len(), 1);
    assert_eq!(who[0].agent.model.as_deref(), Some("sonnet"));
    assert_eq!(who[0].agent.transport, Transport::Daemon);
    assert_eq!(who[0].liveness, Liveness::Active);
}

#[test]
fn reregister_clears_retire_record() {
    let mut fixture = TestStore::new();
    let lead = fixture.agent("commander", AgentClass::Lead);
    let coder = fixture.agent("c1", AgentClass::Coder);

    fixture.store.retire_agent(&lead, &coder).unwrap();
    assert!(fixture.store.is_retired(&coder).unwrap());

    fixture
        .store
        .register(&coder, AgentClass::Coder, None, Transport::Daemon, None)
        .unwrap();
    assert!(!fixture.store.is_retired(&coder).unwrap());
}

#[test]
fn rename_rewrites_addressing() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    fixture.fresh_context(&lead);
    let coder = fixture.agent("old-name", AgentClass::Coder);
    fixture.store.send(&lead, "old-name", "for you", &[]).unwrap();

    fixture
        .store
        .rename(&coder, &minion_core::AgentName::from("new-name"))
        .unwrap();

    let renamed = minion_core::AgentName::from("new-name");
    let inbox = fixture.store.check_inbox(&renamed).unwrap();
    assert_eq!(inbox.len(), 1);
}

// ============================================================================
// HP ALERTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// For a monotonically decreasing HP run, the 25% and 10% alerts fire at
    /// most once each, regardless of how many samples arrive.
    #[test]
    fn hp_alerts_fire_at_most_once_per_threshold(
        steps in prop::collection::vec(1_000u64..200_000, 3..12)
    ) {
        let mut fixture = TestStore::new();
        let lead = fixture.agent("commander", AgentClass::Lead);
        let coder = fixture.agent("c1", AgentClass::Coder);

        // Monotonically increasing usage = monotonically falling HP.
        let mut usage: Vec<u64> = steps;
        usage.sort_unstable();

        let mut fired_25 = 0;
        let mut fired_10 = 0;
        for turn_input in usage {
            let outcome = fixture.store.update_hp(&coder, &sample(turn_input, 200_000)).unwrap();
            fired_25 += outcome.alerts_fired.iter().filter(|t| **t == 25).count();
            fired_10 += outcome.alerts_fired.iter().filter(|t| **t == 10).count();
        }
        prop_assert!(fired_25 <= 1, "25%% alert fired {} times", fired_25);
        prop_assert!(fired_10 <= 1, "10%% alert fired {} times", fired_10);

        // Alerts land in the lead's inbox as system messages.
        let inbox = fixture.store.check_inbox(&lead).unwrap();
        prop_assert_eq!(inbox.len(), fired_25 + fired_10);
        for msg in &inbox {
            prop_assert_eq!(msg.message.from_agent.as_str(), "system");
        }
    }
}

#[test]
fn hp_recovery_rearms_alerts() {
    let mut fixture = TestStore::new();
    let lead = fixture.agent("commander", AgentClass::Lead);
    let coder = fixture.agent("c1", AgentClass::Coder);

    // Drop below 25%: alert fires.
    let out = fixture.store.update_hp(&coder, &sample(160_000, 200_000)).unwrap();
    assert_eq!(out.alerts_fired, vec![25]);
    // Same zone again: suppressed.
    let out = fixture.store.update_hp(&coder, &sample(165_000, 200_000)).unwrap();
    assert!(out.alerts_fired.is_empty());

    // Recover above 50% (fresh session), then drop again: re-fires.
    fixture.store.update_hp(&coder, &sample(20_000, 200_000)).unwrap();
    let out = fixture.store.update_hp(&coder, &sample(160_000, 200_000)).unwrap();
    assert_eq!(out.alerts_fired, vec![25]);

    let _ = fixture.store.check_inbox(&lead);
}

#[test]
fn hp_boundary_full_context_reads_zero() {
    let mut fixture = TestStore::new();
    let coder = fixture.agent("c1", AgentClass::Coder);
    let out = fixture.store.update_hp(&coder, &sample(200_000, 200_000)).unwrap();
    assert!(out.hp.starts_with("0% HP"));
    // Both thresholds crossed in one fall.
    assert_eq!(out.alerts_fired, Vec::<u8>::new()); // no lead registered, nothing to alert
}

#[test]
fn self_report_holds_until_the_next_provider_turn() {
    let mut fixture = TestStore::new();
    let coder = fixture.agent("c1", AgentClass::Coder);

    fixture
        .store
        .set_context(
            &coder,
            &ContextUpdate {
                context: "manual report".into(),
                hp: Some(40),
                ..Default::default()
            },
        )
        .unwrap();

    let agent = fixture.store.get_agent(&coder).unwrap().unwrap();
    assert_eq!(agent.hp.mode, HpMode::SelfReported);
    assert_eq!(agent.hp.tokens_limit, Some(100));

    // A turnless daemon write (generation reset) defers to the self-report.
    let reset = HpSample {
        input_tokens: 0,
        output_tokens: 0,
        limit: 200_000,
        turn_input: None,
        turn_output: None,
    };
    let out = fixture.store.update_hp(&coder, &reset).unwrap();
    assert!(out.skipped_self_reported);
    let agent = fixture.store.get_agent(&coder).unwrap().unwrap();
    assert_eq!(agent.hp.mode, HpMode::SelfReported);

    // The next real provider turn reclaims daemon mode.
    let out = fixture.store.update_hp(&coder, &sample(10_000, 200_000)).unwrap();
    assert!(!out.skipped_self_reported);
    let agent = fixture.store.get_agent(&coder).unwrap().unwrap();
    assert_eq!(agent.hp.mode, HpMode::Daemon);
    assert_eq!(agent.hp.tokens_limit, Some(200_000));
}

#[test]
fn unregistered_telemetry_reads_unknown() {
    let mut fixture = TestStore::new();
    let coder = fixture.agent("c1", AgentClass::Coder);
    let who = fixture.store.who().unwrap();
    assert_eq!(who[0].hp_summary, "HP unknown");
    let _ = coder;
}

// ============================================================================
// FENIX / COLD START
// ============================================================================

#[test]
fn fenix_records_are_consumed_exactly_once() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    let coder = fixture.agent("c1", AgentClass::Coder);
    let _ = &lead;

    fixture
        .store
        .fenix_down(
            &coder,
            &["notes.md".to_string(), "findings.md".to_string()],
            "auth refactor state",
        )
        .unwrap();

    let briefing = fixture.store.cold_start(&coder).unwrap();
    assert_eq!(briefing.fenix_records.len(), 1);
    assert_eq!(briefing.fenix_records[0].files.len(), 2);
    assert!(briefing.battle_plan.is_some());

    // Consumed: a second cold start returns none.
    let again = fixture.store.cold_start(&coder).unwrap();
    assert!(again.fenix_records.is_empty());
}

#[test]
fn fenix_down_is_accepted_with_stale_context() {
    let mut fixture = TestStore::new();
    let coder = fixture.agent("c1", AgentClass::Coder);
    // No plan, no context, nothing - the dump must still land.
    fixture
        .store
        .fenix_down(&coder, &["state.md".to_string()], "dying words")
        .unwrap();
    let records = fixture.store.peek_fenix(&coder).unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].consumed_at.is_none());
}

#[test]
fn cold_start_includes_open_tasks_and_roster() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    let coder = fixture.agent("c1", AgentClass::Coder);

    let spec = fixture.spec_file("recov");
    let task = fixture
        .store
        .create_task(
            &lead,
            &minion_store::CreateTask {
                title: "recovery target".into(),
                task_file: spec.display().to_string(),
                class_required: Some(AgentClass::Coder),
                ..Default::default()
            },
        )
        .unwrap()
        .id;
    fixture.store.pull_task(&coder, task).unwrap();

    let briefing = fixture.store.cold_start(&coder).unwrap();
    assert_eq!(briefing.open_tasks.len(), 1);
    assert_eq!(briefing.open_tasks[0].id, task);
    assert_eq!(briefing.roster.len(), 2);
}
