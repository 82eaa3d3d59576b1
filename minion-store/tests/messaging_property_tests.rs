//! Property-based tests for messaging.
//!
//! Covers per-recipient ordering, broadcast at-most-once delivery, the send
//! gating conjunction, class fan-out, and check-inbox idempotence.

use minion_core::{AgentClass, MinionError, PreconditionError, Trigger};
use minion_test_utils::TestStore;
use proptest::prelude::*;

// ============================================================================
// ORDERING
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// For any two messages to the same recipient, the earlier-sent one
    /// appears first in any inbox drain containing both.
    #[test]
    fn inbox_preserves_send_order(count in 1usize..12) {
        let mut fixture = TestStore::new();
        let lead = fixture.lead_with_plan("commander");
        fixture.fresh_context(&lead);
        let coder = fixture.agent("c1", AgentClass::Coder);

        for i in 0..count {
            fixture.store.send(&lead, "c1", &format!("order {}", i), &[]).unwrap();
        }

        let inbox = fixture.store.check_inbox(&coder).unwrap();
        prop_assert_eq!(inbox.len(), count);
        for (i, msg) in inbox.iter().enumerate() {
            let expected = format!("order {}", i);
            prop_assert_eq!(msg.content.as_str(), expected.as_str());
        }
        for pair in inbox.windows(2) {
            prop_assert!(
                (pair[0].message.timestamp, pair[0].message.id)
                    <= (pair[1].message.timestamp, pair[1].message.id)
            );
        }
    }

    /// check-inbox is idempotent: a second drain with no new arrivals is
    /// empty.
    #[test]
    fn check_inbox_idempotent(count in 0usize..6) {
        let mut fixture = TestStore::new();
        let lead = fixture.lead_with_plan("commander");
        fixture.fresh_context(&lead);
        let coder = fixture.agent("c1", AgentClass::Coder);

        for i in 0..count {
            fixture.store.send(&lead, "c1", &format!("msg {}", i), &[]).unwrap();
        }
        let first = fixture.store.check_inbox(&coder).unwrap();
        prop_assert_eq!(first.len(), count);
        let second = fixture.store.check_inbox(&coder).unwrap();
        prop_assert!(second.is_empty());
    }
}

// ============================================================================
// BROADCAST DEDUP
// ============================================================================

#[test]
fn broadcast_observed_at_most_once_per_agent() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    fixture.fresh_context(&lead);
    let a = fixture.agent("a1", AgentClass::Coder);
    let b = fixture.agent("b1", AgentClass::Builder);
    let c = fixture.agent("c1", AgentClass::Oracle);

    fixture.store.send(&lead, "all", "rally point set", &[]).unwrap();

    for agent in [&a, &b, &c] {
        let first = fixture.store.check_inbox(agent).unwrap();
        assert_eq!(first.len(), 1, "{} sees the broadcast once", agent);
        assert_eq!(first[0].content, "rally point set");
        let second = fixture.store.check_inbox(agent).unwrap();
        assert!(second.is_empty(), "{} must not see it twice", agent);
    }
}

#[test]
fn broadcast_inserts_single_row() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    fixture.fresh_context(&lead);
    fixture.agent("a1", AgentClass::Coder);
    fixture.agent("b1", AgentClass::Coder);

    let outcome = fixture.store.send(&lead, "all", "one row only", &[]).unwrap();
    assert_eq!(outcome.recipients, vec!["all".to_string()]);
}

// ============================================================================
// CLASS FAN-OUT
// ============================================================================

#[test]
fn class_recipient_fans_out_per_member() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    fixture.fresh_context(&lead);
    let a = fixture.agent("c-one", AgentClass::Coder);
    let b = fixture.agent("c-two", AgentClass::Coder);
    fixture.agent("o-one", AgentClass::Oracle);

    let outcome = fixture.store.send(&lead, "coder", "coders assemble", &[]).unwrap();
    assert_eq!(outcome.recipients.len(), 2);

    assert_eq!(fixture.store.check_inbox(&a).unwrap().len(), 1);
    assert_eq!(fixture.store.check_inbox(&b).unwrap().len(), 1);
}

#[test]
fn empty_class_fans_out_to_nothing_without_failing() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    fixture.fresh_context(&lead);

    // No planners registered.
    let outcome = fixture.store.send(&lead, "planner", "anyone there?", &[]).unwrap();
    assert!(outcome.recipients.is_empty());
}

#[test]
fn unknown_recipient_is_an_error() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    fixture.fresh_context(&lead);

    let err = fixture.store.send(&lead, "ghost", "hello?", &[]).unwrap_err();
    assert!(matches!(
        err,
        MinionError::Precondition(PreconditionError::UnknownRecipient { .. })
    ));
}

// ============================================================================
// SEND GATING
// ============================================================================

#[test]
fn stale_sender_is_blocked_until_context_refresh() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    fixture.fresh_context(&lead);
    let coder = fixture.agent("c1", AgentClass::Coder);

    // Registered but never set context: stale by definition.
    let err = fixture.store.send(&coder, "commander", "report", &[]).unwrap_err();
    assert!(matches!(
        err,
        MinionError::Precondition(PreconditionError::StaleContext { .. })
    ));

    fixture.fresh_context(&coder);
    fixture.store.send(&coder, "commander", "report", &[]).unwrap();
}

#[test]
fn unread_inbox_blocks_send() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    fixture.fresh_context(&lead);
    let coder = fixture.agent("c1", AgentClass::Coder);
    fixture.fresh_context(&coder);

    fixture.store.send(&lead, "c1", "orders", &[]).unwrap();

    let err = fixture.store.send(&coder, "commander", "busy", &[]).unwrap_err();
    assert!(matches!(
        err,
        MinionError::Precondition(PreconditionError::UnreadInbox { unread: 1 })
    ));

    fixture.store.check_inbox(&coder).unwrap();
    fixture.store.send(&coder, "commander", "caught up", &[]).unwrap();
}

#[test]
fn no_active_plan_blocks_send() {
    let mut fixture = TestStore::new();
    let lead = fixture.agent("commander", AgentClass::Lead);
    fixture.fresh_context(&lead);
    fixture.agent("c1", AgentClass::Coder);

    let err = fixture.store.send(&lead, "c1", "no plan yet", &[]).unwrap_err();
    assert!(matches!(
        err,
        MinionError::Precondition(PreconditionError::NoActivePlan)
    ));
}

#[test]
fn moon_crash_blocks_non_lead_sends_but_fenix_passes() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    fixture.fresh_context(&lead);
    let coder = fixture.agent("c1", AgentClass::Coder);
    fixture.fresh_context(&coder);

    // Lead raises the emergency flag via trigger.
    let outcome = fixture
        .store
        .send(&lead, "c1", "!!moon_crash!! everyone dump state", &[])
        .unwrap();
    assert!(outcome.triggers.contains(&Trigger::MoonCrash));

    fixture.store.check_inbox(&coder).unwrap();
    let err = fixture.store.send(&coder, "commander", "status?", &[]).unwrap_err();
    assert!(matches!(
        err,
        MinionError::Precondition(PreconditionError::MoonCrash { .. })
    ));

    // A mayday always passes.
    fixture
        .store
        .send(&coder, "commander", "!!fenix_down!! dumping to notes.md", &[])
        .unwrap();

    // Lead clears, normal sends resume.
    fixture.store.clear_moon_crash(&lead).unwrap();
    fixture.store.check_inbox(&coder).unwrap();
    fixture.store.check_inbox(&lead).unwrap();
    fixture.fresh_context(&coder);
    fixture.store.send(&coder, "commander", "back online", &[]).unwrap();
}

// ============================================================================
// AUTO-CC
// ============================================================================

#[test]
fn non_lead_traffic_carries_cc_to_lead() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    fixture.fresh_context(&lead);
    let coder = fixture.agent("c1", AgentClass::Coder);
    let builder = fixture.agent("b1", AgentClass::Builder);
    fixture.fresh_context(&coder);

    let outcome = fixture.store.send(&coder, "b1", "handing off build", &[]).unwrap();
    assert_eq!(outcome.cc, vec!["commander".to_string()]);

    let lead_inbox = fixture.store.check_inbox(&lead).unwrap();
    assert_eq!(lead_inbox.len(), 1);
    assert!(lead_inbox[0].message.is_cc);
    assert_eq!(lead_inbox[0].message.cc_original_to.as_deref(), Some("b1"));

    let direct = fixture.store.check_inbox(&builder).unwrap();
    assert_eq!(direct.len(), 1);
    assert!(!direct[0].message.is_cc);
}

#[test]
fn lead_traffic_is_not_cc_copied() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    fixture.fresh_context(&lead);
    fixture.agent("c1", AgentClass::Coder);

    let outcome = fixture.store.send(&lead, "c1", "direct order", &[]).unwrap();
    assert!(outcome.cc.is_empty());
}

// ============================================================================
// PURGE
// ============================================================================

#[test]
fn purge_removes_only_read_messages() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    fixture.fresh_context(&lead);
    let coder = fixture.agent("c1", AgentClass::Coder);

    fixture.store.send(&lead, "c1", "old read", &[]).unwrap();
    fixture.store.check_inbox(&coder).unwrap();
    fixture.store.send(&lead, "c1", "fresh unread", &[]).unwrap();

    // Zero-hour window: anything read is old enough.
    let purged = fixture.store.purge_inbox(&coder, 0).unwrap();
    assert_eq!(purged, 1);

    let inbox = fixture.store.check_inbox(&coder).unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].content, "fresh unread");
}

// ============================================================================
// SELF-NOTE
// ============================================================================

#[test]
fn self_note_is_deliverable() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    fixture.fresh_context(&lead);

    fixture.store.send(&lead, "commander", "note to self", &[]).unwrap();
    let inbox = fixture.store.check_inbox(&lead).unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].content, "note to self");
}
