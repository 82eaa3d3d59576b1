//! Property-based tests for the file claim service.
//!
//! Covers holder uniqueness, FIFO waitlist handoff, idempotent re-claims,
//! forced release, and claim cleanup on deregister.

use minion_core::{AgentClass, MinionError, PreconditionError};
use minion_store::ClaimOutcome;
use minion_test_utils::TestStore;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

#[test]
fn claim_release_round_trip_leaves_no_state() {
    let mut fixture = TestStore::new();
    let coder = fixture.agent("c1", AgentClass::Coder);

    let granted = fixture.store.claim_file(&coder, "src/lib.rs").unwrap();
    assert!(matches!(granted, ClaimOutcome::Granted { refreshed: false, .. }));

    let released = fixture.store.release_file(&coder, "src/lib.rs", false).unwrap();
    assert!(released.handed_to.is_none());

    let (claims, waitlist) = fixture.store.list_claims().unwrap();
    assert!(claims.is_empty());
    assert!(waitlist.is_empty());
}

#[test]
fn reclaim_by_holder_is_idempotent() {
    let mut fixture = TestStore::new();
    let coder = fixture.agent("c1", AgentClass::Coder);

    fixture.store.claim_file(&coder, "src/lib.rs").unwrap();
    let again = fixture.store.claim_file(&coder, "src/lib.rs").unwrap();
    assert!(matches!(again, ClaimOutcome::Granted { refreshed: true, .. }));

    let (claims, _) = fixture.store.list_claims().unwrap();
    assert_eq!(claims.len(), 1);
}

#[test]
fn second_claimant_waits_with_position() {
    let mut fixture = TestStore::new();
    let a = fixture.agent("a1", AgentClass::Coder);
    let b = fixture.agent("b1", AgentClass::Builder);

    fixture.store.claim_file(&a, "notes.md").unwrap();
    let waited = fixture.store.claim_file(&b, "notes.md").unwrap();
    match waited {
        ClaimOutcome::Waitlisted { holder, position, .. } => {
            assert_eq!(holder.as_str(), "a1");
            assert_eq!(position, 1);
        }
        other => panic!("expected waitlist, got {:?}", other),
    }

    // Release hands the claim to the head with a fresh acquisition time.
    let released = fixture.store.release_file(&a, "notes.md", false).unwrap();
    assert_eq!(released.handed_to.as_ref().unwrap().as_str(), "b1");

    let (claims, waitlist) = fixture.store.list_claims().unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].holder.as_str(), "b1");
    assert!(waitlist.is_empty());

    // Final release empties the table.
    fixture.store.release_file(&b, "notes.md", false).unwrap();
    let (claims, _) = fixture.store.list_claims().unwrap();
    assert!(claims.is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// After any chain of releases, the holder is always the earliest
    /// enqueued waiter, and there is never more than one holder.
    #[test]
    fn waitlist_hands_off_in_fifo_order(waiters in 2usize..6) {
        let mut fixture = TestStore::new();
        let first = fixture.agent("w-0", AgentClass::Coder);
        fixture.store.claim_file(&first, "hot.rs").unwrap();

        let mut queue = Vec::new();
        for i in 1..=waiters {
            let w = fixture.agent(&format!("w-{}", i), AgentClass::Coder);
            let outcome = fixture.store.claim_file(&w, "hot.rs").unwrap();
            match outcome {
                ClaimOutcome::Waitlisted { position, .. } => prop_assert_eq!(position, i),
                other => return Err(TestCaseError::fail(format!("expected waitlist: {:?}", other))),
            }
            queue.push(w);
        }

        // Drain: each release promotes exactly the next in line.
        let mut current = first;
        for expected in queue {
            let released = fixture.store.release_file(&current, "hot.rs", false).unwrap();
            let next = released.handed_to.expect("head promoted");
            prop_assert_eq!(next.as_str(), expected.as_str());

            let (claims, _) = fixture.store.list_claims().unwrap();
            prop_assert_eq!(claims.len(), 1);
            prop_assert_eq!(claims[0].holder.as_str(), expected.as_str());
            current = expected;
        }

        fixture.store.release_file(&current, "hot.rs", false).unwrap();
        let (claims, waitlist) = fixture.store.list_claims().unwrap();
        prop_assert!(claims.is_empty());
        prop_assert!(waitlist.is_empty());
    }
}

#[test]
fn non_holder_cannot_release_without_lead_force() {
    let mut fixture = TestStore::new();
    let lead = fixture.agent("commander", AgentClass::Lead);
    let a = fixture.agent("a1", AgentClass::Coder);
    let b = fixture.agent("b1", AgentClass::Coder);

    fixture.store.claim_file(&a, "guarded.rs").unwrap();

    let err = fixture.store.release_file(&b, "guarded.rs", false).unwrap_err();
    assert!(matches!(
        err,
        MinionError::Precondition(PreconditionError::ClaimHeld { .. })
    ));
    // Force without manage is still refused.
    let err = fixture.store.release_file(&b, "guarded.rs", true).unwrap_err();
    assert!(matches!(err, MinionError::Precondition(_)));

    // Lead force-release is the one break in cooperative discipline.
    let released = fixture.store.release_file(&lead, "guarded.rs", true).unwrap();
    assert!(released.forced);
    assert_eq!(released.was_held_by.as_str(), "a1");
}

#[test]
fn deregister_hands_claims_to_waiters() {
    let mut fixture = TestStore::new();
    let a = fixture.agent("a1", AgentClass::Coder);
    let b = fixture.agent("b1", AgentClass::Coder);

    fixture.store.claim_file(&a, "x.rs").unwrap();
    fixture.store.claim_file(&b, "x.rs").unwrap();
    // The departing agent also queued behind someone else's claim.
    fixture.store.claim_file(&b, "y.rs").unwrap();
    fixture.store.claim_file(&a, "y.rs").unwrap();

    let released = fixture.store.deregister(&a).unwrap();
    assert_eq!(released, vec!["x.rs".to_string()]);

    let (claims, waitlist) = fixture.store.list_claims().unwrap();
    // x.rs handed to b; y.rs still held by b; a is gone from every waitlist.
    assert_eq!(claims.len(), 2);
    assert!(claims.iter().all(|c| c.holder.as_str() == "b1"));
    assert!(waitlist.iter().all(|w| w.agent.as_str() != "a1"));
}

#[test]
fn claims_key_on_the_normalized_path() {
    let mut fixture = TestStore::new();
    let a = fixture.agent("a1", AgentClass::Coder);
    let b = fixture.agent("b1", AgentClass::Coder);

    fixture.store.claim_file(&a, "src//main.rs").unwrap();
    let outcome = fixture.store.claim_file(&b, "src/main.rs").unwrap();
    assert!(matches!(outcome, ClaimOutcome::Waitlisted { .. }));
}
