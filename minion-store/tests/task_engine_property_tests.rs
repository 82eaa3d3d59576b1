//! Property-based tests for the task DAG engine.
//!
//! Covers the pull race, transition validity against the effective flow,
//! blocker gating, result-file gating, and the happy pull/complete path.

use minion_core::{AgentClass, MinionError, PreconditionError, RowIdType};
use minion_flow::FlowSet;
use minion_store::{CreateTask, TaskFilter, UpdateTask};
use minion_test_utils::TestStore;

fn seeded_task(fixture: &mut TestStore, slug: &str, class: AgentClass) -> minion_core::TaskId {
    let lead = minion_core::AgentName::from("commander");
    let spec = fixture.spec_file(slug);
    fixture
        .store
        .create_task(
            &lead,
            &CreateTask {
                title: format!("task {}", slug),
                task_file: spec.display().to_string(),
                class_required: Some(class),
                ..Default::default()
            },
        )
        .unwrap()
        .id
}

// ============================================================================
// HAPPY PATH (pull -> submit -> complete -> review -> close)
// ============================================================================

#[test]
fn pull_complete_review_close_runs_the_flow() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    let coder = fixture.agent("c1", AgentClass::Coder);
    let oracle = fixture.agent("o1", AgentClass::Oracle);
    let task = seeded_task(&mut fixture, "s1", AgentClass::Coder);

    // Coder pulls: open -> assigned -> in_progress, both edges audited.
    let pulled = fixture.store.pull_task(&coder, task).unwrap();
    assert_eq!(pulled.task.status, "in_progress");
    assert_eq!(pulled.task.assigned_to.as_ref().unwrap().as_str(), "c1");
    assert!(pulled.task_content.unwrap().contains("task s1"));

    let history = fixture.store.get_task_history(task).unwrap();
    let edges: Vec<(Option<&str>, &str)> = history
        .iter()
        .map(|h| (h.from_status.as_deref(), h.to_status.as_str()))
        .collect();
    assert_eq!(
        edges,
        vec![
            (None, "open"),
            (Some("open"), "assigned"),
            (Some("assigned"), "in_progress"),
        ]
    );

    // Result required before the fixed stage admits the task.
    let err = fixture.store.complete_phase(&coder, task, false).unwrap_err();
    assert!(matches!(
        err,
        MinionError::Precondition(PreconditionError::MissingResult { .. })
    ));

    let result = fixture.result_file("s1");
    fixture
        .store
        .submit_result(&coder, task, &result.display().to_string())
        .unwrap();

    // Complete: routed to fixed, assignment cleared for the reviewers.
    let done = fixture.store.complete_phase(&coder, task, false).unwrap();
    assert_eq!(done.to_status, "fixed");
    assert!(done.unassigned);
    assert!(done.task.assigned_to.is_none());
    assert!(done.eligible.contains(&AgentClass::Oracle));

    // Oracle pulls the review seat; the stage holds.
    let review = fixture.store.pull_task(&oracle, task).unwrap();
    assert_eq!(review.task.status, "fixed");
    assert_eq!(review.task.assigned_to.as_ref().unwrap().as_str(), "o1");

    let verified = fixture.store.complete_phase(&oracle, task, false).unwrap();
    assert_eq!(verified.to_status, "verified");

    let closed = fixture.store.close_task(&lead, task).unwrap();
    assert_eq!(closed.status, "closed");

    // Every audited row is an edge of the bugfix flow.
    let flow_set = FlowSet::builtin();
    let flow = flow_set.get("bugfix").unwrap();
    for row in fixture.store.get_task_history(task).unwrap() {
        assert!(
            flow.is_edge(row.from_status.as_deref(), &row.to_status),
            "history row {:?} -> {} is not a flow edge",
            row.from_status,
            row.to_status
        );
    }
}

// ============================================================================
// PULL RACE
// ============================================================================

#[test]
fn concurrent_pulls_have_exactly_one_winner() {
    let mut fixture = TestStore::new();
    fixture.lead_with_plan("commander");
    for i in 0..4 {
        fixture.agent(&format!("racer-{}", i), AgentClass::Coder);
    }
    let task = seeded_task(&mut fixture, "race", AgentClass::Coder);

    let barrier = std::sync::Arc::new(std::sync::Barrier::new(4));
    let mut handles = Vec::new();
    for i in 0..4 {
        let mut store = fixture.reopen();
        let barrier = barrier.clone();
        handles.push(std::thread::spawn(move || {
            let me = minion_core::AgentName::from(format!("racer-{}", i));
            barrier.wait();
            store.pull_task(&me, task)
        }));
    }

    let mut winners = 0;
    let mut losers = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(outcome) => {
                winners += 1;
                assert_eq!(outcome.task.status, "in_progress");
            }
            Err(MinionError::Precondition(PreconditionError::AlreadyPulled { .. })) => losers += 1,
            Err(other) => panic!("unexpected race outcome: {}", other),
        }
    }
    assert_eq!(winners, 1, "exactly one racer wins");
    assert_eq!(losers, 3);

    // Exactly one audited claim.
    let history = fixture.store.get_task_history(task).unwrap();
    let claims = history
        .iter()
        .filter(|h| h.to_status == "in_progress")
        .count();
    assert_eq!(claims, 1);
}

// ============================================================================
// GATES
// ============================================================================

#[test]
fn blocked_task_cannot_be_pulled_until_blocker_closes() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    let coder = fixture.agent("c1", AgentClass::Coder);
    let blocker = seeded_task(&mut fixture, "first", AgentClass::Coder);

    let spec = fixture.spec_file("second");
    let blocked = fixture
        .store
        .create_task(
            &lead,
            &CreateTask {
                title: "second".into(),
                task_file: spec.display().to_string(),
                class_required: Some(AgentClass::Coder),
                blocked_by: vec![blocker],
                ..Default::default()
            },
        )
        .unwrap()
        .id;

    let err = fixture.store.pull_task(&coder, blocked).unwrap_err();
    assert!(matches!(
        err,
        MinionError::Precondition(PreconditionError::BlockedBy { .. })
    ));

    // Run the blocker to closure, then the pull goes through.
    fixture.store.pull_task(&coder, blocker).unwrap();
    let result = fixture.result_file("first");
    fixture
        .store
        .submit_result(&coder, blocker, &result.display().to_string())
        .unwrap();
    fixture.store.complete_phase(&coder, blocker, false).unwrap();
    let oracle = fixture.agent("o1", AgentClass::Oracle);
    fixture.store.pull_task(&oracle, blocker).unwrap();
    fixture.store.complete_phase(&oracle, blocker, false).unwrap();
    fixture.store.close_task(&lead, blocker).unwrap();

    fixture.store.pull_task(&coder, blocked).unwrap();
}

#[test]
fn close_without_result_is_rejected() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    let coder = fixture.agent("c1", AgentClass::Coder);
    let task = seeded_task(&mut fixture, "noresult", AgentClass::Coder);
    fixture.store.pull_task(&coder, task).unwrap();

    let err = fixture.store.close_task(&lead, task).unwrap_err();
    assert!(matches!(
        err,
        MinionError::Precondition(PreconditionError::MissingResult { .. })
    ));
}

#[test]
fn close_requires_an_edge_into_the_terminal_stage() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    let coder = fixture.agent("c1", AgentClass::Coder);
    let task = seeded_task(&mut fixture, "early-close", AgentClass::Coder);
    fixture.store.pull_task(&coder, task).unwrap();
    let result = fixture.result_file("early-close");
    fixture
        .store
        .submit_result(&coder, task, &result.display().to_string())
        .unwrap();

    // in_progress has no edge to closed.
    let err = fixture.store.close_task(&lead, task).unwrap_err();
    assert!(matches!(
        err,
        MinionError::Precondition(PreconditionError::InvalidTransition { .. })
    ));
}

#[test]
fn wrong_class_cannot_pull_and_cannot_review() {
    let mut fixture = TestStore::new();
    fixture.lead_with_plan("commander");
    let recon = fixture.agent("r1", AgentClass::Recon);
    let coder = fixture.agent("c1", AgentClass::Coder);
    let task = seeded_task(&mut fixture, "classed", AgentClass::Coder);

    let err = fixture.store.pull_task(&recon, task).unwrap_err();
    assert!(matches!(
        err,
        MinionError::Precondition(PreconditionError::WorkerClassMismatch { .. })
    ));

    // Drive to review, then a coder may not take the review seat.
    fixture.store.pull_task(&coder, task).unwrap();
    let result = fixture.result_file("classed");
    fixture
        .store
        .submit_result(&coder, task, &result.display().to_string())
        .unwrap();
    fixture.store.complete_phase(&coder, task, false).unwrap();

    let coder2 = fixture.agent("c2", AgentClass::Coder);
    let err = fixture.store.pull_task(&coder2, task).unwrap_err();
    assert!(matches!(
        err,
        MinionError::Precondition(PreconditionError::WorkerClassMismatch { .. })
    ));
}

#[test]
fn failed_review_routes_back_to_in_progress() {
    let mut fixture = TestStore::new();
    fixture.lead_with_plan("commander");
    let coder = fixture.agent("c1", AgentClass::Coder);
    let oracle = fixture.agent("o1", AgentClass::Oracle);
    let task = seeded_task(&mut fixture, "bounce", AgentClass::Coder);

    fixture.store.pull_task(&coder, task).unwrap();
    let result = fixture.result_file("bounce");
    fixture
        .store
        .submit_result(&coder, task, &result.display().to_string())
        .unwrap();
    fixture.store.complete_phase(&coder, task, false).unwrap();
    fixture.store.pull_task(&oracle, task).unwrap();

    let bounced = fixture.store.complete_phase(&oracle, task, true).unwrap();
    assert_eq!(bounced.to_status, "in_progress");
    // The review seat is not eligible for the work stage; the task returns
    // to the pool.
    assert!(bounced.unassigned);
}

// ============================================================================
// UPDATE / REOPEN
// ============================================================================

#[test]
fn update_task_cannot_move_stages() {
    let mut fixture = TestStore::new();
    fixture.lead_with_plan("commander");
    let coder = fixture.agent("c1", AgentClass::Coder);
    let task = seeded_task(&mut fixture, "upd", AgentClass::Coder);
    fixture.store.pull_task(&coder, task).unwrap();

    let err = fixture
        .store
        .update_task(
            &coder,
            task,
            &UpdateTask {
                status: Some("fixed".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(
        err,
        MinionError::Precondition(PreconditionError::InvalidTransition { .. })
    ));

    // Progress within the stage is fine and bumps activity.
    let ok = fixture
        .store
        .update_task(
            &coder,
            task,
            &UpdateTask {
                progress: Some("half done".into()),
                status: Some("in_progress".into()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(ok.task.progress.as_deref(), Some("half done"));
    assert_eq!(ok.task.status, "in_progress");
}

#[test]
fn activity_counter_warns_when_the_fight_drags() {
    let mut fixture = TestStore::new();
    fixture.lead_with_plan("commander");
    let coder = fixture.agent("c1", AgentClass::Coder);
    let task = seeded_task(&mut fixture, "drag", AgentClass::Coder);
    fixture.store.pull_task(&coder, task).unwrap();

    let mut warned = false;
    for i in 0..4 {
        let outcome = fixture
            .store
            .update_task(
                &coder,
                task,
                &UpdateTask {
                    progress: Some(format!("round {}", i)),
                    ..Default::default()
                },
            )
            .unwrap();
        warned = outcome.warnings.iter().any(|w| w.contains("dragging"));
    }
    assert!(warned, "drag warning fires once activity reaches the threshold");
}

#[test]
fn reopen_returns_terminal_task_to_an_earlier_stage() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    let coder = fixture.agent("c1", AgentClass::Coder);
    let oracle = fixture.agent("o1", AgentClass::Oracle);
    let task = seeded_task(&mut fixture, "reopen", AgentClass::Coder);

    fixture.store.pull_task(&coder, task).unwrap();
    let result = fixture.result_file("reopen");
    fixture
        .store
        .submit_result(&coder, task, &result.display().to_string())
        .unwrap();
    fixture.store.complete_phase(&coder, task, false).unwrap();
    fixture.store.pull_task(&oracle, task).unwrap();
    fixture.store.complete_phase(&oracle, task, false).unwrap();
    fixture.store.close_task(&lead, task).unwrap();

    let reopened = fixture.store.reopen_task(&lead, task, "assigned").unwrap();
    assert_eq!(reopened.status, "assigned");
    assert!(reopened.assigned_to.is_none());

    // Reopen is refused for non-terminal tasks and terminal targets.
    assert!(fixture.store.reopen_task(&lead, task, "closed").is_err());
}

#[test]
fn lineage_reports_visited_stages_in_order() {
    let mut fixture = TestStore::new();
    fixture.lead_with_plan("commander");
    let coder = fixture.agent("c1", AgentClass::Coder);
    let task = seeded_task(&mut fixture, "lineage", AgentClass::Coder);
    fixture.store.pull_task(&coder, task).unwrap();

    let lineage = fixture.store.task_lineage(task).unwrap();
    assert_eq!(lineage.flow_type, "bugfix");
    assert_eq!(
        lineage.stages,
        vec!["open", "assigned", "in_progress", "fixed", "verified", "closed"]
    );
    assert_eq!(lineage.visited, vec!["open", "assigned", "in_progress"]);
}

// ============================================================================
// LIST / FILTERS
// ============================================================================

#[test]
fn list_excludes_closed_by_default() {
    let mut fixture = TestStore::new();
    let lead = fixture.lead_with_plan("commander");
    let coder = fixture.agent("c1", AgentClass::Coder);
    let oracle = fixture.agent("o1", AgentClass::Oracle);
    let open_task = seeded_task(&mut fixture, "stays", AgentClass::Coder);
    let closing = seeded_task(&mut fixture, "goes", AgentClass::Coder);

    fixture.store.pull_task(&coder, closing).unwrap();
    let result = fixture.result_file("goes");
    fixture
        .store
        .submit_result(&coder, closing, &result.display().to_string())
        .unwrap();
    fixture.store.complete_phase(&coder, closing, false).unwrap();
    fixture.store.pull_task(&oracle, closing).unwrap();
    fixture.store.complete_phase(&oracle, closing, false).unwrap();
    fixture.store.close_task(&lead, closing).unwrap();

    let listed = fixture.store.list_tasks(&TaskFilter::default()).unwrap();
    let ids: Vec<i64> = listed.iter().map(|t| t.id.as_i64()).collect();
    assert!(ids.contains(&open_task.as_i64()));
    assert!(!ids.contains(&closing.as_i64()));

    let closed_only = fixture
        .store
        .list_tasks(&TaskFilter {
            status: Some("closed".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(closed_only.len(), 1);
}
