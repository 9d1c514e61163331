//! End-to-end wave scenarios.
//!
//! Each test builds tasks in a file store, runs a wave against a scripted
//! backend in a temp repository, and checks the ledger afterwards.

use std::sync::Arc;
use std::time::Duration;

use ralph::config::AgentRole;
use ralph::core::attempt::Signal;
use ralph::core::task::{TaskId, TaskStatus};
use ralph::error::ErrorKind;
use ralph::orchestration::lease::LeaseManager;
use ralph::orchestration::WaveEvent;
use ralph::state::{WavePaths, WaveState};
use ralph::Error;

use crate::fixtures::{drain, ids, Harness, Reply};

/// Scenario A: three independent tasks, two workers.
#[tokio::test]
async fn test_independent_tasks_respect_max_parallel() {
    let harness = Harness::with_delay(2, 3, Duration::from_millis(100));
    for id in ["T1", "T2", "T3"] {
        harness.add_task(id, &[]).await;
    }
    let (runner, mut rx) = harness.runner_with_events();

    let schedule = runner.plan(&ids(&["T1", "T2", "T3"])).await.unwrap();
    assert_eq!(schedule.layers.len(), 1);
    assert_eq!(schedule.layers[0].tasks, ids(&["T1", "T2", "T3"]));

    let wave_id = runner
        .start(&ids(&["T1", "T2", "T3"]), None, None)
        .await
        .unwrap();

    let record = harness.record(&wave_id);
    assert_eq!(record.state, WaveState::Complete);
    assert!(record.all_complete());
    assert_eq!(harness.backend.max_active(), 2);

    let batches: Vec<Vec<TaskId>> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            WaveEvent::BatchDispatched { tasks, .. } => Some(tasks),
            _ => None,
        })
        .collect();
    assert_eq!(batches, vec![ids(&["T1", "T2"]), ids(&["T3"])]);
}

/// Scenario B: three layers, everything completes, nothing left on disk.
#[tokio::test]
async fn test_layered_wave_completes_and_cleans_up() {
    let harness = Harness::new(3, 3);
    harness.add_task("T1", &[]).await;
    harness.add_task("T2", &[]).await;
    harness.add_task("T3", &[]).await;
    harness.add_task("T4", &["T1"]).await;
    harness.add_task("T5", &["T2"]).await;
    harness.add_task("T6", &["T3"]).await;
    harness.add_task("T7", &["T4"]).await;
    harness.add_task("T8", &["T5"]).await;
    let all = ids(&["T1", "T2", "T3", "T4", "T5", "T6", "T7", "T8"]);
    let runner = harness.runner();

    let schedule = runner.plan(&all).await.unwrap();
    let layers: Vec<Vec<TaskId>> = schedule.layers.iter().map(|l| l.tasks.clone()).collect();
    assert_eq!(
        layers,
        vec![
            ids(&["T1", "T2", "T3"]),
            ids(&["T4", "T5", "T6"]),
            ids(&["T7", "T8"])
        ]
    );

    let wave_id = runner.start(&all, None, Some("layered")).await.unwrap();
    assert_eq!(wave_id, "layered");

    let record = harness.record(&wave_id);
    assert_eq!(record.state, WaveState::Complete);
    for entry in record.tasks.values() {
        assert_eq!(entry.status, TaskStatus::Complete, "{}", entry.task.id);
        assert_eq!(entry.attempt_count, 1);
    }
    assert!(harness.remaining_workspaces().is_empty());

    // A dependent's work starts only after its dependency's reviewer approved.
    let calls = harness.backend.calls();
    let t1_review = calls
        .iter()
        .position(|c| c.task == "T1" && c.role == AgentRole::Reviewer)
        .unwrap();
    let t4_start = calls.iter().position(|c| c.task == "T4").unwrap();
    assert!(t1_review < t4_start);

    // Approved tasks are closed in the tracker.
    let records = harness.store.records().await.unwrap();
    assert!(records.iter().all(|r| r.task.status == TaskStatus::Complete));
    assert!(records.iter().all(|r| r.close_reason.is_some()));
}

/// Scenario C: two revisions, then approval on the last allowed attempt.
#[tokio::test]
async fn test_revisions_then_approval() {
    let harness = Harness::new(1, 3);
    harness.add_task("T1", &[]).await;
    harness.backend.script_reviews(
        "T1",
        vec![
            Reply::text("REVISION_REQUIRED\nMissing error handling."),
            Reply::text("**Revision required**\nStill no tests."),
            Reply::text("APPROVED"),
        ],
    );

    let wave_id = harness
        .runner()
        .start(&ids(&["T1"]), None, None)
        .await
        .unwrap();

    let record = harness.record(&wave_id);
    let entry = &record.tasks[&TaskId::from("T1")];
    assert_eq!(entry.status, TaskStatus::Complete);
    assert_eq!(entry.attempt_count, 3);
    assert_eq!(entry.attempts.len(), 3);

    let numbers: Vec<u32> = entry.attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    let signals: Vec<Option<Signal>> = entry.attempts.iter().map(|a| a.signal).collect();
    assert_eq!(
        signals,
        vec![
            Some(Signal::RevisionRequired),
            Some(Signal::RevisionRequired),
            Some(Signal::Approved)
        ]
    );

    // Each revision builds on the previous attempt's commit.
    assert_eq!(entry.attempts[1].before_commit, entry.attempts[0].after_commit);
    assert_eq!(entry.attempts[2].before_commit, entry.attempts[1].after_commit);

    // Reviewer feedback reaches the next implementer prompt.
    let implementer: Vec<_> = harness
        .backend
        .calls_for("T1")
        .into_iter()
        .filter(|c| c.role == AgentRole::Implementer)
        .collect();
    assert_eq!(implementer.len(), 3);
    assert!(implementer[1].prompt.contains("Missing error handling."));
    assert!(implementer[2].prompt.contains("Still no tests."));

    assert!(harness.remaining_workspaces().is_empty());
}

/// Scenario D: an unrecognized verdict fails the task at once.
#[tokio::test]
async fn test_ambiguous_signal_fails_immediately() {
    let harness = Harness::new(1, 3);
    harness.add_task("T1", &[]).await;
    harness
        .backend
        .script_reviews("T1", vec![Reply::text("Mostly fine, I guess?")]);

    let wave_id = harness
        .runner()
        .start(&ids(&["T1"]), None, None)
        .await
        .unwrap();

    let record = harness.record(&wave_id);
    assert_eq!(record.state, WaveState::Aborted);
    let entry = &record.tasks[&TaskId::from("T1")];
    assert_eq!(entry.status, TaskStatus::Failed);
    assert_eq!(entry.last_error, Some(ErrorKind::AmbiguousSignal));
    assert_eq!(entry.attempts.len(), 1);
    assert_eq!(entry.attempts[0].signal, Some(Signal::Unknown));
    assert_eq!(entry.attempts[0].error, Some(ErrorKind::AmbiguousSignal));
    assert_eq!(
        entry.attempts[0].reviewer_output.as_deref(),
        Some("Mostly fine, I guess?")
    );
    assert_eq!(harness.backend.calls_for("T1").len(), 2);

    // The failed attempt's checkout is kept for inspection.
    let workspace = entry.attempts[0].workspace.clone().unwrap();
    assert!(workspace.exists());
    assert_eq!(harness.remaining_workspaces(), vec![workspace]);
}

/// Scenario E: a cycle is rejected before anything is written.
#[tokio::test]
async fn test_cycle_rejected_before_dispatch() {
    let harness = Harness::new(2, 3);
    harness.add_task("A", &["C"]).await;
    harness.add_task("B", &["A"]).await;
    harness.add_task("C", &["B"]).await;

    let result = harness
        .runner()
        .start(&ids(&["A", "B", "C"]), None, Some("cyclic"))
        .await;
    match result {
        Err(Error::CycleDetected { tasks }) => assert_eq!(tasks, vec!["A", "B", "C"]),
        other => panic!("expected CycleDetected, got {:?}", other),
    }

    assert!(!WavePaths::new(&harness.run_dir(), "cyclic").dir().exists());
    assert!(harness.remaining_workspaces().is_empty());
    assert!(harness.backend.calls().is_empty());
    let records = harness.store.records().await.unwrap();
    assert!(records.iter().all(|r| r.task.status == TaskStatus::Pending));
}

#[tokio::test]
async fn test_unknown_dependency_rejected() {
    let harness = Harness::new(2, 3);
    harness.add_task("T1", &[]).await;
    harness.add_task("T2", &["T9"]).await;

    let result = harness
        .runner()
        .start(&ids(&["T1", "T2"]), None, Some("missing"))
        .await;
    match result {
        Err(Error::UnknownDependency { task, missing }) => {
            assert_eq!(task, "T2");
            assert_eq!(missing, "T9");
        }
        other => panic!("expected UnknownDependency, got {:?}", other),
    }
    assert!(!WavePaths::new(&harness.run_dir(), "missing").dir().exists());
}

#[tokio::test]
async fn test_failure_blocks_transitive_dependents_only() {
    let harness = Harness::new(2, 3);
    harness.add_task("T1", &[]).await;
    harness.add_task("T2", &["T1"]).await;
    harness.add_task("T3", &["T2"]).await;
    harness.add_task("T4", &[]).await;
    harness.add_task("T5", &["T4"]).await;
    harness
        .backend
        .script_reviews("T1", vec![Reply::text("no idea")]);

    let runner = harness.runner();
    let wave_id = runner
        .start(&ids(&["T1", "T2", "T3", "T4", "T5"]), None, None)
        .await
        .unwrap();

    let record = harness.record(&wave_id);
    assert_eq!(record.state, WaveState::Aborted);
    assert_eq!(record.status_of(&"T1".into()), Some(TaskStatus::Failed));
    assert_eq!(record.status_of(&"T2".into()), Some(TaskStatus::Blocked));
    assert_eq!(record.status_of(&"T3".into()), Some(TaskStatus::Blocked));
    assert_eq!(record.status_of(&"T4".into()), Some(TaskStatus::Complete));
    assert_eq!(record.status_of(&"T5".into()), Some(TaskStatus::Complete));
    assert!(harness.backend.calls_for("T2").is_empty());
    assert!(harness.backend.calls_for("T3").is_empty());

    let status = runner.status(&wave_id).unwrap();
    let failures: Vec<(&str, Option<ErrorKind>)> = status
        .failures
        .iter()
        .map(|t| (t.id.as_str(), t.last_error))
        .collect();
    assert_eq!(
        failures,
        vec![
            ("T1", Some(ErrorKind::AmbiguousSignal)),
            ("T2", Some(ErrorKind::DependencyFailed)),
            ("T3", Some(ErrorKind::DependencyFailed)),
        ]
    );

    // Problems are pushed back to the tracker with their error kind.
    let records = harness.store.records().await.unwrap();
    let t1 = records.iter().find(|r| r.task.id.as_str() == "T1").unwrap();
    assert!(t1.notes.as_deref().unwrap().contains("ambiguous_signal"));
}

#[tokio::test]
async fn test_retry_exhausted_keeps_last_workspace() {
    let harness = Harness::new(1, 2);
    harness.add_task("T1", &[]).await;
    harness.backend.script_reviews(
        "T1",
        vec![
            Reply::text("REVISION_REQUIRED\nnope"),
            Reply::text("REVISION_REQUIRED\nstill nope"),
        ],
    );

    let wave_id = harness
        .runner()
        .start(&ids(&["T1"]), None, None)
        .await
        .unwrap();

    let record = harness.record(&wave_id);
    let entry = &record.tasks[&TaskId::from("T1")];
    assert_eq!(entry.status, TaskStatus::Failed);
    assert_eq!(entry.last_error, Some(ErrorKind::RetryExhausted));
    assert_eq!(entry.attempt_count, 2);
    let last = entry.attempts[1].workspace.clone().unwrap();
    assert!(last.exists());
}

#[tokio::test]
async fn test_agent_timeout_consumes_an_attempt() {
    let harness = Harness::new(1, 3);
    harness.add_task("T1", &[]).await;
    harness
        .backend
        .script_implementations("T1", vec![Reply::Timeout]);

    let wave_id = harness
        .runner()
        .start(&ids(&["T1"]), None, None)
        .await
        .unwrap();

    let record = harness.record(&wave_id);
    let entry = &record.tasks[&TaskId::from("T1")];
    assert_eq!(entry.status, TaskStatus::Complete);
    assert_eq!(entry.attempt_count, 2);
    assert_eq!(entry.attempts[0].error, Some(ErrorKind::AgentTimeout));
    assert_eq!(entry.attempts[1].signal, Some(Signal::Approved));
}

#[tokio::test]
async fn test_transport_error_on_last_attempt_fails_task() {
    let harness = Harness::new(1, 1);
    harness.add_task("T1", &[]).await;
    harness
        .backend
        .script_reviews("T1", vec![Reply::Transport]);

    let wave_id = harness
        .runner()
        .start(&ids(&["T1"]), None, None)
        .await
        .unwrap();

    let record = harness.record(&wave_id);
    let entry = &record.tasks[&TaskId::from("T1")];
    assert_eq!(entry.status, TaskStatus::Failed);
    assert_eq!(entry.last_error, Some(ErrorKind::AgentTransportError));
    // The implementer's commit was still recorded.
    assert!(entry.attempts[0].after_commit.is_some());
}

#[tokio::test]
async fn test_held_lease_fails_task_without_attempt() {
    let harness = Harness::new(1, 3);
    harness.add_task("T1", &[]).await;
    let paths = WavePaths::new(&harness.run_dir(), "contended");
    let held = LeaseManager::new(&paths.lease_dir())
        .acquire(&"T1".into(), 1)
        .unwrap();

    let wave_id = harness
        .runner()
        .start(&ids(&["T1"]), None, Some("contended"))
        .await
        .unwrap();

    let record = harness.record(&wave_id);
    let entry = &record.tasks[&TaskId::from("T1")];
    assert_eq!(entry.status, TaskStatus::Failed);
    assert_eq!(entry.last_error, Some(ErrorKind::LeaseContention));
    assert_eq!(entry.attempt_count, 0);
    assert!(entry.attempts.is_empty());
    assert!(harness.backend.calls().is_empty());
    assert_eq!(held.holder_pid, std::process::id());
}

#[tokio::test]
async fn test_saturation_fails_task_without_attempt() {
    let mut harness = Harness::with_delay(1, 3, Duration::from_millis(400));
    harness.config.run.max_live_workers = 1;
    harness.add_task("T1", &[]).await;
    harness.add_task("T2", &[]).await;
    let runner = Arc::new(harness.runner());

    let first = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.start(&ids(&["T1"]), None, Some("first")).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    runner
        .start(&ids(&["T2"]), None, Some("second"))
        .await
        .unwrap();
    first.await.unwrap().unwrap();

    assert_eq!(harness.record("first").state, WaveState::Complete);
    let second = harness.record("second");
    let entry = &second.tasks[&TaskId::from("T2")];
    assert_eq!(entry.status, TaskStatus::Failed);
    assert_eq!(entry.last_error, Some(ErrorKind::SaturationExceeded));
    assert!(entry.attempts.is_empty());
}

fn branch_tip(harness: &Harness, branch: &str) -> String {
    let repo = git2::Repository::open(&harness.repo.path).unwrap();
    let tip = repo
        .find_branch(branch, git2::BranchType::Local)
        .unwrap()
        .get()
        .peel_to_commit()
        .unwrap()
        .id()
        .to_string();
    tip
}

/// `a/b` and `a-b` clean up to the same characters but are different tasks.
async fn run_lookalike_ids(max_parallel: usize) {
    let harness = Harness::new(max_parallel, 3);
    harness.add_task("a/b", &[]).await;
    harness.add_task("a-b", &[]).await;

    let runner = harness.runner();
    let wave_id = runner
        .start(&ids(&["a/b", "a-b"]), None, None)
        .await
        .unwrap();

    let record = harness.record(&wave_id);
    assert_eq!(record.state, WaveState::Complete);
    let slash = &record.tasks[&TaskId::from("a/b")];
    let dash = &record.tasks[&TaskId::from("a-b")];
    assert_eq!(slash.attempt_count, 1);
    assert_eq!(dash.attempt_count, 1);

    let slash_branch = slash.attempts[0].branch.clone().unwrap();
    let dash_branch = dash.attempts[0].branch.clone().unwrap();
    assert_ne!(slash_branch, dash_branch);
    assert_eq!(
        Some(branch_tip(&harness, &slash_branch)),
        slash.attempts[0].after_commit
    );
    assert_eq!(
        Some(branch_tip(&harness, &dash_branch)),
        dash.attempts[0].after_commit
    );
    assert_eq!(harness.backend.calls_for("a/b").len(), 2);
    assert_eq!(harness.backend.calls_for("a-b").len(), 2);
}

#[tokio::test]
async fn test_lookalike_ids_run_side_by_side() {
    run_lookalike_ids(2).await;
}

#[tokio::test]
async fn test_lookalike_ids_keep_their_own_branches() {
    run_lookalike_ids(1).await;
}
