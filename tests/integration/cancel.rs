//! Cooperative cancellation tests.

use std::time::Duration;

use ralph::core::task::{TaskId, TaskStatus};
use ralph::orchestration::runner::cancel_wave;
use ralph::orchestration::WaveEvent;
use ralph::state::{WavePaths, WaveState};
use ralph::Error;

use crate::fixtures::{ids, Harness};

#[tokio::test]
async fn test_cancelled_token_dispatches_nothing() {
    let harness = Harness::new(2, 3);
    harness.add_task("T1", &[]).await;
    harness.add_task("T2", &[]).await;
    let runner = harness.runner();
    runner.cancellation_token().cancel();

    let wave_id = runner.start(&ids(&["T1", "T2"]), None, None).await.unwrap();

    let record = harness.record(&wave_id);
    assert_eq!(record.state, WaveState::Cancelled);
    assert!(record
        .tasks
        .values()
        .all(|e| e.status == TaskStatus::Pending && e.attempts.is_empty()));
    assert!(harness.backend.calls().is_empty());

    // A fresh runner picks the wave up where it stopped.
    let state = harness.runner().resume(&wave_id).await.unwrap();
    assert_eq!(state, WaveState::Complete);
}

#[tokio::test]
async fn test_cancel_marker_stops_next_batch() {
    let harness = Harness::with_delay(1, 3, Duration::from_millis(150));
    for id in ["T1", "T2", "T3"] {
        harness.add_task(id, &[]).await;
    }
    let (runner, mut rx) = harness.runner_with_events();
    let handle = tokio::spawn(async move {
        runner
            .start(&ids(&["T1", "T2", "T3"]), None, Some("stopme"))
            .await
    });

    loop {
        match rx.recv().await {
            Some(WaveEvent::AttemptStarted { .. }) => break,
            Some(_) => continue,
            None => panic!("wave ended before any attempt started"),
        }
    }
    let state = cancel_wave(&harness.config, "stopme").await.unwrap();
    assert_eq!(state, WaveState::Cancelled);
    assert!(WavePaths::new(&harness.run_dir(), "stopme")
        .cancel_marker()
        .exists());

    handle.await.unwrap().unwrap();

    let record = harness.record("stopme");
    assert_eq!(record.state, WaveState::Cancelled);
    // The in-flight attempt was allowed to finish.
    assert_eq!(record.status_of(&"T1".into()), Some(TaskStatus::Complete));
    assert_eq!(record.status_of(&"T2".into()), Some(TaskStatus::Pending));
    assert_eq!(record.status_of(&"T3".into()), Some(TaskStatus::Pending));

    let state = harness.runner().resume("stopme").await.unwrap();
    assert_eq!(state, WaveState::Complete);
    assert!(!WavePaths::new(&harness.run_dir(), "stopme")
        .cancel_marker()
        .exists());
    let record = harness.record("stopme");
    assert_eq!(record.tasks[&TaskId::from("T2")].attempt_count, 1);
}

#[tokio::test]
async fn test_cancel_of_finished_wave_changes_nothing() {
    let harness = Harness::new(1, 3);
    harness.add_task("T1", &[]).await;
    let runner = harness.runner();
    let wave_id = runner.start(&ids(&["T1"]), None, None).await.unwrap();

    let state = runner.cancel(&wave_id).await.unwrap();

    assert_eq!(state, WaveState::Complete);
    assert_eq!(harness.record(&wave_id).state, WaveState::Complete);
    assert!(!WavePaths::new(&harness.run_dir(), &wave_id)
        .cancel_marker()
        .exists());
}

#[tokio::test]
async fn test_cancel_unknown_wave() {
    let harness = Harness::new(1, 1);
    match cancel_wave(&harness.config, "ghost").await {
        Err(Error::WaveNotFound(id)) => assert_eq!(id, "ghost"),
        other => panic!("expected WaveNotFound, got {:?}", other),
    }
}
