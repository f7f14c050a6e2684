#[path = "../common/mod.rs"]
mod common;

use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde_json::json;

use common::{attached, collect_until_closed, stderr_text, submit, Activity, CRASH_EXIT_CODE};
use workerlink::worker::{CommandOptions, CommandOutcome, DiagnosticSource, WorkerError};

#[tokio::test(start_paused = true)]
async fn test_queued_commands_start_in_fifo_order() {
    let activity = Activity::new();
    let dispatcher = attached(1, &activity);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut receivers = Vec::new();
    for (label, payload) in [
        ("a", json!({"delay_ms": 1000})),
        ("b", json!("b")),
        ("c", json!("c")),
    ] {
        let order = Arc::clone(&order);
        let (tx, rx) = tokio::sync::oneshot::channel();
        dispatcher
            .execute_with(payload, CommandOptions::new(), move |outcome| {
                order.lock().unwrap().push(label);
                let _ = tx.send(outcome);
            })
            .unwrap();
        receivers.push(rx);
    }

    for rx in receivers {
        assert!(rx.await.unwrap().is_ok());
    }
    assert_eq!(*order.lock().unwrap(), ["a", "b", "c"]);
    assert_eq!(activity.peak(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_responses_are_correlated_by_id() {
    let activity = Activity::new();
    let dispatcher = attached(2, &activity);

    let slow = submit(&dispatcher, json!({"delay_ms": 200, "n": 1}), CommandOptions::new());
    let fast = submit(&dispatcher, json!({"delay_ms": 10, "n": 2}), CommandOptions::new());

    // The later command finishes first; each still gets its own data.
    let fast = fast.await.unwrap();
    assert_eq!(fast.data(), Some(&json!({"delay_ms": 10, "n": 2})));
    let slow = slow.await.unwrap();
    assert_eq!(slow.data(), Some(&json!({"delay_ms": 200, "n": 1})));
}

#[tokio::test(start_paused = true)]
async fn test_command_times_out() {
    let activity = Activity::new();
    let dispatcher = attached(4, &activity);

    let outcome = dispatcher
        .execute(
            json!({"delay_ms": 1000}),
            CommandOptions::new().with_timeout_secs(0.5),
        )
        .await
        .unwrap();
    assert!(outcome.is_timeout());
    assert_eq!(outcome.data(), None);

    // The late answer is dropped and the worker keeps serving.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    let outcome = dispatcher
        .execute(json!("after"), CommandOptions::new())
        .await
        .unwrap();
    assert_eq!(outcome, CommandOutcome::Completed(json!("after")));
    assert_eq!(activity.handled(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_running_count_never_exceeds_limit() {
    let activity = Activity::new();
    let dispatcher = attached(3, &activity);

    let outcomes = join_all((0..12).map(|n| {
        dispatcher.execute(json!({"delay_ms": 50, "n": n}), CommandOptions::new())
    }))
    .await;

    for (n, outcome) in outcomes.into_iter().enumerate() {
        let outcome = outcome.unwrap();
        assert_eq!(outcome.data(), Some(&json!({"delay_ms": 50, "n": n})));
    }
    assert_eq!(activity.handled(), 12);
    assert_eq!(activity.peak(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_worker_crash_terminates_running_commands() {
    let activity = Activity::new();
    let dispatcher = attached(10, &activity);
    let mut events = dispatcher.subscribe();

    let long = CommandOptions::new().with_timeout_secs(60.0);
    let first = submit(&dispatcher, json!({"delay_ms": 30_000}), long.clone());
    let second = submit(&dispatcher, json!({"delay_ms": 30_000}), long.clone());
    let crash = submit(&dispatcher, json!({"crash": "worker panicked: boom"}), long);

    assert_eq!(first.await.unwrap(), CommandOutcome::Terminated);
    assert_eq!(second.await.unwrap(), CommandOutcome::Terminated);
    assert_eq!(crash.await.unwrap(), CommandOutcome::Terminated);

    let (diagnostics, exit_code) = collect_until_closed(&mut events).await;
    assert_eq!(exit_code, Some(CRASH_EXIT_CODE));
    assert!(diagnostics
        .iter()
        .all(|diag| diag.source == DiagnosticSource::Stderr));
    assert_eq!(stderr_text(&diagnostics), "worker panicked: boom\n");

    // The host survives; it only refuses new work until reinitialized.
    let err = dispatcher
        .execute(json!(1), CommandOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_kill_with_running_and_queued_commands() {
    let activity = Activity::new();
    let dispatcher = attached(2, &activity);

    let options = CommandOptions::new().with_timeout_secs(60.0);
    let receivers: Vec<_> = (0..5)
        .map(|n| submit(&dispatcher, json!({"delay_ms": 10_000, "n": n}), options.clone()))
        .collect();

    dispatcher.kill();

    let mut outcomes = Vec::new();
    for rx in receivers {
        outcomes.push(rx.await);
    }

    // The two running commands are terminated.
    assert_eq!(outcomes[0].as_ref().unwrap(), &CommandOutcome::Terminated);
    assert_eq!(outcomes[1].as_ref().unwrap(), &CommandOutcome::Terminated);
    // The three queued ones never started, so no callback ever fires.
    assert!(outcomes[2..].iter().all(|outcome| outcome.is_err()));

    dispatcher.wait_closed().await;
    assert!(activity.peak() <= 2);
    assert_eq!(activity.handled(), 0);
    assert!(matches!(
        dispatcher.execute(json!("next"), CommandOptions::new()).await,
        Err(WorkerError::Closed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_queued_future_reports_discarded() {
    let activity = Activity::new();
    let dispatcher = attached(1, &activity);

    let running = submit(
        &dispatcher,
        json!({"delay_ms": 10_000}),
        CommandOptions::new().with_timeout_secs(60.0),
    );
    let queued = dispatcher.execute(json!("queued"), CommandOptions::new());
    let killer = async {
        tokio::task::yield_now().await;
        dispatcher.kill();
    };

    let (queued, ()) = tokio::join!(queued, killer);
    assert!(matches!(queued, Err(WorkerError::Discarded)));
    assert_eq!(running.await.unwrap(), CommandOutcome::Terminated);
}
