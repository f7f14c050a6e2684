//! Drives the bundled `echo-worker` binary as a real child process.

#[path = "../common/mod.rs"]
mod common;

use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use common::{collect_until_closed, stderr_text};
use workerlink::config::Settings;
use workerlink::worker::{
    CommandOptions, CommandOutcome, Diagnostic, Dispatcher, WorkerError, WorkerEvent,
    WorkerLauncher,
};

const ECHO_WORKER: &str = env!("CARGO_BIN_EXE_echo-worker");

/// Generous bound so a stuck test fails instead of hanging.
const TEST_DEADLINE: Duration = Duration::from_secs(30);

async fn echo_dispatcher() -> Dispatcher {
    let launcher = WorkerLauncher::new(ECHO_WORKER).env("RUST_LOG", "off");
    let mut dispatcher = Dispatcher::new(launcher);
    dispatcher.init().await.unwrap();
    dispatcher
}

async fn closed(
    events: &mut broadcast::Receiver<WorkerEvent>,
) -> (Vec<Diagnostic>, Option<i32>) {
    tokio::time::timeout(TEST_DEADLINE, collect_until_closed(events))
        .await
        .expect("worker did not exit in time")
}

#[tokio::test]
async fn test_round_trip_and_graceful_close() {
    let dispatcher = echo_dispatcher().await;
    let mut events = dispatcher.subscribe();

    let outcome = dispatcher
        .execute(json!({"hello": ["world", 1, null]}), CommandOptions::new())
        .await
        .unwrap();
    assert_eq!(outcome.data(), Some(&json!({"hello": ["world", 1, null]})));

    dispatcher.close();
    let (diagnostics, exit_code) = closed(&mut events).await;
    assert!(diagnostics.is_empty());
    assert_eq!(exit_code, Some(0));
}

#[tokio::test]
async fn test_plain_stdout_line_is_parser_diagnostic() {
    let dispatcher = echo_dispatcher().await;
    let mut events = dispatcher.subscribe();

    let outcome = dispatcher
        .execute(json!({"log": "hello from the worker"}), CommandOptions::new())
        .await
        .unwrap();
    assert!(outcome.is_ok());

    dispatcher.close();
    let (diagnostics, _) = closed(&mut events).await;
    let parser: Vec<_> = diagnostics.iter().filter(|diag| diag.is_parser()).collect();
    assert_eq!(parser.len(), 1);
    assert_eq!(parser[0].data, "hello from the worker");
    assert!(parser[0].reason.is_some());
}

#[tokio::test]
async fn test_json_lines_without_command_id_are_dropped() {
    let dispatcher = echo_dispatcher().await;
    let mut events = dispatcher.subscribe();

    for stray in [r#"{"id":-1,"data":1}"#, r#"{"data":"no id"}"#, "[1,2,3]"] {
        let outcome = dispatcher
            .execute(json!({"log": stray, "n": stray}), CommandOptions::new())
            .await
            .unwrap();
        assert_eq!(outcome.data().and_then(|data| data.get("n")), Some(&json!(stray)));
    }

    dispatcher.close();
    let (diagnostics, exit_code) = closed(&mut events).await;
    assert!(diagnostics.is_empty(), "{diagnostics:?}");
    assert_eq!(exit_code, Some(0));
}

#[tokio::test]
async fn test_crash_terminates_and_reports_stderr() {
    let dispatcher = echo_dispatcher().await;
    let mut events = dispatcher.subscribe();

    let long = CommandOptions::new().with_timeout_secs(30.0);
    let slow = dispatcher.execute(json!({"delay_ms": 20_000}), long.clone());
    let crash = dispatcher.execute(json!({"crash": "fatal: out of widgets"}), long);
    let (slow, crash) = tokio::join!(slow, crash);

    assert_eq!(slow.unwrap(), CommandOutcome::Terminated);
    assert_eq!(crash.unwrap(), CommandOutcome::Terminated);

    let (diagnostics, exit_code) = closed(&mut events).await;
    assert_eq!(exit_code, Some(3));
    assert!(stderr_text(&diagnostics).contains("fatal: out of widgets"));
}

#[tokio::test]
async fn test_timeout_against_real_worker() {
    let dispatcher = echo_dispatcher().await;

    let outcome = dispatcher
        .execute(
            json!({"delay_ms": 2_000}),
            CommandOptions::new().with_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    assert_eq!(outcome, CommandOutcome::TimedOut);

    dispatcher.kill();
    tokio::time::timeout(TEST_DEADLINE, dispatcher.wait_closed())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_kill_reports_abnormal_exit() {
    let dispatcher = echo_dispatcher().await;
    let mut events = dispatcher.subscribe();

    let slow = dispatcher.execute(
        json!({"delay_ms": 20_000}),
        CommandOptions::new().with_timeout_secs(30.0),
    );
    let killer = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.kill();
    };
    let (slow, ()) = tokio::join!(slow, killer);

    assert_eq!(slow.unwrap(), CommandOutcome::Terminated);
    let (_, exit_code) = closed(&mut events).await;
    assert_ne!(exit_code, Some(0));
}

#[tokio::test]
async fn test_spawn_from_settings() {
    let mut settings = Settings::default();
    settings.worker.program = Some(ECHO_WORKER.to_string());
    settings.worker.env.insert("RUST_LOG".to_string(), "off".to_string());
    settings.pool.max_commands_running = 2;

    let dispatcher = Dispatcher::spawn(&settings).await.unwrap();
    assert_eq!(dispatcher.pool_config().max_commands_running, 2);

    let outcome = dispatcher
        .execute(json!("configured"), CommandOptions::new())
        .await
        .unwrap();
    assert_eq!(outcome.into_data(), Some(json!("configured")));

    dispatcher.close();
    tokio::time::timeout(TEST_DEADLINE, dispatcher.wait_closed())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_missing_program_is_initialization_error() {
    let mut dispatcher = Dispatcher::new(WorkerLauncher::new("./no/such/echo-worker"));
    let err = dispatcher.init().await.unwrap_err();

    assert!(matches!(err, WorkerError::ProgramNotFound(_)));
    assert!(err.is_initialization());
    assert!(!dispatcher.is_initialized());
}

#[tokio::test]
async fn test_settings_without_program_fail() {
    let err = Dispatcher::spawn(&Settings::default()).await.err().unwrap();
    assert!(matches!(err, WorkerError::Config(_)));
}
