//! End-to-end runs against the real worker binary.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use isolator::worker::{EXECUTION_TIME, WORKER_VERSION};
use isolator::{
    BinarySpawner, Control, Orchestrator, OrchestratorConfig, Request, ReturnValue, WorkItem,
    WorkerOutcome,
};

fn spawner() -> BinarySpawner {
    BinarySpawner::new(env!("CARGO_BIN_EXE_isolator-worker"))
        .env("RUST_LOG", "off")
        .env("ISOLATOR_LOG", "off")
}

fn orchestrator_with(spawner: BinarySpawner) -> Orchestrator {
    Orchestrator::new(
        OrchestratorConfig::new(Arc::new(spawner)).with_timeout(Duration::from_secs(30)),
    )
}

fn core(job: &str, args: Value) -> Request {
    Request::new(
        Control::default().with_autoload(["core"]),
        WorkItem::new(job, args),
    )
}

async fn run(request: Request) -> WorkerOutcome {
    orchestrator_with(spawner()).run(&request).await.unwrap()
}

#[tokio::test]
async fn echo_round_trips_through_a_worker() {
    let outcome = run(core("echo", json!({"greeting": "hi", "n": [1, 2]}))).await;

    assert!(!outcome.timed_out);
    assert_eq!(outcome.status_code, Some(0));
    assert_eq!(outcome.stdout, "");

    let response = &outcome.response;
    assert!(response.has_payload());
    assert_eq!(response.stderr_length(), 0);
    assert_eq!(response.exit_code(), 0);
    assert_eq!(
        response.return_value(),
        &ReturnValue::Value(json!({"greeting": "hi", "n": [1, 2]}))
    );

    let telemetry = response.telemetry();
    assert!(telemetry.get(EXECUTION_TIME).is_some());
    assert!(telemetry.get(WORKER_VERSION).is_some());
    assert!(telemetry.memory_peak_usage().is_some());
    assert_eq!(
        telemetry.get("requestId"),
        Some(&json!(outcome.request_id.to_string()))
    );
}

#[tokio::test]
async fn job_error_is_reported_with_exit_code_one() {
    let outcome = run(core(
        "fail",
        json!({"kind": "DomainException", "message": "not here", "file": "jobs.rs", "line": 12}),
    ))
    .await;

    assert_eq!(outcome.status_code, Some(1));
    assert_eq!(outcome.response.exit_code(), 1);
    let error = outcome.response.error().unwrap();
    assert_eq!(error.kind, "DomainException");
    assert_eq!(error.message, "not here");
    assert_eq!(error.file.as_deref(), Some("jobs.rs"));
    assert_eq!(error.line, Some(12));
}

#[tokio::test]
async fn panic_is_caught_and_panic_text_is_prefix_noise() {
    let outcome = run(core("panic", json!({"message": "kaboom"}))).await;

    let response = &outcome.response;
    assert!(response.has_payload());
    assert!(response.stderr_length() > 0);
    assert_eq!(response.exit_code(), 1);
    let error = response.error().unwrap();
    assert_eq!(error.kind, "Panic");
    assert_eq!(error.message, "kaboom");
}

#[tokio::test]
async fn warnings_before_the_payload_are_measured() {
    let outcome = run(core("warn", json!("careful"))).await;

    let response = &outcome.response;
    assert_eq!(response.exit_code(), 0);
    assert_eq!(response.return_value(), &ReturnValue::Value(json!("careful")));
    assert_eq!(response.stderr_length(), "Warning: careful\n".len());
}

#[tokio::test]
async fn exit_without_payload_is_recovered_from_stderr() {
    let outcome = run(core(
        "exit",
        json!({
            "code": 3,
            "stdout": "partial output",
            "stderr": "PHP Fatal error:  gave up in /srv/job.php on line 5\n",
        }),
    ))
    .await;

    assert_eq!(outcome.stdout, "partial output");
    assert_eq!(outcome.status_code, Some(3));

    let response = &outcome.response;
    assert!(!response.has_payload());
    assert_eq!(response.exit_code(), 3);
    let error = response.error().unwrap();
    assert_eq!(error.kind, "FatalError");
    assert_eq!(error.message, "gave up");
    assert_eq!(error.file.as_deref(), Some("/srv/job.php"));
    assert_eq!(error.line, Some(5));
}

#[tokio::test]
async fn clean_exit_without_payload_still_fails() {
    let outcome = run(core("exit", json!({"code": 0}))).await;

    assert_eq!(outcome.status_code, Some(0));
    assert!(outcome.response.return_value().is_none());
    assert_eq!(outcome.response.exit_code(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn silent_death_yields_empty_response() {
    let outcome = run(core("abort", Value::Null)).await;

    assert_eq!(outcome.status_code, None);
    assert!(outcome.response.return_value().is_none());
    assert_eq!(outcome.response.exit_code(), 1);
    assert!(outcome.response.telemetry().is_empty());
}

#[tokio::test]
async fn unknown_bundle_is_a_fatal_error() {
    let request = Request::new(
        Control::default().with_autoload(["core", "plugins"]),
        WorkItem::new("echo", Value::Null),
    );
    let outcome = run(request).await;

    assert_eq!(outcome.status_code, Some(1));
    let error = outcome.response.error().unwrap();
    assert_eq!(error.kind, "FatalError");
    assert_eq!(
        error.message,
        "worker could not produce a response: failed to apply control: \
         autoload bundle `plugins` is not in the worker catalog"
    );
}

#[tokio::test]
async fn job_outside_autoloaded_bundles_is_unresolved() {
    let request = Request::new(Control::default(), WorkItem::new("echo", Value::Null));
    let outcome = run(request).await;

    assert_eq!(outcome.response.exit_code(), 1);
    let error = outcome.response.error().unwrap();
    assert_eq!(error.kind, "FatalError");
    assert!(error.message.contains("unresolved job `echo`"), "{}", error.message);
}

#[tokio::test]
async fn control_prepares_environment_and_definitions() {
    let control = Control::default()
        .with_env("ISOLATOR_E2E_FLAG", "on")
        .with_definition("SITE_URL", "https://example.org")
        .with_autoload(["core"]);

    let env = run(Request::new(
        control.clone(),
        WorkItem::new("env", json!("ISOLATOR_E2E_FLAG")),
    ))
    .await;
    assert_eq!(env.response.return_value(), &ReturnValue::Value(json!("on")));

    let definition = run(Request::new(
        control,
        WorkItem::new("definition", json!("SITE_URL")),
    ))
    .await;
    assert_eq!(
        definition.response.return_value(),
        &ReturnValue::Value(json!("https://example.org"))
    );
}

#[tokio::test]
async fn control_changes_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let request = Request::new(
        Control::default().with_cwd(dir.path()).with_autoload(["core"]),
        WorkItem::new("cwd", Value::Null),
    );
    let outcome = run(request).await;

    let reported = outcome.response.return_value().as_value().unwrap();
    let reported = std::fs::canonicalize(reported.as_str().unwrap()).unwrap();
    assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
}

#[tokio::test]
async fn timeout_kills_a_stuck_worker() {
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::new(Arc::new(spawner())).with_timeout(Duration::from_millis(300)),
    );
    let outcome = orchestrator.run(&core("sleep", json!(30))).await.unwrap();

    assert!(outcome.timed_out);
    assert!(outcome.response.return_value().is_none());
    assert_eq!(outcome.response.exit_code(), 1);
}

#[tokio::test]
async fn debug_logs_do_not_disturb_the_payload() {
    let spawner = BinarySpawner::new(env!("CARGO_BIN_EXE_isolator-worker"))
        .env("RUST_LOG", "isolator=debug")
        .env("LOG_FORMAT", "json");
    let outcome = orchestrator_with(spawner)
        .run(&core("sum", json!([1, 2, 3])))
        .await
        .unwrap();

    let response = &outcome.response;
    assert_eq!(response.return_value(), &ReturnValue::Value(json!(6)));
    assert!(response.stderr_length() > 0);
}

#[tokio::test]
async fn run_all_executes_each_request_in_its_own_worker() {
    let orchestrator = orchestrator_with(spawner());
    let outcomes = orchestrator
        .run_all([
            core("echo", json!(1)),
            core("fail", json!({"message": "second"})),
            core("sum", json!([2, 2])),
        ])
        .await
        .unwrap();

    let values: Vec<_> = outcomes
        .iter()
        .map(|outcome| outcome.response.return_value().clone())
        .collect();
    assert_eq!(values[0], ReturnValue::Value(json!(1)));
    assert!(values[1].is_error());
    assert_eq!(values[2], ReturnValue::Value(json!(4)));

    assert_ne!(outcomes[0].request_id, outcomes[1].request_id);
    assert_ne!(outcomes[1].request_id, outcomes[2].request_id);
}
