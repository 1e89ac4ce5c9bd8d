//! Human-in-the-loop flow: frontier hints, file-exchange completion, and
//! attempt cancellation.

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use matterstack_core::{
    Campaign, EngineError, RunConfig, RunHandle, RunStatus, Task, TaskResults, TaskStatus,
    Workflow,
};
use matterstack_engine::{
    cancel_attempt, frontier, initialize_run, step_run, BlockingKind, InitOptions, StepOptions,
};
use matterstack_store::StateStore;
use matterstack_wiring::WiringRequest;

struct ReviewCampaign;

impl Campaign for ReviewCampaign {
    fn plan(&self, state: Option<&Value>) -> Result<Option<Workflow>, EngineError> {
        if state.is_some() {
            return Ok(None);
        }
        let mut wf = Workflow::new();
        wf.add_task(
            Task::new("")
                .with_id("review")
                .with_operator_key("human.default")
                .with_env("INSTRUCTIONS", "Approve the candidate ranking."),
        )
        .map_err(|e| EngineError::Campaign(e.to_string()))?;
        Ok(Some(wf))
    }

    fn analyze(&self, _state: Option<Value>, results: &TaskResults) -> Result<Value, EngineError> {
        Ok(json!({"approved": results["review"].data.is_some()}))
    }
}

fn options_for(base: &Path) -> (InitOptions, StepOptions) {
    let mut wiring = WiringRequest::new(base);
    wiring.env_config_path = None;
    let init = InitOptions {
        base_path: base.to_path_buf(),
        run_id: None,
        run_config: RunConfig::default(),
        wiring: wiring.clone(),
        tags: json!({}),
        description: None,
    };
    let mut step = StepOptions::new();
    step.wiring = wiring;
    (init, step)
}

fn wait_for_status(run: &RunHandle, wanted: TaskStatus, task_id: &str) {
    let store = StateStore::open(run.db_path()).unwrap();
    for _ in 0..100 {
        if store.get_task_status(task_id).unwrap() == Some(wanted) {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("task {task_id} never became {wanted:?}");
}

#[test]
fn human_task_waits_then_completes_on_response() {
    let base = TempDir::new().unwrap();
    let campaign = ReviewCampaign;
    let (init, step) = options_for(base.path());
    let run = initialize_run("catalyst", &campaign, &init).unwrap();

    // First tick dispatches and leaves the task waiting on a human.
    let status = step_run(&run, &campaign, &step).unwrap();
    assert_eq!(status, RunStatus::Running);
    wait_for_status(&run, TaskStatus::WaitingExternal, "review");

    // The frontier names the blocking item with an actionable hint.
    let items = frontier(&run, None).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].task_id, "review");
    match &items[0].kind {
        BlockingKind::WaitingExternal {
            operator_key,
            evidence_path,
            hint,
        } => {
            assert_eq!(operator_key.as_deref(), Some("human.default"));
            assert!(evidence_path.is_some());
            assert!(!hint.is_empty());
        }
        other => panic!("expected WaitingExternal, got {other:?}"),
    }

    // Further ticks do not create more attempts while waiting.
    step_run(&run, &campaign, &step).unwrap();
    let store = StateStore::open(run.db_path()).unwrap();
    let attempts = store.list_attempts("review").unwrap();
    assert_eq!(attempts.len(), 1);
    let evidence = run.root_path.join(attempts[0].evidence_path.clone().unwrap());
    assert!(evidence.join("instructions.md").is_file());
    assert!(evidence.join("schema.json").is_file());
    drop(store);

    // The reviewer responds; the run completes.
    std::fs::write(
        evidence.join("response.json"),
        r#"{"status": "success", "data": {"approved_candidates": 3}}"#,
    )
    .unwrap();
    let mut status = RunStatus::Running;
    for _ in 0..20 {
        status = step_run(&run, &campaign, &step).unwrap();
        if status.is_terminal() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(status, RunStatus::Completed);

    let state: Value =
        serde_json::from_str(&std::fs::read_to_string(run.campaign_state_path()).unwrap())
            .unwrap();
    assert_eq!(state["approved"], true);
}

#[test]
fn malformed_response_fails_run_with_reason() {
    let base = TempDir::new().unwrap();
    let campaign = ReviewCampaign;
    let (init, step) = options_for(base.path());
    let run = initialize_run("catalyst", &campaign, &init).unwrap();

    step_run(&run, &campaign, &step).unwrap();
    let store = StateStore::open(run.db_path()).unwrap();
    let attempt = store.list_attempts("review").unwrap().remove(0);
    let evidence = run.root_path.join(attempt.evidence_path.unwrap());
    drop(store);

    std::fs::write(evidence.join("response.json"), "{malformed").unwrap();
    let mut status = RunStatus::Running;
    for _ in 0..20 {
        status = step_run(&run, &campaign, &step).unwrap();
        if status.is_terminal() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(status, RunStatus::Failed);

    let store = StateStore::open(run.db_path()).unwrap();
    let attempt = store.list_attempts("review").unwrap().remove(0);
    assert_eq!(attempt.status.as_str(), "FAILED");
    assert!(attempt.status_reason.unwrap().contains("invalid response"));
}

#[test]
fn cancel_attempt_is_audited_and_terminal() {
    let base = TempDir::new().unwrap();
    let campaign = ReviewCampaign;
    let (init, step) = options_for(base.path());
    let run = initialize_run("catalyst", &campaign, &init).unwrap();
    step_run(&run, &campaign, &step).unwrap();

    let store = StateStore::open(run.db_path()).unwrap();
    let attempt = store.list_attempts("review").unwrap().remove(0);
    drop(store);

    cancel_attempt(&run, &attempt.attempt_id, None, "operator unavailable", "cli").unwrap();

    let store = StateStore::open(run.db_path()).unwrap();
    let cancelled = store.get_attempt(&attempt.attempt_id).unwrap().unwrap();
    assert_eq!(cancelled.status.as_str(), "CANCELLED");
    assert_eq!(
        store.get_task_status("review").unwrap(),
        Some(TaskStatus::Cancelled)
    );

    let events = store.list_events(&run.run_id).unwrap();
    let cancel_event = events
        .iter()
        .find(|e| e.action == "cancel_attempt")
        .expect("audit event recorded");
    assert_eq!(cancel_event.actor, "cli");
    assert_eq!(cancel_event.payload["attempt_id"], attempt.attempt_id);

    // A second cancellation is rejected: the attempt is terminal.
    let err = cancel_attempt(&run, &attempt.attempt_id, None, "again", "cli").unwrap_err();
    assert!(matches!(err, EngineError::TerminalAttempt(_)));
}
