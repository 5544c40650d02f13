//! Dashboard dispatch through the JSON envelope

use adflow_core::pipeline::steps;
use adflow_core::prelude::*;
use adflow_test_utils::{memory_engine, test_config};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn service() -> WorkflowService {
    WorkflowService::with_builtin(
        memory_engine(test_config()),
        Arc::new(SimulatedAgentClient::new()),
    )
    .unwrap()
}

async fn call(service: &WorkflowService, request: Value) -> Value {
    service.dispatch_json(&request.to_string()).await
}

fn run_id(response: &Value) -> String {
    response["run"]["id"].as_str().unwrap().to_string()
}

async fn wait_for_status(service: &WorkflowService, id: &str, status: &str) -> Value {
    for _ in 0..200 {
        let response = call(service, json!({ "op": "getRun", "runId": id })).await;
        if response["run"]["status"] == status {
            return response;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("run {id} never reached {status}");
}

#[tokio::test]
async fn create_and_get_round_trip_through_json() {
    let service = service();

    let created = call(
        &service,
        json!({
            "op": "createRun",
            "definitionId": CREATIVE_CAMPAIGN,
            "input": { "product": "sneakers" }
        }),
    )
    .await;
    assert_eq!(created["ok"], true);
    assert_eq!(created["run"]["status"], "pending");
    assert_eq!(created["run"]["progress"], 0);
    assert_eq!(created["run"]["input"]["product"], "sneakers");

    let id = run_id(&created);
    let fetched = call(&service, json!({ "op": "getRun", "runId": id })).await;
    assert_eq!(fetched["run"]["id"], created["run"]["id"]);
    assert_eq!(fetched["run"]["steps"].as_array().map(Vec::len), Some(5));
}

#[tokio::test]
async fn start_drives_in_background_until_review() {
    let service = service();
    let created = call(
        &service,
        json!({ "op": "createRun", "definitionId": CREATIVE_CAMPAIGN }),
    )
    .await;
    let id = run_id(&created);

    let started = call(&service, json!({ "op": "start", "runId": id })).await;
    assert_eq!(started["ok"], true);
    assert_eq!(started["run"]["status"], "running");

    let waiting = wait_for_status(&service, &id, "interrupted").await;
    assert_eq!(waiting["run"]["pendingInterrupt"]["step"], steps::REVIEW);

    let resumed = call(
        &service,
        json!({ "op": "resume", "runId": id, "decision": "approve", "note": "lgtm" }),
    )
    .await;
    assert_eq!(resumed["run"]["status"], "completed");
    assert_eq!(resumed["run"]["results"]["review"]["note"], "lgtm");
}

#[tokio::test]
async fn cancel_of_waiting_run_is_attributed_to_the_gate() {
    let service = service();
    let run = service
        .create_run(&CREATIVE_CAMPAIGN.into(), json!({}), vec![])
        .await
        .unwrap();
    service.start(run.id).await.unwrap();

    let cancelled = call(
        &service,
        json!({ "op": "cancel", "runId": run.id.to_string() }),
    )
    .await;
    assert_eq!(cancelled["run"]["status"], "failed");
    assert_eq!(cancelled["run"]["failure"]["reason"], "UserCancelled");
    assert_eq!(cancelled["run"]["failure"]["step"], steps::REVIEW);

    let again = call(
        &service,
        json!({ "op": "resume", "runId": run.id.to_string(), "decision": "approve" }),
    )
    .await;
    assert_eq!(again["ok"], false);
    assert_eq!(again["error"]["code"], "InvalidStateError");
}

#[tokio::test]
async fn list_runs_filters_by_status() {
    let service = service();
    let first = service
        .create_run(&CREATIVE_CAMPAIGN.into(), json!({}), vec![])
        .await
        .unwrap();
    service
        .create_run(&CREATIVE_CAMPAIGN.into(), json!({}), vec![])
        .await
        .unwrap();
    service.start(first.id).await.unwrap();

    let all = call(&service, json!({ "op": "listRuns" })).await;
    assert_eq!(all["runs"].as_array().map(Vec::len), Some(2));

    let waiting = call(
        &service,
        json!({ "op": "listRuns", "filter": { "status": "interrupted" } }),
    )
    .await;
    let runs = waiting["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["id"], first.id.to_string());
}

#[tokio::test]
async fn errors_use_the_envelope() {
    let service = service();

    let garbage = service.dispatch_json("{ not json").await;
    assert_eq!(garbage["ok"], false);
    assert_eq!(garbage["error"]["code"], "BadRequest");

    let unknown_op = call(&service, json!({ "op": "explode" })).await;
    assert_eq!(unknown_op["error"]["code"], "BadRequest");

    let missing = call(
        &service,
        json!({ "op": "getRun", "runId": RunId::new().to_string() }),
    )
    .await;
    assert_eq!(missing["error"]["code"], "NotFoundError");

    let unknown_definition = call(
        &service,
        json!({ "op": "createRun", "definitionId": "radio-spot" }),
    )
    .await;
    assert_eq!(unknown_definition["error"]["code"], "UnknownDefinition");
    assert!(unknown_definition["error"]["message"]
        .as_str()
        .unwrap()
        .contains("radio-spot"));

    let run = service
        .create_run(&CREATIVE_CAMPAIGN.into(), json!({}), vec![])
        .await
        .unwrap();
    let pause_pending = call(
        &service,
        json!({ "op": "pause", "runId": run.id.to_string() }),
    )
    .await;
    assert_eq!(pause_pending["error"]["code"], "InvalidStateError");
    assert_eq!(
        service.get_run(run.id).await.unwrap().status,
        RunStatus::Pending
    );
}

#[tokio::test]
async fn runs_survive_a_service_restart_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config().with_store(StoreConfig::Sqlite {
        path: dir.path().join("runs.db"),
    });
    let open = || {
        let engine = Arc::new(WorkflowEngine::from_config(config.clone()).unwrap());
        WorkflowService::with_builtin(engine, Arc::new(SimulatedAgentClient::new())).unwrap()
    };

    let first = open();
    let run = first
        .create_run(&CREATIVE_CAMPAIGN.into(), json!({ "product": "kettle" }), vec![])
        .await
        .unwrap();
    let run = first.start(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Interrupted);
    drop(first);

    let second = open();
    let run = second
        .resume(run.id, ApprovalDecision::Approve, None)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.history.verify_integrity().is_ok());

    let done = second
        .list_runs(&RunFilter::default().with_status(RunStatus::Completed))
        .await
        .unwrap();
    assert_eq!(done.len(), 1);
}

#[tokio::test]
async fn dispatch_returns_typed_responses() {
    let service = service();
    let response = service
        .dispatch(DashboardRequest::CreateRun {
            definition_id: CREATIVE_CAMPAIGN.into(),
            input: json!({ "product": "tea" }),
            interrupt_points: vec![steps::ASSETS.into()],
        })
        .await
        .unwrap();
    let DashboardResponse::Run(run) = response else {
        panic!("expected a run");
    };
    assert!(run.interrupt_points.contains(steps::ASSETS));

    let run = service.start(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Interrupted);
    assert_eq!(
        run.pending_interrupt.as_ref().map(|p| p.step.as_str()),
        Some(steps::ASSETS)
    );
}
