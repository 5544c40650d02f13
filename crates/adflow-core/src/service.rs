//! Dashboard-facing workflow service
//!
//! Thin facade over [`WorkflowEngine`] exposing the operations the dashboard
//! calls, plus a JSON request/response envelope for transports that speak
//! plain JSON.

use crate::agent::AgentClient;
use crate::error::ServiceError;
use crate::pipeline;
use adflow_kernel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// One dashboard operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DashboardRequest {
    CreateRun {
        definition_id: DefinitionId,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        interrupt_points: Vec<StepId>,
    },
    Start {
        run_id: RunId,
    },
    Pause {
        run_id: RunId,
    },
    Resume {
        run_id: RunId,
        decision: ApprovalDecision,
        #[serde(default)]
        note: Option<String>,
    },
    Cancel {
        run_id: RunId,
    },
    GetRun {
        run_id: RunId,
    },
    ListRuns {
        #[serde(default)]
        filter: RunFilter,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DashboardResponse {
    Run(Box<WorkflowRun>),
    Runs(Vec<WorkflowRun>),
}

pub struct WorkflowService {
    engine: Arc<WorkflowEngine>,
}

impl WorkflowService {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }

    /// Service with the built-in definitions registered against `client`.
    pub fn with_builtin(
        engine: Arc<WorkflowEngine>,
        client: Arc<dyn AgentClient>,
    ) -> Result<Self, ServiceError> {
        pipeline::install_builtin(&engine, client)?;
        Ok(Self::new(engine))
    }

    #[inline]
    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub async fn create_run(
        &self,
        definition_id: &DefinitionId,
        input: Value,
        interrupt_points: Vec<StepId>,
    ) -> Result<WorkflowRun, ServiceError> {
        Ok(self
            .engine
            .create_run_with(definition_id, input, interrupt_points)
            .await?)
    }

    /// Start and drive the run to its next resting state.
    pub async fn start(&self, run_id: RunId) -> Result<WorkflowRun, ServiceError> {
        Ok(self.engine.start(run_id).await?)
    }

    /// Start the run and drive it on a background task. Returns the
    /// `running` snapshot.
    pub async fn start_detached(&self, run_id: RunId) -> Result<WorkflowRun, ServiceError> {
        let run = self.engine.begin(run_id).await?;
        self.spawn_drive(run_id);
        Ok(run)
    }

    pub async fn pause(&self, run_id: RunId) -> Result<WorkflowRun, ServiceError> {
        Ok(self.engine.pause(run_id).await?)
    }

    pub async fn resume(
        &self,
        run_id: RunId,
        decision: ApprovalDecision,
        note: Option<String>,
    ) -> Result<WorkflowRun, ServiceError> {
        Ok(self.engine.resume(run_id, decision, note).await?)
    }

    pub async fn cancel(&self, run_id: RunId) -> Result<WorkflowRun, ServiceError> {
        Ok(self.engine.cancel(run_id).await?)
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<WorkflowRun, ServiceError> {
        Ok(self.engine.get_run(run_id).await?)
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, ServiceError> {
        Ok(self.engine.list_runs(filter).await?)
    }

    pub async fn dispatch(
        &self,
        request: DashboardRequest,
    ) -> Result<DashboardResponse, ServiceError> {
        let run = match request {
            DashboardRequest::CreateRun {
                definition_id,
                input,
                interrupt_points,
            } => {
                self.create_run(&definition_id, input, interrupt_points)
                    .await?
            }
            DashboardRequest::Start { run_id } => self.start_detached(run_id).await?,
            DashboardRequest::Pause { run_id } => self.pause(run_id).await?,
            DashboardRequest::Resume {
                run_id,
                decision,
                note,
            } => self.resume(run_id, decision, note).await?,
            DashboardRequest::Cancel { run_id } => self.cancel(run_id).await?,
            DashboardRequest::GetRun { run_id } => self.get_run(run_id).await?,
            DashboardRequest::ListRuns { filter } => {
                return Ok(DashboardResponse::Runs(self.list_runs(&filter).await?));
            }
        };
        Ok(DashboardResponse::Run(Box::new(run)))
    }

    /// Decode a JSON request, dispatch it and encode the outcome as
    /// `{"ok": true, ...}` or `{"ok": false, "error": {code, message}}`.
    pub async fn dispatch_json(&self, body: &str) -> Value {
        let outcome = match serde_json::from_str::<DashboardRequest>(body) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => Err(ServiceError::from(e)),
        };
        match outcome {
            Ok(response) => match serde_json::to_value(response) {
                Ok(Value::Object(mut fields)) => {
                    fields.insert("ok".into(), Value::Bool(true));
                    Value::Object(fields)
                }
                Ok(other) => json!({ "ok": true, "data": other }),
                Err(e) => error_body("SerializationError", &e.to_string()),
            },
            Err(e) => error_body(e.code(), &e.to_string()),
        }
    }

    fn spawn_drive(&self, run_id: RunId) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            match engine.drive(run_id).await {
                Ok(run) => info!(run_id = %run_id, status = %run.status, "background drive finished"),
                Err(e) => error!(run_id = %run_id, error = %e, "background drive failed"),
            }
        })
    }

    /// Start the approval watchdog for this service's engine.
    pub fn spawn_watchdog(&self) -> JoinHandle<()> {
        Arc::clone(&self.engine).spawn_approval_watchdog()
    }
}

fn error_body(code: &str, message: &str) -> Value {
    json!({ "ok": false, "error": { "code": code, "message": message } })
}
