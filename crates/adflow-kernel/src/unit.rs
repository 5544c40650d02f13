//! Step units: the executable work behind a task step
//!
//! The engine is agnostic to what a unit does. A unit receives the run's
//! accumulated results and returns one payload or one typed failure, even if
//! it fans out to several services internally.

use crate::error::StepError;
use crate::types::{DefinitionId, RunId, StepId, WorkflowRun};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Input handed to a step unit
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Run being executed
    pub run_id: RunId,
    /// Definition the run executes
    pub definition_id: DefinitionId,
    /// Step being invoked
    pub step_id: StepId,
    /// 1-based attempt number within the current visit
    pub attempt: u32,
    /// Payload given to `create_run`
    pub input: Value,
    /// Results of previously completed steps
    pub results: BTreeMap<StepId, Value>,
}

impl StepContext {
    /// Snapshot the inputs of `step_id` from `run`
    pub fn from_run(run: &WorkflowRun, step_id: StepId, attempt: u32) -> Self {
        Self {
            run_id: run.id,
            definition_id: run.definition_id.clone(),
            step_id,
            attempt,
            input: run.input.clone(),
            results: run.results.clone(),
        }
    }

    /// Result of an earlier step
    #[must_use]
    pub fn result(&self, step: &str) -> Option<&Value> {
        self.results.get(step)
    }
}

/// Executable unit invoked by the engine
#[async_trait::async_trait]
pub trait StepUnit: Send + Sync {
    /// Run once and return the step's payload.
    async fn invoke(&self, ctx: &StepContext) -> Result<Value, StepError>;
}

/// Adapter turning an async closure into a [`StepUnit`]
pub struct FnUnit<F>(F);

#[async_trait::async_trait]
impl<F, Fut> StepUnit for FnUnit<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepError>> + Send,
{
    async fn invoke(&self, ctx: &StepContext) -> Result<Value, StepError> {
        (self.0)(ctx.clone()).await
    }
}

/// Wrap an async closure as a shareable unit.
pub fn unit_fn<F, Fut>(f: F) -> Arc<dyn StepUnit>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
{
    Arc::new(FnUnit(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn closure_units_see_previous_results() {
        let unit = unit_fn(|ctx: StepContext| async move {
            let brief = ctx.result("brief").cloned().unwrap_or(Value::Null);
            Ok(json!({ "seen": brief }))
        });

        let mut run = WorkflowRun::new("def".into(), vec![], BTreeSet::new(), json!({}));
        run.results.insert("brief".into(), json!("headline"));
        let ctx = StepContext::from_run(&run, "assets".into(), 1);

        let out = unit.invoke(&ctx).await.unwrap();
        assert_eq!(out, json!({ "seen": "headline" }));
    }
}
