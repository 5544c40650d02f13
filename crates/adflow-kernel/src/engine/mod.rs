//! Execution Engine
//!
//! Drives a [`WorkflowRun`] from `pending` to a terminal state. Each step is
//! awaited before the registry resolves the next one, so a run progresses
//! one step at a time; many runs may be driven concurrently. Every state
//! change goes through [`update_run`], which re-applies the mutation on a
//! version conflict, and every externally triggered transition re-checks the
//! run status inside the mutation.
//!
//! Failures are data: an operation returns `Ok(run)` with `status=failed`
//! when a step fails. `Err` is reserved for rejected requests and storage
//! trouble.

use crate::approval::{InterruptMode, PendingInterrupt};
use crate::config::EngineConfig;
use crate::error::{EngineError, StepError, ValidationError};
use crate::registry::{EdgeTarget, StepDefinition, StepKind, StepRegistry};
use crate::store::{open_store, update_run, RunFilter, WorkflowStore};
use crate::types::{
    DefinitionId, Failure, FailureReason, RunId, RunStatus, StepId, StepStatus, WorkflowRun,
};
use crate::unit::{StepContext, StepUnit};
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What the engine should do after a failed attempt
enum AfterFailure {
    Retry { retry: u32 },
    Stop,
}

/// Drives runs of registered definitions against a [`WorkflowStore`]
pub struct WorkflowEngine {
    config: EngineConfig,
    store: Arc<dyn WorkflowStore>,
    definitions: RwLock<HashMap<DefinitionId, Arc<StepRegistry>>>,
}

impl WorkflowEngine {
    /// Engine over an existing store
    pub fn new(config: EngineConfig, store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            config,
            store,
            definitions: RwLock::new(HashMap::new()),
        }
    }

    /// Engine over the store backend named in `config`
    pub fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        let store = open_store(&config.store)?;
        Ok(Self::new(config, store))
    }

    /// Effective configuration
    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Backing store
    #[inline]
    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Validate and publish a definition. Re-registering an id replaces the
    /// definition for runs created afterwards.
    pub fn register_definition(
        &self,
        registry: StepRegistry,
    ) -> Result<Arc<StepRegistry>, EngineError> {
        registry.validate()?;
        let registry = Arc::new(registry);
        let id = registry.definition_id().clone();
        info!(definition = %id, steps = registry.len(), "workflow definition registered");
        self.definitions.write().insert(id, Arc::clone(&registry));
        Ok(registry)
    }

    /// Registered definition, or `UnknownDefinition`
    pub fn definition(&self, id: &DefinitionId) -> Result<Arc<StepRegistry>, EngineError> {
        self.definitions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDefinition(id.clone()))
    }

    /// Registered definition ids, sorted
    pub fn definition_ids(&self) -> Vec<DefinitionId> {
        let mut ids: Vec<_> = self.definitions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Create a `pending` run using only the registry's interrupt points.
    pub async fn create_run(
        &self,
        definition_id: &DefinitionId,
        input: Value,
    ) -> Result<WorkflowRun, EngineError> {
        self.create_run_with(definition_id, input, Vec::new()).await
    }

    /// Create a `pending` run with caller-supplied interrupt points on top of
    /// the registry's. Extra points pause before their step.
    pub async fn create_run_with(
        &self,
        definition_id: &DefinitionId,
        input: Value,
        extra_interrupts: Vec<StepId>,
    ) -> Result<WorkflowRun, EngineError> {
        let registry = self.definition(definition_id)?;
        let mut points = registry.interrupt_points();
        for step in extra_interrupts {
            if registry.step(step.as_str()).is_none() {
                return Err(ValidationError::UnknownStep(step).into());
            }
            points.insert(step);
        }

        let run = WorkflowRun::new(
            definition_id.clone(),
            registry.step_records(),
            points,
            input,
        );
        let run = self.store.insert(run).await?;
        info!(run_id = %run.id, definition = %definition_id, "workflow run created");
        Ok(run)
    }

    /// Current snapshot of a run
    pub async fn get_run(&self, run_id: RunId) -> Result<WorkflowRun, EngineError> {
        Ok(self.store.load(run_id).await?)
    }

    /// Runs matching `filter`, newest first
    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, EngineError> {
        Ok(self.store.list(filter).await?)
    }

    /// Start a `pending` run, or continue a `paused` one, and drive it until
    /// it completes, fails, pauses or waits for input.
    pub async fn start(&self, run_id: RunId) -> Result<WorkflowRun, EngineError> {
        self.begin(run_id).await?;
        self.drive(run_id).await
    }

    /// Apply the `start` transition without driving the run.
    pub async fn begin(&self, run_id: RunId) -> Result<WorkflowRun, EngineError> {
        let registry = self.registry_for(run_id).await?;
        let (run, ()) = self
            .update(run_id, |run| match run.status {
                RunStatus::Pending => {
                    let entry = registry
                        .entry()
                        .cloned()
                        .ok_or(ValidationError::EmptyDefinition)?;
                    run.started_at = Some(Utc::now());
                    run.transition(RunStatus::Running, Some(&entry), "run started")?;
                    self.enter(&registry, run, entry)
                }
                RunStatus::Paused => {
                    let current = run.current_step.clone();
                    run.transition(RunStatus::Running, current.as_ref(), "run continued")?;
                    Ok(())
                }
                status => Err(EngineError::InvalidState {
                    run_id,
                    status,
                    operation: "start",
                }),
            })
            .await?;
        info!(run_id = %run_id, status = %run.status, step = ?run.current_step, "run started");
        Ok(run)
    }

    /// Ask a running run to park as `paused` once its in-flight step
    /// finishes.
    pub async fn pause(&self, run_id: RunId) -> Result<WorkflowRun, EngineError> {
        let (run, ()) = self
            .update(run_id, |run| {
                if run.status != RunStatus::Running {
                    return Err(EngineError::InvalidState {
                        run_id,
                        status: run.status,
                        operation: "pause",
                    });
                }
                run.pause_requested = true;
                Ok(())
            })
            .await?;
        info!(run_id = %run_id, "pause requested");
        Ok(run)
    }

    /// Cancel a run. Idle runs fail at once; a running run fails once the
    /// in-flight step returns.
    pub async fn cancel(&self, run_id: RunId) -> Result<WorkflowRun, EngineError> {
        let registry = self.registry_for(run_id).await?;
        let (run, ()) = self
            .update(run_id, |run| match run.status {
                RunStatus::Pending | RunStatus::Paused | RunStatus::Interrupted => {
                    self.fail_cancelled(&registry, run)
                }
                RunStatus::Running => {
                    run.cancel_requested = true;
                    Ok(())
                }
                status => Err(EngineError::InvalidState {
                    run_id,
                    status,
                    operation: "cancel",
                }),
            })
            .await?;
        info!(run_id = %run_id, status = %run.status, "cancel requested");
        Ok(run)
    }

    pub(crate) async fn update<T, F>(
        &self,
        run_id: RunId,
        mutate: F,
    ) -> Result<(WorkflowRun, T), EngineError>
    where
        F: FnMut(&mut WorkflowRun) -> Result<T, EngineError> + Send,
        T: Send,
    {
        update_run(
            self.store.as_ref(),
            run_id,
            self.config.update_attempts,
            mutate,
        )
        .await
    }

    async fn registry_for(&self, run_id: RunId) -> Result<Arc<StepRegistry>, EngineError> {
        let run = self.store.load(run_id).await?;
        self.definition(&run.definition_id)
    }

    /// Run steps until the run leaves `running`.
    pub async fn drive(&self, run_id: RunId) -> Result<WorkflowRun, EngineError> {
        let mut run = self.store.load(run_id).await?;
        let registry = self.definition(&run.definition_id)?;

        loop {
            if run.status != RunStatus::Running {
                return Ok(run);
            }

            if run.cancel_requested {
                let (cancelled, ()) = self
                    .update(run_id, |run| {
                        if run.status == RunStatus::Running && run.cancel_requested {
                            self.fail_cancelled(&registry, run)?;
                        }
                        Ok(())
                    })
                    .await?;
                info!(run_id = %run_id, "run cancelled");
                run = cancelled;
                continue;
            }

            if run.pause_requested {
                let (paused, ()) = self
                    .update(run_id, |run| {
                        if run.status == RunStatus::Running && run.pause_requested {
                            run.pause_requested = false;
                            let current = run.current_step.clone();
                            run.transition(RunStatus::Paused, current.as_ref(), "run paused")?;
                        }
                        Ok(())
                    })
                    .await?;
                info!(run_id = %run_id, step = ?paused.current_step, "run paused");
                run = paused;
                continue;
            }

            let Some(current) = run.current_step.clone() else {
                return Err(EngineError::InvalidState {
                    run_id,
                    status: run.status,
                    operation: "drive",
                });
            };
            let step = registry
                .step(current.as_str())
                .cloned()
                .ok_or_else(|| ValidationError::UnknownStep(current.clone()))?;

            run = match &step.kind {
                StepKind::Approval => {
                    let (interrupted, ()) = self
                        .update(run_id, |run| {
                            if run.status == RunStatus::Running
                                && run.current_step.as_ref() == Some(&step.id)
                            {
                                self.open_interrupt(run, &step.id, InterruptMode::Before)?;
                            }
                            Ok(())
                        })
                        .await?;
                    interrupted
                }
                StepKind::Task(unit) => {
                    self.execute_step(&registry, run_id, &step, Arc::clone(unit))
                        .await?
                }
            };
        }
    }

    /// Execute one task step, retrying recoverable failures per its policy.
    async fn execute_step(
        &self,
        registry: &StepRegistry,
        run_id: RunId,
        step: &StepDefinition,
        unit: Arc<dyn StepUnit>,
    ) -> Result<WorkflowRun, EngineError> {
        let policy = step
            .retry
            .clone()
            .unwrap_or_else(|| self.config.default_retry.clone());
        let limit = step.timeout.or_else(|| self.config.default_step_timeout());

        loop {
            let (run, ctx) = self
                .update(run_id, |run| {
                    // a cancel during backoff leaves the step to drive
                    if run.status != RunStatus::Running
                        || run.cancel_requested
                        || run.current_step.as_ref() != Some(&step.id)
                    {
                        return Ok(None);
                    }
                    let record = run
                        .step_mut(step.id.as_str())
                        .ok_or_else(|| ValidationError::UnknownStep(step.id.clone()))?;
                    let attempt = record.enter(Utc::now())?;
                    Ok(Some(StepContext::from_run(run, step.id.clone(), attempt)))
                })
                .await?;
            let Some(ctx) = ctx else {
                return Ok(run);
            };

            info!(run_id = %run_id, step = %step.id, attempt = ctx.attempt, "executing step");
            let invocation = unit.invoke(&ctx);
            let outcome = match limit {
                Some(limit) => tokio::time::timeout(limit, invocation)
                    .await
                    .unwrap_or_else(|_| Err(StepError::timeout(limit))),
                None => invocation.await,
            };
            let outcome = outcome.and_then(|payload| {
                registry
                    .check_output(step.id.as_str(), &payload)
                    .map(|()| payload)
            });

            let error = match outcome {
                Ok(payload) => {
                    self.store.append_result(run_id, &step.id, payload).await?;
                    let (run, ()) = self
                        .update(run_id, |run| self.complete_step(registry, run, step))
                        .await?;
                    info!(
                        run_id = %run_id,
                        step = %step.id,
                        status = %run.status,
                        progress = run.progress,
                        "step completed"
                    );
                    return Ok(run);
                }
                Err(error) => error,
            };

            self.store
                .append_error(run_id, &step.id, error.to_string())
                .await?;
            let recoverable = policy.is_recoverable(error.kind);
            let (run, next) = self
                .update(run_id, |run| {
                    if run.status != RunStatus::Running || run.cancel_requested {
                        return Ok(AfterFailure::Stop);
                    }
                    let retries_used = run
                        .step(step.id.as_str())
                        .map_or(0, |r| r.attempts.saturating_sub(1));
                    if recoverable && retries_used < policy.max_retries {
                        run.retry_count += 1;
                        return Ok(AfterFailure::Retry {
                            retry: retries_used,
                        });
                    }
                    let (reason, message) = if recoverable {
                        (
                            FailureReason::RetriesExhausted,
                            format!("{error} (gave up after {} attempts)", retries_used + 1),
                        )
                    } else {
                        (FailureReason::StepFailed, error.to_string())
                    };
                    self.mark_failed(run, reason, &step.id, message, Some(error.kind))?;
                    Ok(AfterFailure::Stop)
                })
                .await?;

            match next {
                AfterFailure::Retry { retry } => {
                    let delay = policy.delay_for(retry);
                    warn!(
                        run_id = %run_id,
                        step = %step.id,
                        retry = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                AfterFailure::Stop => {
                    if run.status == RunStatus::Failed {
                        error!(run_id = %run_id, step = %step.id, error = %error, "step failed, run failed");
                    }
                    return Ok(run);
                }
            }
        }
    }

    fn complete_step(
        &self,
        registry: &StepRegistry,
        run: &mut WorkflowRun,
        step: &StepDefinition,
    ) -> Result<(), EngineError> {
        if run.status != RunStatus::Running {
            return Ok(());
        }
        let now = Utc::now();
        if let Some(record) = run.step_mut(step.id.as_str()) {
            if record.status() == StepStatus::Running {
                record.complete(now)?;
            }
        }
        run.recompute_progress();
        if run.cancel_requested {
            return Ok(());
        }
        if self.interrupt_mode(registry, run, step.id.as_str()) == Some(InterruptMode::After) {
            return self.open_interrupt(run, &step.id, InterruptMode::After);
        }
        self.route(registry, run, &step.id)
    }

    /// Resolve the edge out of `from` and apply it.
    pub(crate) fn route(
        &self,
        registry: &StepRegistry,
        run: &mut WorkflowRun,
        from: &StepId,
    ) -> Result<(), EngineError> {
        match registry.edges_from(from.as_str(), run) {
            Ok(EdgeTarget::End) => {
                run.transition(RunStatus::Completed, Some(from), "workflow completed")?;
                info!(run_id = %run.id, "run completed");
                Ok(())
            }
            Ok(EdgeTarget::Step(next)) => {
                debug!(run_id = %run.id, from = %from, to = %next, "advancing");
                self.enter(registry, run, next)
            }
            Err(EngineError::NoMatchingEdge { step }) => {
                error!(run_id = %run.id, step = %step, "no edge matches the run state");
                self.mark_failed(
                    run,
                    FailureReason::NoMatchingEdge,
                    &step,
                    format!("no edge from `{step}` matches the run state"),
                    None,
                )
            }
            Err(other) => Err(other),
        }
    }

    /// Make `step` current, stopping in front of it if it pauses before.
    fn enter(
        &self,
        registry: &StepRegistry,
        run: &mut WorkflowRun,
        step: StepId,
    ) -> Result<(), EngineError> {
        if self.interrupt_mode(registry, run, step.as_str()) == Some(InterruptMode::Before) {
            return self.open_interrupt(run, &step, InterruptMode::Before);
        }
        run.current_step = Some(step);
        Ok(())
    }

    fn interrupt_mode(
        &self,
        registry: &StepRegistry,
        run: &WorkflowRun,
        step: &str,
    ) -> Option<InterruptMode> {
        registry.interrupt_mode(step).or_else(|| {
            run.interrupt_points
                .contains(step)
                .then_some(InterruptMode::Before)
        })
    }

    pub(crate) fn open_interrupt(
        &self,
        run: &mut WorkflowRun,
        step: &StepId,
        mode: InterruptMode,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        let deadline = self
            .config
            .approval_timeout()
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|t| now + t);
        if mode == InterruptMode::Before {
            if let Some(record) = run.step_mut(step.as_str()) {
                record.await_input(now)?;
            }
        }
        run.current_step = Some(step.clone());
        run.pending_interrupt = Some(PendingInterrupt {
            step: step.clone(),
            mode,
            since: now,
            deadline,
        });
        run.pause_requested = false;
        let detail = match mode {
            InterruptMode::Before => format!("awaiting input before `{step}`"),
            InterruptMode::After => format!("awaiting review of `{step}`"),
        };
        run.transition(RunStatus::Interrupted, Some(step), detail)?;
        info!(run_id = %run.id, step = %step, ?mode, "run interrupted");
        Ok(())
    }

    fn fail_cancelled(
        &self,
        registry: &StepRegistry,
        run: &mut WorkflowRun,
    ) -> Result<(), EngineError> {
        let step = run
            .current_step
            .clone()
            .or_else(|| registry.entry().cloned())
            .ok_or(ValidationError::EmptyDefinition)?;
        self.mark_failed(
            run,
            FailureReason::UserCancelled,
            &step,
            "cancelled by user".to_string(),
            None,
        )
    }

    /// Fail the run, attributing the failure to `step`.
    pub(crate) fn mark_failed(
        &self,
        run: &mut WorkflowRun,
        reason: FailureReason,
        step: &StepId,
        message: String,
        kind: Option<crate::error::StepErrorKind>,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        if let Some(record) = run.step_mut(step.as_str()) {
            if matches!(record.status(), StepStatus::Pending | StepStatus::Running) {
                record.fail(now, message.clone())?;
            }
        }
        run.errors.insert(step.clone(), message.clone());
        let detail = format!("{reason}: {message}");
        run.failure = Some(Failure {
            reason,
            step: step.clone(),
            message,
            kind,
        });
        run.transition(RunStatus::Failed, Some(step), detail)?;
        Ok(())
    }
}
