//! Testing utilities for the adflow workspace
//!
//! Scripted step units, graph fixtures and run assertions.

#![allow(missing_docs)]

use adflow_kernel::prelude::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Unit that plays back a fixed script of outcomes, then repeats `fallback`.
pub struct ScriptedUnit {
    script: Mutex<VecDeque<Result<Value, StepError>>>,
    fallback: Result<Value, StepError>,
    calls: AtomicU32,
    delay: Option<Duration>,
}

impl ScriptedUnit {
    pub fn new(
        script: impl IntoIterator<Item = Result<Value, StepError>>,
        fallback: Result<Value, StepError>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            calls: AtomicU32::new(0),
            delay: None,
        })
    }

    pub fn always_ok(payload: Value) -> Arc<Self> {
        Self::new([], Ok(payload))
    }

    /// Fails `times` times with `kind`, then succeeds with `payload`.
    pub fn fail_times(times: usize, kind: StepErrorKind, payload: Value) -> Arc<Self> {
        let failures = (0..times).map(|i| Err(StepError::new(kind, format!("scripted failure {}", i + 1))));
        Self::new(failures, Ok(payload))
    }

    pub fn always_fail(kind: StepErrorKind) -> Arc<Self> {
        Self::new([], Err(StepError::new(kind, "scripted failure")))
    }

    /// Same script, but every call first sleeps for `delay`.
    pub fn slow(payload: Value, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(payload),
            calls: AtomicU32::new(0),
            delay: Some(delay),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepUnit for ScriptedUnit {
    async fn invoke(&self, _ctx: &StepContext) -> Result<Value, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Unit that blocks until the test releases it.
pub struct GatedUnit {
    entered: Arc<Notify>,
    release: Arc<Notify>,
    payload: Value,
}

/// Test-side handle of a [`GatedUnit`]
#[derive(Clone)]
pub struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl Gate {
    /// Wait until the unit has been invoked.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

impl GatedUnit {
    pub fn new(payload: Value) -> (Arc<Self>, Gate) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let unit = Arc::new(Self {
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
            payload,
        });
        (unit, Gate { entered, release })
    }
}

#[async_trait]
impl StepUnit for GatedUnit {
    async fn invoke(&self, _ctx: &StepContext) -> Result<Value, StepError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(self.payload.clone())
    }
}

/// Unit that echoes its step id, for graphs where payloads do not matter.
pub fn echo_unit() -> Arc<dyn StepUnit> {
    unit_fn(|ctx: StepContext| async move { Ok(json!({ "step": ctx.step_id.as_str() })) })
}

/// `a -> b -> ... -> last -> end` over the given units
pub fn linear_registry(definition: &str, steps: Vec<(&str, Arc<dyn StepUnit>)>) -> StepRegistry {
    let mut registry = StepRegistry::new(definition);
    let ids: Vec<&str> = steps.iter().map(|(id, _)| *id).collect();
    for (index, (id, unit)) in steps.into_iter().enumerate() {
        let step = StepDefinition::task(id, unit);
        let step = match ids.get(index + 1) {
            Some(next) => step.then(*next),
            None => step.finish(),
        };
        registry.register(step).unwrap();
    }
    registry
}

/// `draft -> review(gate) -> publish`, rejecting back to `draft`
pub fn review_registry(definition: &str, draft: Arc<dyn StepUnit>, publish: Arc<dyn StepUnit>) -> StepRegistry {
    StepRegistry::new(definition)
        .with_step(StepDefinition::task("draft", draft).then("review"))
        .unwrap()
        .with_step(
            StepDefinition::approval("review")
                .on_approve("publish")
                .on_reject("draft"),
        )
        .unwrap()
        .with_step(StepDefinition::task("publish", publish).finish())
        .unwrap()
}

/// Millisecond backoff so retry tests stay fast
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(4))
}

pub fn test_config() -> EngineConfig {
    EngineConfig::default().with_default_retry(fast_retry(2))
}

pub fn memory_engine(config: EngineConfig) -> Arc<WorkflowEngine> {
    Arc::new(WorkflowEngine::new(config, Arc::new(MemoryStore::new())))
}

/// Invariants every observed snapshot must satisfy.
pub fn assert_run_invariants(run: &WorkflowRun) {
    let active = run.active_steps().count();
    assert!(active <= 1, "{active} active steps in run {}", run.id);
    assert!(run.progress <= 100);
    for record in &run.steps {
        assert_eq!(
            record.error.is_some(),
            record.status() == StepStatus::Failed,
            "step {} has error={:?} while {}",
            record.id,
            record.error,
            record.status()
        );
    }
    run.history
        .verify_integrity()
        .unwrap_or_else(|e| panic!("transition log of run {} broken: {e}", run.id));

    match run.status {
        RunStatus::Completed => {
            assert_eq!(run.progress, 100);
            assert!(run.current_step.is_none());
            assert_eq!(active, 0);
            for record in &run.steps {
                if run.results.contains_key(&record.id) {
                    assert_eq!(
                        record.status(),
                        StepStatus::Completed,
                        "step {} on the realized path is not completed",
                        record.id
                    );
                }
            }
        }
        RunStatus::Failed => {
            let failure = run.failure.as_ref().expect("failed run without failure");
            assert!(run.errors.contains_key(&failure.step));
            assert!(run.current_step.is_none());
        }
        RunStatus::Interrupted => {
            let pending = run
                .pending_interrupt
                .as_ref()
                .expect("interrupted run without pending interrupt");
            assert_eq!(run.current_step.as_ref(), Some(&pending.step));
        }
        _ => {}
    }
}
