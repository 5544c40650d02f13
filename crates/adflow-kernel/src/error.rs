//! Error taxonomy for the workflow kernel
//!
//! - [`ValidationError`]: bad definition, fatal and never retried
//! - [`StepError`]: raised by a step unit, classified by the step's retry policy
//! - [`StoreError`]: persistence failures and optimistic-concurrency conflicts
//! - [`EngineError`]: everything an engine operation can surface to a caller

use crate::types::{DefinitionId, FailureReason, RunId, RunStatus, StepId, StepStatus, WorkflowRun};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Definition errors found while registering or validating a step graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Two steps share an id
    #[error("step `{0}` is already registered")]
    DuplicateStep(StepId),

    /// Nothing registered
    #[error("definition has no steps")]
    EmptyDefinition,

    /// Referenced step id is not in the registry
    #[error("step `{0}` is not registered")]
    UnknownStep(StepId),

    /// An edge points at a step that does not exist
    #[error("step `{from}` routes to unregistered step `{to}`")]
    UnknownTarget {
        /// Step declaring the edge
        from: StepId,
        /// Missing destination
        to: StepId,
    },

    /// Step cannot be reached from the entry
    #[error("step `{0}` is not reachable from the entry step")]
    Unreachable(StepId),

    /// The graph never finishes
    #[error("no route from the entry step reaches the end of the workflow")]
    NoTerminal,

    /// Approval step missing one of its two routes
    #[error("approval gate `{0}` needs both an approve and a reject route")]
    IncompleteGate(StepId),

    /// Loop that could spin without a human deciding
    #[error("cycle through {0:?} does not pass an approval gate")]
    UnattendedCycle(Vec<StepId>),

    /// Output schema is not valid JSON Schema
    #[error("output schema for step `{step}` does not compile: {message}")]
    InvalidSchema {
        /// Step owning the schema
        step: StepId,
        /// Compiler diagnostic
        message: String,
    },

    /// Retry policy fails validation
    #[error("retry policy for step `{step}` is invalid: {message}")]
    InvalidRetryPolicy {
        /// Step owning the policy
        step: StepId,
        /// What is wrong with it
        message: String,
    },
}

/// How a step unit failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// Network blips, rate limits, provider overload
    Transient,
    /// The unit did not answer within the step timeout
    Timeout,
    /// The payload did not match the step's output schema
    InvalidOutput,
    /// Anything retrying cannot fix
    Permanent,
}

impl fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepErrorKind::Transient => "transient",
            StepErrorKind::Timeout => "timeout",
            StepErrorKind::InvalidOutput => "invalid output",
            StepErrorKind::Permanent => "permanent",
        };
        f.write_str(s)
    }
}

/// Typed failure returned by a step unit
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct StepError {
    /// Classification the retry policy looks at
    pub kind: StepErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl StepError {
    /// Error of an explicit kind
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Recoverable failure
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Transient, message)
    }

    /// Failure retrying cannot fix
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Permanent, message)
    }

    /// Payload rejected by the output schema
    pub fn invalid_output(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::InvalidOutput, message)
    }

    /// Unit exceeded `limit`
    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            StepErrorKind::Timeout,
            format!("no result within {}ms", limit.as_millis()),
        )
    }
}

/// Status change not in the transition table
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Run status change refused
    #[error("illegal run transition {from} -> {to}")]
    IllegalTransition {
        /// Current status
        from: RunStatus,
        /// Requested status
        to: RunStatus,
    },

    /// Step status change refused
    #[error("illegal transition of step `{step}`: {from} -> {to}")]
    IllegalStepTransition {
        /// Step whose record was updated
        step: StepId,
        /// Current status
        from: StepStatus,
        /// Requested status
        to: StepStatus,
    },
}

/// Transition log problems
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    /// Event at this sequence does not hash to its recorded value
    #[error("transition log hash chain broken at sequence {0}")]
    IntegrityViolation(u64),
}

/// Workflow state store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No run with this id
    #[error("workflow run {0} not found")]
    NotFound(RunId),

    /// Insert of an id that is already stored
    #[error("workflow run {0} already exists")]
    AlreadyExists(RunId),

    /// The snapshot being saved is older than the stored one
    #[error("workflow run {run_id} changed concurrently (saved from version {expected}, stored version {found})")]
    VersionConflict {
        /// Run being saved
        run_id: RunId,
        /// Version the snapshot was loaded at
        expected: u64,
        /// Version currently stored
        found: u64,
    },

    /// `update_run` gave up after repeated conflicts
    #[error("workflow run {run_id} still conflicting after {attempts} update attempts")]
    Contention {
        /// Run being updated
        run_id: RunId,
        /// Read-modify-write rounds tried
        attempts: u32,
    },

    /// Snapshot could not be encoded or decoded
    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Driver-level failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Rejected definition
    #[error("invalid workflow definition: {0}")]
    Validation(#[from] ValidationError),

    /// Unknown run id
    #[error("workflow run {0} not found")]
    NotFound(RunId),

    /// No definition registered under this id
    #[error("unknown workflow definition `{0}`")]
    UnknownDefinition(DefinitionId),

    /// No outgoing edge accepted the run state
    #[error("no edge from step `{step}` matches the run state")]
    NoMatchingEdge {
        /// Step whose outgoing edges were evaluated
        step: StepId,
    },

    /// A step failed for good
    #[error("step `{step}` failed: {error}")]
    StepExecution {
        /// Step that failed
        step: StepId,
        /// Last error the unit raised
        error: StepError,
    },

    /// Resume arrived after the approval deadline
    #[error("approval at step `{step}` of run {run_id} timed out")]
    ApprovalTimeout {
        /// Run that was waiting
        run_id: RunId,
        /// Gate or interrupt point it waited at
        step: StepId,
    },

    /// Operation not legal in the run's current status
    #[error("cannot {operation} run {run_id} while it is {status}")]
    InvalidState {
        /// Run the operation targeted
        run_id: RunId,
        /// Status the run was in
        status: RunStatus,
        /// Name of the refused operation
        operation: &'static str,
    },

    /// Internal transition bug
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    /// Persistence failure
    #[error(transparent)]
    Store(StoreError),
}

impl EngineError {
    /// Caller-side mistakes: the run was left untouched
    #[must_use]
    pub fn is_rejected_request(&self) -> bool {
        matches!(
            self,
            EngineError::NotFound(_)
                | EngineError::UnknownDefinition(_)
                | EngineError::InvalidState { .. }
        )
    }

    /// Worth retrying the whole operation
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Store(StoreError::Contention { .. } | StoreError::Backend(_))
        )
    }

    /// Short machine-readable code for API responses
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "ValidationError",
            EngineError::NotFound(_) => "NotFoundError",
            EngineError::UnknownDefinition(_) => "UnknownDefinition",
            EngineError::NoMatchingEdge { .. } => "NoMatchingEdgeError",
            EngineError::StepExecution { .. } => "StepExecutionError",
            EngineError::ApprovalTimeout { .. } => "ApprovalTimeoutError",
            EngineError::InvalidState { .. } => "InvalidStateError",
            EngineError::StateMachine(_) => "StateMachineError",
            EngineError::Store(_) => "StoreError",
        }
    }
}

impl EngineError {
    /// The error behind a failed run, if a fault rather than a person ended it
    #[must_use]
    pub fn from_failure(run: &WorkflowRun) -> Option<Self> {
        let failure = run.failure.as_ref()?;
        let step = failure.step.clone();
        match failure.reason {
            FailureReason::StepFailed | FailureReason::RetriesExhausted => {
                Some(EngineError::StepExecution {
                    step,
                    error: StepError::new(
                        failure.kind.unwrap_or(StepErrorKind::Permanent),
                        failure.message.clone(),
                    ),
                })
            }
            FailureReason::NoMatchingEdge => Some(EngineError::NoMatchingEdge { step }),
            FailureReason::ApprovalTimeout => Some(EngineError::ApprovalTimeout {
                run_id: run.id,
                step,
            }),
            FailureReason::ApprovalRejected | FailureReason::UserCancelled => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            other => EngineError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_engine_not_found() {
        let id = RunId::new();
        let err: EngineError = StoreError::NotFound(id).into();
        assert!(matches!(err, EngineError::NotFound(found) if found == id));
        assert!(err.is_rejected_request());
    }

    #[test]
    fn step_error_display_names_kind() {
        let err = StepError::timeout(Duration::from_millis(250));
        assert_eq!(err.kind, StepErrorKind::Timeout);
        assert_eq!(err.to_string(), "timeout error: no result within 250ms");
    }

    #[test]
    fn step_failure_maps_back_to_engine_error() {
        let mut run = WorkflowRun::new("d".into(), vec![], Default::default(), serde_json::json!({}));
        assert!(EngineError::from_failure(&run).is_none());

        run.failure = Some(crate::types::Failure {
            reason: FailureReason::RetriesExhausted,
            step: "assets".into(),
            message: "quota".into(),
            kind: Some(StepErrorKind::Transient),
        });
        let err = EngineError::from_failure(&run).unwrap();
        assert_eq!(err.code(), "StepExecutionError");
        assert!(matches!(
            err,
            EngineError::StepExecution { error: StepError { kind: StepErrorKind::Transient, .. }, .. }
        ));
    }

    #[test]
    fn contention_is_retryable() {
        let err = EngineError::from(StoreError::Contention {
            run_id: RunId::new(),
            attempts: 3,
        });
        assert!(err.is_retryable());
        assert_eq!(err.code(), "StoreError");
        assert!(!EngineError::NoMatchingEdge { step: "a".into() }.is_retryable());
    }
}
