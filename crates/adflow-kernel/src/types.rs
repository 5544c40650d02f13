//! Run-level data model
//!
//! [`WorkflowRun`] is the snapshot the dashboard renders: status, progress,
//! per-step records, accumulated results and errors. Every status change goes
//! through [`WorkflowRun::transition`], which validates it against the state
//! machine and appends it to the run's transition log.

use crate::approval::{ApprovalRecord, PendingInterrupt};
use crate::error::{StateMachineError, StepErrorKind};
use crate::logging::TransitionLog;
use crate::state_machine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of one workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of a step within a definition
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    /// Wrap an id string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Underlying id string
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StepId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for StepId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a registered workflow definition
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DefinitionId(String);

impl DefinitionId {
    /// Wrap an id string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Underlying id string
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DefinitionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DefinitionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Created, not started yet
    Pending,
    /// Steps are being executed
    Running,
    /// Parked at a step boundary until started again
    Paused,
    /// Reached the end of the graph
    Completed,
    /// Ended by an error, a timeout or a cancel
    Failed,
    /// Waiting for a reviewer
    Interrupted,
}

impl RunStatus {
    /// Every status, in lifecycle order
    pub const ALL: [RunStatus; 6] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Paused,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Interrupted,
    ];

    /// `completed` and `failed` accept no further transitions
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown run status `{s}`"))
    }
}

/// Status of a single step record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not reached on the current visit
    Pending,
    /// Being executed
    Running,
    /// Finished with a result or decision
    Completed,
    /// The run failed here
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One node of the graph as realized for a specific run.
///
/// `completed` and `active` are stored for the dashboard but only ever
/// written together with `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// Step this record belongs to
    pub id: StepId,
    /// Display name from the definition
    pub name: String,
    status: StepStatus,
    completed: bool,
    active: bool,
    /// Milliseconds, set when the step completes or fails
    pub duration: Option<u64>,
    /// Failure message, set only while `failed`
    pub error: Option<String>,
    /// Executions during the current visit of this step
    pub attempts: u32,
    /// Start of the current visit
    pub started_at: Option<DateTime<Utc>>,
    /// When the step completed or failed
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// Pending record
    pub fn new(id: StepId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: StepStatus::Pending,
            completed: false,
            active: false,
            duration: None,
            error: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Current status
    #[inline]
    #[must_use]
    pub fn status(&self) -> StepStatus {
        self.status
    }

    /// Mirrors `status == completed`
    #[inline]
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Mirrors `status == running`
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    fn set_status(&mut self, to: StepStatus) -> Result<(), StateMachineError> {
        state_machine::validate_step_transition(&self.id, self.status, to)?;
        self.status = to;
        self.completed = to == StepStatus::Completed;
        self.active = to == StepStatus::Running;
        Ok(())
    }

    /// Begin an execution attempt. Re-entering a finished step (rework
    /// branch) starts a fresh visit.
    pub(crate) fn enter(&mut self, now: DateTime<Utc>) -> Result<u32, StateMachineError> {
        if self.status != StepStatus::Running {
            self.set_status(StepStatus::Running)?;
            self.attempts = 0;
            self.started_at = Some(now);
            self.finished_at = None;
            self.duration = None;
            self.error = None;
        }
        self.attempts += 1;
        Ok(self.attempts)
    }

    /// Mark the step as waiting on external input without making it active.
    /// A step finished on an earlier visit is re-armed as `pending`.
    pub(crate) fn await_input(&mut self, since: DateTime<Utc>) -> Result<(), StateMachineError> {
        if self.status == StepStatus::Completed {
            self.set_status(StepStatus::Pending)?;
        }
        self.started_at = Some(since);
        self.finished_at = None;
        self.duration = None;
        Ok(())
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) -> Result<(), StateMachineError> {
        self.set_status(StepStatus::Completed)?;
        self.error = None;
        self.finish_clock(now);
        Ok(())
    }

    pub(crate) fn fail(
        &mut self,
        now: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Result<(), StateMachineError> {
        self.set_status(StepStatus::Failed)?;
        self.error = Some(message.into());
        self.finish_clock(now);
        Ok(())
    }

    fn finish_clock(&mut self, now: DateTime<Utc>) {
        let started = self.started_at.unwrap_or(now);
        let elapsed = (now - started).num_milliseconds().max(0);
        self.duration = Some(elapsed as u64);
        self.finished_at = Some(now);
    }
}

/// Why a run ended in `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    /// A step unit raised an unrecoverable error
    StepFailed,
    /// A recoverable error persisted past the retry budget
    RetriesExhausted,
    /// No outgoing edge matched and no default exists
    NoMatchingEdge,
    /// An interruption stayed unresolved past its deadline
    ApprovalTimeout,
    /// A reviewer rejected a pause-before task step
    ApprovalRejected,
    /// Cancelled through the dashboard
    UserCancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Failure attribution: exactly one step per failed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    /// Why the run ended
    pub reason: FailureReason,
    /// Step the failure is attributed to
    pub step: StepId,
    /// Human-readable detail
    pub message: String,
    /// Set when a step unit error caused the failure
    pub kind: Option<StepErrorKind>,
}

/// One execution instance of a declared step graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    /// Immutable run id
    pub id: RunId,
    /// Definition being executed
    pub definition_id: DefinitionId,
    /// Lifecycle status
    pub status: RunStatus,
    /// 0-100, never decreases
    pub progress: u8,
    /// Step executing or awaiting input
    pub current_step: Option<StepId>,
    /// One record per declared step, in declaration order
    pub steps: Vec<StepRecord>,
    /// Latest result per completed step
    pub results: BTreeMap<StepId, Value>,
    /// Latest error message per step
    pub errors: BTreeMap<StepId, String>,
    /// Retries across all steps
    pub retry_count: u32,
    /// Steps this run pauses at
    pub interrupt_points: BTreeSet<StepId>,
    /// Payload given at creation
    pub input: Value,
    /// Latest reviewer decision per step
    pub decisions: BTreeMap<StepId, ApprovalRecord>,
    /// Set iff `interrupted`
    pub pending_interrupt: Option<PendingInterrupt>,
    /// Set iff `failed`
    pub failure: Option<Failure>,
    /// Cancel arrived while a step was in flight
    pub cancel_requested: bool,
    /// Pause takes effect at the next step boundary
    pub pause_requested: bool,
    /// Optimistic concurrency counter, bumped by the store on every save
    pub version: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last save
    pub updated_at: DateTime<Utc>,
    /// First `start`
    pub started_at: Option<DateTime<Utc>>,
    /// Entered a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    /// Every status change, hash-chained
    pub history: TransitionLog,
}

impl WorkflowRun {
    /// New `pending` run with one record per declared step.
    pub fn new(
        definition_id: DefinitionId,
        steps: Vec<StepRecord>,
        interrupt_points: BTreeSet<StepId>,
        input: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            definition_id,
            status: RunStatus::Pending,
            progress: 0,
            current_step: None,
            steps,
            results: BTreeMap::new(),
            errors: BTreeMap::new(),
            retry_count: 0,
            interrupt_points,
            input,
            decisions: BTreeMap::new(),
            pending_interrupt: None,
            failure: None,
            cancel_requested: false,
            pause_requested: false,
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            history: TransitionLog::default(),
        }
    }

    /// Record of step `id`
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.id.as_str() == id)
    }

    pub(crate) fn step_mut(&mut self, id: &str) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.id.as_str() == id)
    }

    /// Result stored for `step`
    #[must_use]
    pub fn result(&self, step: &str) -> Option<&Value> {
        self.results.get(step)
    }

    /// Latest decision recorded at `step`
    #[must_use]
    pub fn decision(&self, step: &str) -> Option<&ApprovalRecord> {
        self.decisions.get(step)
    }

    /// Steps whose record is currently `running`
    pub fn active_steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|s| s.is_active())
    }

    /// `completed` or `failed`
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Validate and apply a status change, recording it in the history.
    pub fn transition(
        &mut self,
        to: RunStatus,
        step: Option<&StepId>,
        detail: impl Into<String>,
    ) -> Result<(), StateMachineError> {
        state_machine::validate_transition(self.status, to)?;
        let now = Utc::now();
        self.history
            .append(now, step.cloned(), self.status, to, detail.into());
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.finished_at = Some(now);
            self.current_step = None;
            self.pending_interrupt = None;
            self.cancel_requested = false;
            self.pause_requested = false;
            if to == RunStatus::Completed {
                self.progress = 100;
            }
        }
        Ok(())
    }

    /// Raise `progress` to the completed share of declared steps. Only
    /// completion reports 100.
    pub fn recompute_progress(&mut self) {
        if self.steps.is_empty() {
            return;
        }
        let done = self.steps.iter().filter(|s| s.is_completed()).count();
        let pct = (done * 100 / self.steps.len()).min(99) as u8;
        self.progress = self.progress.max(pct);
    }
}
