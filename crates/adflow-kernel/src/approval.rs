//! Human approval gate
//!
//! An interrupted run waits here for a reviewer. `resume` records the decision
//! and hands the run back to the engine; the watchdog fails interruptions
//! that outlive their deadline.

use crate::engine::WorkflowEngine;
use crate::error::EngineError;
use crate::store::RunFilter;
use crate::types::{FailureReason, RunId, RunStatus, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Reviewer verdict on an interrupted step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    /// Take the gate's proceed branch
    Approve,
    /// Take the gate's rework branch
    Reject,
}

impl ApprovalDecision {
    /// Wire name, as used in results and requests
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalDecision::Approve => "approve",
            ApprovalDecision::Reject => "reject",
        }
    }
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(ApprovalDecision::Approve),
            "reject" => Ok(ApprovalDecision::Reject),
            other => Err(format!("unknown decision `{other}`")),
        }
    }
}

/// A decision as recorded on the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    /// What the reviewer chose
    pub decision: ApprovalDecision,
    /// Free-form reviewer comment
    pub note: Option<String>,
    /// When `resume` accepted the decision
    pub decided_at: DateTime<Utc>,
}

/// When an interrupt point pauses relative to its step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptMode {
    /// Pause before the step runs
    Before,
    /// Pause after the step completes, for review of its result
    After,
}

/// The open interruption of an `interrupted` run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInterrupt {
    /// Step the run is parked on
    pub step: StepId,
    /// Which side of the step the pause sits on
    pub mode: InterruptMode,
    /// When the run entered `interrupted`
    pub since: DateTime<Utc>,
    /// None when approval timeouts are disabled
    pub deadline: Option<DateTime<Utc>>,
}

impl PendingInterrupt {
    /// Past the deadline at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

enum ResumeOutcome {
    Resumed(StepId),
    Expired(StepId),
}

impl WorkflowEngine {
    /// Resolve the open interruption of `run_id` and continue driving it.
    ///
    /// Fails with `InvalidState` and leaves the run untouched unless it is
    /// `interrupted`. A resume arriving after the deadline fails the run and
    /// returns `ApprovalTimeout`.
    pub async fn resume(
        &self,
        run_id: RunId,
        decision: ApprovalDecision,
        note: Option<String>,
    ) -> Result<crate::types::WorkflowRun, EngineError> {
        let snapshot = self.store().load(run_id).await?;
        let registry = self.definition(&snapshot.definition_id)?;

        let (_, outcome) = self
            .update(run_id, |run| {
                let pending = match (&run.pending_interrupt, run.status) {
                    (Some(pending), RunStatus::Interrupted) => pending.clone(),
                    _ => {
                        return Err(EngineError::InvalidState {
                            run_id,
                            status: run.status,
                            operation: "resume",
                        })
                    }
                };
                let now = Utc::now();
                let step = pending.step.clone();

                if pending.is_expired(now) {
                    self.mark_failed(
                        run,
                        FailureReason::ApprovalTimeout,
                        &step,
                        format!("no decision for `{step}` before the approval deadline"),
                        None,
                    )?;
                    return Ok(ResumeOutcome::Expired(step));
                }

                run.decisions.insert(
                    step.clone(),
                    ApprovalRecord {
                        decision,
                        note: note.clone(),
                        decided_at: now,
                    },
                );
                run.pending_interrupt = None;
                let detail = format!("{decision} at `{step}`");

                let is_gate = registry
                    .step(step.as_str())
                    .is_some_and(|s| s.is_approval());
                if is_gate {
                    run.results.insert(
                        step.clone(),
                        json!({ "decision": decision, "note": note, "decidedAt": now }),
                    );
                    if let Some(record) = run.step_mut(step.as_str()) {
                        record.complete(now)?;
                    }
                    run.recompute_progress();
                    run.transition(RunStatus::Running, Some(&step), detail)?;
                    self.route(&registry, run, &step)?;
                } else {
                    match (pending.mode, decision) {
                        (InterruptMode::Before, ApprovalDecision::Approve) => {
                            run.transition(RunStatus::Running, Some(&step), detail)?;
                        }
                        (InterruptMode::Before, ApprovalDecision::Reject) => {
                            self.mark_failed(
                                run,
                                FailureReason::ApprovalRejected,
                                &step,
                                format!("execution of `{step}` rejected by reviewer"),
                                None,
                            )?;
                        }
                        (InterruptMode::After, _) => {
                            run.transition(RunStatus::Running, Some(&step), detail)?;
                            self.route(&registry, run, &step)?;
                        }
                    }
                }
                Ok(ResumeOutcome::Resumed(step))
            })
            .await?;

        match outcome {
            ResumeOutcome::Expired(step) => {
                error!(run_id = %run_id, step = %step, "resume arrived after approval deadline");
                Err(EngineError::ApprovalTimeout { run_id, step })
            }
            ResumeOutcome::Resumed(step) => {
                info!(run_id = %run_id, step = %step, %decision, "run resumed");
                self.drive(run_id).await
            }
        }
    }

    /// Fail every interrupted run whose deadline has passed at `now`.
    pub async fn expire_overdue_approvals(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RunId>, EngineError> {
        let waiting = self
            .store()
            .list(&RunFilter::default().with_status(RunStatus::Interrupted))
            .await?;

        let mut expired = Vec::new();
        for candidate in waiting {
            let overdue = candidate
                .pending_interrupt
                .as_ref()
                .is_some_and(|p| p.is_expired(now));
            if !overdue {
                continue;
            }
            let (_, failed) = self
                .update(candidate.id, |run| {
                    let Some(pending) = run.pending_interrupt.clone() else {
                        return Ok(false);
                    };
                    if run.status != RunStatus::Interrupted || !pending.is_expired(now) {
                        return Ok(false);
                    }
                    self.mark_failed(
                        run,
                        FailureReason::ApprovalTimeout,
                        &pending.step,
                        format!("no decision for `{}` before the approval deadline", pending.step),
                        None,
                    )?;
                    Ok(true)
                })
                .await?;
            if failed {
                warn!(run_id = %candidate.id, "approval deadline passed, run failed");
                expired.push(candidate.id);
            }
        }
        Ok(expired)
    }

    /// Periodically expire overdue approvals until the handle is aborted.
    pub fn spawn_approval_watchdog(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config().watchdog_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.expire_overdue_approvals(Utc::now()).await {
                    Ok(expired) if !expired.is_empty() => {
                        info!(count = expired.len(), "approval sweep expired runs");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "approval sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn decision_parses_wire_names() {
        assert_eq!("approve".parse::<ApprovalDecision>().unwrap(), ApprovalDecision::Approve);
        assert_eq!("reject".parse::<ApprovalDecision>().unwrap(), ApprovalDecision::Reject);
        assert!("maybe".parse::<ApprovalDecision>().is_err());
        assert_eq!(serde_json::to_value(ApprovalDecision::Reject).unwrap(), "reject");
    }

    #[test]
    fn deadline_expiry() {
        let since = Utc::now();
        let pending = PendingInterrupt {
            step: "review".into(),
            mode: InterruptMode::Before,
            since,
            deadline: Some(since + Duration::seconds(10)),
        };
        assert!(!pending.is_expired(since));
        assert!(pending.is_expired(since + Duration::seconds(10)));

        let open_ended = PendingInterrupt {
            deadline: None,
            ..pending
        };
        assert!(!open_ended.is_expired(since + Duration::days(365)));
    }
}
