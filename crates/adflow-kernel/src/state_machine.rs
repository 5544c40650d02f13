use crate::error::StateMachineError;
use crate::types::{RunStatus, StepId, StepStatus};

/// Validates a run status transition.
///
/// With the `strict-debug` feature an illegal transition panics so the
/// offending call site shows up in the backtrace.
pub fn validate_transition(from: RunStatus, to: RunStatus) -> Result<(), StateMachineError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("Illegal run transition attempted: {from:?} -> {to:?}");

        #[cfg(not(feature = "strict-debug"))]
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

/// Run statuses reachable from `from`
pub fn allowed_transitions(from: RunStatus) -> Vec<RunStatus> {
    use RunStatus::*;
    match from {
        Pending => vec![Running, Failed],
        // running -> running: next step or retry of the same step
        Running => vec![Running, Paused, Interrupted, Completed, Failed],
        Paused => vec![Running, Failed],
        Interrupted => vec![Running, Failed],
        Completed => vec![],
        Failed => vec![],
    }
}

/// Validates a step record transition.
pub fn validate_step_transition(
    step: &StepId,
    from: StepStatus,
    to: StepStatus,
) -> Result<(), StateMachineError> {
    if allowed_step_transitions(from).contains(&to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("Illegal step transition attempted on {step}: {from:?} -> {to:?}");

        #[cfg(not(feature = "strict-debug"))]
        Err(StateMachineError::IllegalStepTransition {
            step: step.clone(),
            from,
            to,
        })
    }
}

/// Step statuses reachable from `from`
pub fn allowed_step_transitions(from: StepStatus) -> Vec<StepStatus> {
    use StepStatus::*;
    match from {
        // pending -> completed: approval gate resolved; pending -> failed:
        // run cancelled or timed out before the step ran
        Pending => vec![Running, Completed, Failed],
        Running => vec![Completed, Failed],
        // rework branch re-enters a finished step, or re-arms it as an
        // interrupt point
        Completed => vec![Running, Pending],
        Failed => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_sinks() {
        for status in RunStatus::ALL {
            if status.is_terminal() {
                assert!(allowed_transitions(status).is_empty());
            }
        }
    }

    #[test]
    fn approval_loop_is_allowed() {
        assert!(validate_transition(RunStatus::Running, RunStatus::Interrupted).is_ok());
        assert!(validate_transition(RunStatus::Interrupted, RunStatus::Running).is_ok());
        assert!(validate_transition(RunStatus::Interrupted, RunStatus::Completed).is_err());
    }

    #[test]
    fn pending_cannot_complete_directly() {
        assert!(matches!(
            validate_transition(RunStatus::Pending, RunStatus::Completed),
            Err(StateMachineError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn failed_step_is_final() {
        let id = StepId::from("a");
        assert!(validate_step_transition(&id, StepStatus::Failed, StepStatus::Running).is_err());
        assert!(validate_step_transition(&id, StepStatus::Completed, StepStatus::Running).is_ok());
    }
}
