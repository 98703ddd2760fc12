use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::error::{JourneyError, JourneyResult};
use crate::types::{AutomationStatus, EnrollmentStatus};

/// Describes a single valid state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition<S> {
    pub from: S,
    pub to: S,
    pub trigger: String,
}

/// Guards a lifecycle by enforcing a finite set of valid state transitions.
#[derive(Debug, Clone)]
pub struct StateMachine<S> {
    pub state: S,
    pub transitions: Vec<StateTransition<S>>,
}

impl<S: Copy + PartialEq + Debug> StateMachine<S> {
    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: &S, to: &S) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.to == *to)
    }

    /// Attempts to move the state machine to `to`. Returns an error if the
    /// transition is not permitted.
    pub fn transition(&mut self, to: S) -> JourneyResult<()> {
        if self.can_transition(&self.state, &to) {
            self.state = to;
            Ok(())
        } else {
            Err(JourneyError::InvalidTransition {
                from: format!("{:?}", self.state),
                to: format!("{:?}", to),
            })
        }
    }
}

fn edge<S>(from: S, to: S, trigger: &str) -> StateTransition<S> {
    StateTransition {
        from,
        to,
        trigger: trigger.to_string(),
    }
}

impl StateMachine<EnrollmentStatus> {
    /// Enrollment lifecycle: an active enrollment ends exactly once, in
    /// one of the three terminal states. Terminal states have no exits.
    pub fn enrollment(state: EnrollmentStatus) -> Self {
        Self {
            state,
            transitions: vec![
                edge(EnrollmentStatus::Active, EnrollmentStatus::Completed, "journey_complete"),
                edge(EnrollmentStatus::Active, EnrollmentStatus::Failed, "hard_step_failure"),
                edge(EnrollmentStatus::Active, EnrollmentStatus::Exited, "exit_requested"),
            ],
        }
    }
}

impl StateMachine<AutomationStatus> {
    /// Automation lifecycle: draft → active ⇄ paused.
    pub fn automation(state: AutomationStatus) -> Self {
        Self {
            state,
            transitions: vec![
                edge(AutomationStatus::Draft, AutomationStatus::Active, "activate"),
                edge(AutomationStatus::Active, AutomationStatus::Paused, "pause"),
                edge(AutomationStatus::Paused, AutomationStatus::Active, "resume"),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enrollment_terminal_states_are_final() {
        let mut machine = StateMachine::enrollment(EnrollmentStatus::Active);
        machine.transition(EnrollmentStatus::Completed).unwrap();
        assert!(machine.transition(EnrollmentStatus::Failed).is_err());
        assert!(machine.transition(EnrollmentStatus::Active).is_err());
        assert_eq!(machine.state, EnrollmentStatus::Completed);
    }

    #[test]
    fn test_automation_lifecycle() {
        let mut machine = StateMachine::automation(AutomationStatus::Draft);
        assert!(machine.transition(AutomationStatus::Paused).is_err());
        machine.transition(AutomationStatus::Active).unwrap();
        machine.transition(AutomationStatus::Paused).unwrap();
        machine.transition(AutomationStatus::Active).unwrap();
        assert!(machine.transition(AutomationStatus::Draft).is_err());
    }
}
