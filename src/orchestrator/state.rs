//! Run state machine.
//!
//! `Queued → Recon → Analyze → Exploit → Patch → Report → Completed`, with
//! `Failed` reachable from every non-terminal state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::ReasonCode;
use crate::store::models::{Phase, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum RunState {
    Queued,
    InPhase(Phase),
    Completed,
    Failed(ReasonCode),
}

/// Inputs that move a run between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The current phase finished (or the run left the queue).
    Advance,
    Fail(ReasonCode),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::InPhase(phase) => Some(*phase),
            _ => None,
        }
    }

    /// Persisted run status for this state.
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Queued => RunStatus::Queued,
            Self::InPhase(_) => RunStatus::Running,
            Self::Completed => RunStatus::Completed,
            Self::Failed(_) => RunStatus::Failed,
        }
    }

    /// Apply a transition. Terminal states accept nothing.
    pub fn apply(self, transition: Transition) -> Result<Self, String> {
        match (self, transition) {
            (Self::Completed | Self::Failed(_), _) => Err(format!("run is already {}", self)),
            (_, Transition::Fail(reason)) => Ok(Self::Failed(reason)),
            (Self::Queued, Transition::Advance) => Ok(Self::InPhase(Phase::first())),
            (Self::InPhase(phase), Transition::Advance) => {
                Ok(phase.next().map_or(Self::Completed, Self::InPhase))
            }
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => f.write_str("queued"),
            Self::InPhase(phase) => write!(f, "{}", phase),
            Self::Completed => f.write_str("completed"),
            Self::Failed(reason) => write!(f, "failed({})", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_path_visits_every_phase_in_order() {
        let mut state = RunState::Queued;
        let mut visited = Vec::new();
        while !state.is_terminal() {
            state = state.apply(Transition::Advance).unwrap();
            if let Some(phase) = state.phase() {
                visited.push(phase);
            }
        }
        assert_eq!(state, RunState::Completed);
        assert_eq!(visited, Phase::ALL.to_vec());
    }

    #[test]
    fn test_failure_is_reachable_from_every_non_terminal_state() {
        let mut states = vec![RunState::Queued];
        states.extend(Phase::ALL.iter().map(|p| RunState::InPhase(*p)));
        for state in states {
            let failed = state.apply(Transition::Fail(ReasonCode::Cancelled)).unwrap();
            assert_eq!(failed, RunState::Failed(ReasonCode::Cancelled));
            assert_eq!(failed.status(), RunStatus::Failed);
        }
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        assert!(RunState::Completed.apply(Transition::Advance).is_err());
        let failed = RunState::Failed(ReasonCode::QuotaExceeded);
        assert!(failed.apply(Transition::Fail(ReasonCode::Cancelled)).is_err());
        assert!(failed.apply(Transition::Advance).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(RunState::Queued.status(), RunStatus::Queued);
        assert_eq!(RunState::InPhase(Phase::Exploit).status(), RunStatus::Running);
        assert_eq!(RunState::InPhase(Phase::Exploit).to_string(), "exploit");
        assert_eq!(RunState::Failed(ReasonCode::Interrupted).to_string(), "failed(interrupted)");
    }
}
