//! Finite state machine for a single host's lifecycle

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DeployError;
use crate::models::deployment::{HostId, LifecyclePhase};
use crate::models::result::FailureReason;

/// Where a host is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostPhase {
    /// Initial state, nothing run yet
    Idle,

    /// Running the hooks of a forward phase
    Running(LifecyclePhase),

    /// Every phase succeeded
    Succeeded,

    /// A hook did not succeed
    Failed,
}

impl HostPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HostPhase::Succeeded | HostPhase::Failed)
    }
}

impl fmt::Display for HostPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPhase::Idle => f.write_str("Idle"),
            HostPhase::Running(phase) => write!(f, "{}", phase),
            HostPhase::Succeeded => f.write_str("Succeeded"),
            HostPhase::Failed => f.write_str("Failed"),
        }
    }
}

/// Lifecycle event
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// Start running a phase's hooks
    Enter(LifecyclePhase),

    /// All hooks of the current phase succeeded
    PhaseSucceeded,

    /// The last phase succeeded
    Complete,

    /// A hook (or its preconditions) failed in the current phase
    Fail {
        hook: Option<String>,
        reason: FailureReason,
    },
}

/// What happened at a transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Entered,
    Succeeded,
    Failed {
        hook: Option<String>,
        reason: FailureReason,
    },
}

/// One entry of a host's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: HostPhase,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: TransitionOutcome,
}

/// Per-host deployment state.
///
/// Phases only move forward through [`LifecyclePhase::FORWARD`], one at a
/// time and never twice; `Failed` is reachable from any non-terminal state
/// and absorbs every later event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDeploymentState {
    host_id: HostId,
    current_phase: HostPhase,
    phase_complete: bool,
    history: Vec<PhaseTransition>,
}

impl HostDeploymentState {
    /// Create a new state machine in `Idle`
    pub fn new(host_id: HostId) -> Self {
        Self {
            host_id,
            current_phase: HostPhase::Idle,
            phase_complete: false,
            history: Vec::new(),
        }
    }

    pub fn host_id(&self) -> &HostId {
        &self.host_id
    }

    pub fn current_phase(&self) -> HostPhase {
        self.current_phase
    }

    pub fn history(&self) -> &[PhaseTransition] {
        &self.history
    }

    /// Phases entered so far, in order
    pub fn entered_phases(&self) -> Vec<LifecyclePhase> {
        self.history
            .iter()
            .filter_map(|t| match (t.phase, &t.outcome) {
                (HostPhase::Running(phase), TransitionOutcome::Entered) => Some(phase),
                _ => None,
            })
            .collect()
    }

    /// Whether `phase` was recorded as succeeded
    pub fn phase_succeeded(&self, phase: LifecyclePhase) -> bool {
        self.history.iter().any(|t| {
            t.phase == HostPhase::Running(phase) && t.outcome == TransitionOutcome::Succeeded
        })
    }

    /// The lifecycle phase the host was in when it failed
    pub fn failed_phase(&self) -> Option<LifecyclePhase> {
        self.history.iter().rev().find_map(|t| match (t.phase, &t.outcome) {
            (HostPhase::Running(phase), TransitionOutcome::Failed { .. }) => Some(phase),
            _ => None,
        })
    }

    /// The phase expected after the current one
    fn next_phase(&self) -> Option<LifecyclePhase> {
        match self.current_phase {
            HostPhase::Idle => LifecyclePhase::FORWARD.first().copied(),
            HostPhase::Running(current) if self.phase_complete => LifecyclePhase::FORWARD
                .iter()
                .skip_while(|p| **p != current)
                .nth(1)
                .copied(),
            _ => None,
        }
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: LifecycleEvent) -> Result<(), DeployError> {
        let (phase, outcome) = match (self.current_phase, &event) {
            (HostPhase::Succeeded | HostPhase::Failed, _) => {
                return Err(self.invalid(&event));
            }

            (_, LifecycleEvent::Enter(phase)) => {
                if self.next_phase() != Some(*phase) {
                    return Err(self.invalid(&event));
                }
                self.phase_complete = false;
                (HostPhase::Running(*phase), TransitionOutcome::Entered)
            }

            (HostPhase::Running(current), LifecycleEvent::PhaseSucceeded) if !self.phase_complete => {
                self.phase_complete = true;
                (HostPhase::Running(current), TransitionOutcome::Succeeded)
            }

            (HostPhase::Running(LifecyclePhase::ValidateService), LifecycleEvent::Complete)
                if self.phase_complete =>
            {
                (HostPhase::Succeeded, TransitionOutcome::Entered)
            }

            (current, LifecycleEvent::Fail { hook, reason }) => (
                current,
                TransitionOutcome::Failed {
                    hook: hook.clone(),
                    reason: reason.clone(),
                },
            ),

            _ => return Err(self.invalid(&event)),
        };

        self.history.push(PhaseTransition {
            phase,
            at: Utc::now(),
            outcome: outcome.clone(),
        });
        self.current_phase = match outcome {
            TransitionOutcome::Failed { .. } => HostPhase::Failed,
            _ => phase,
        };
        Ok(())
    }

    fn invalid(&self, event: &LifecycleEvent) -> DeployError {
        DeployError::InvalidTransition(format!(
            "{}: {} -> {:?}",
            self.host_id, self.current_phase, event
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_all(state: &mut HostDeploymentState) {
        for phase in LifecyclePhase::FORWARD {
            state.process(LifecycleEvent::Enter(phase)).unwrap();
            state.process(LifecycleEvent::PhaseSucceeded).unwrap();
        }
        state.process(LifecycleEvent::Complete).unwrap();
    }

    #[test]
    fn test_full_forward_run() {
        let mut state = HostDeploymentState::new(HostId::from("web-1"));
        assert_eq!(state.current_phase(), HostPhase::Idle);

        run_all(&mut state);

        assert_eq!(state.current_phase(), HostPhase::Succeeded);
        assert_eq!(state.entered_phases(), LifecyclePhase::FORWARD.to_vec());
        assert!(LifecyclePhase::FORWARD.iter().all(|p| state.phase_succeeded(*p)));
    }

    #[test]
    fn test_cannot_skip_or_reenter() {
        let mut state = HostDeploymentState::new(HostId::from("web-1"));
        assert!(state
            .process(LifecycleEvent::Enter(LifecyclePhase::ApplicationStop))
            .is_err());

        state
            .process(LifecycleEvent::Enter(LifecyclePhase::BeforeInstall))
            .unwrap();
        // Current phase not finished yet
        assert!(state
            .process(LifecycleEvent::Enter(LifecyclePhase::ApplicationStop))
            .is_err());
        state.process(LifecycleEvent::PhaseSucceeded).unwrap();
        assert!(state
            .process(LifecycleEvent::Enter(LifecyclePhase::BeforeInstall))
            .is_err());
        assert!(state.process(LifecycleEvent::PhaseSucceeded).is_err());
    }

    #[test]
    fn test_complete_requires_validate_service() {
        let mut state = HostDeploymentState::new(HostId::from("web-1"));
        state
            .process(LifecycleEvent::Enter(LifecyclePhase::BeforeInstall))
            .unwrap();
        state.process(LifecycleEvent::PhaseSucceeded).unwrap();
        assert!(state.process(LifecycleEvent::Complete).is_err());
    }

    #[test]
    fn test_failed_is_absorbing() {
        let mut state = HostDeploymentState::new(HostId::from("web-1"));
        state
            .process(LifecycleEvent::Enter(LifecyclePhase::BeforeInstall))
            .unwrap();
        state.process(LifecycleEvent::PhaseSucceeded).unwrap();
        state
            .process(LifecycleEvent::Enter(LifecyclePhase::ApplicationStop))
            .unwrap();
        state
            .process(LifecycleEvent::Fail {
                hook: Some("stop.sh".to_string()),
                reason: FailureReason::HookFailed { exit_code: Some(2) },
            })
            .unwrap();

        assert_eq!(state.current_phase(), HostPhase::Failed);
        assert_eq!(state.failed_phase(), Some(LifecyclePhase::ApplicationStop));
        assert!(state
            .process(LifecycleEvent::Enter(LifecyclePhase::AfterInstall))
            .is_err());
        assert!(state
            .process(LifecycleEvent::Fail {
                hook: None,
                reason: FailureReason::Cancelled,
            })
            .is_err());
    }

    #[test]
    fn test_history_serializes_flat() {
        let mut state = HostDeploymentState::new(HostId::from("web-1"));
        state
            .process(LifecycleEvent::Enter(LifecyclePhase::BeforeInstall))
            .unwrap();
        let json = serde_json::to_value(&state.history()[0]).unwrap();
        assert_eq!(json["outcome"], "entered");
        assert_eq!(json["phase"]["Running"], "BeforeInstall");
    }
}
