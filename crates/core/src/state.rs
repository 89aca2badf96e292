//! Job lifecycle state machine.
//!
//! ```text
//! PENDING ──► RUNNING ──► SUCCEEDED
//!                │  ▲
//!                │  └──── RETRYING ──► FAILED
//!                ├──────► RETRYING
//!                └──────► FAILED
//!
//! PENDING | RUNNING | RETRYING ──► CANCELLED
//! ```
//!
//! Terminal states (`SUCCEEDED`, `FAILED`, `CANCELLED`) have no outgoing edges.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle state of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Created, waiting for its first delivery.
    Pending,
    /// Claimed by an executor that holds the lease.
    Running,
    /// Finished with a result.
    Succeeded,
    /// Finished with an error; no further attempts.
    Failed,
    /// Last attempt failed; waiting for redelivery.
    Retrying,
    /// Cancelled on request.
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Retrying,
        JobState::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Retrying)
                | (Retrying, Running)
                | (Retrying, Failed)
                | (Pending, Cancelled)
                | (Running, Cancelled)
                | (Retrying, Cancelled)
        )
    }

    /// Validate an edge, returning the typed domain error when it is illegal.
    pub fn ensure_transition(self, to: JobState) -> Result<(), DomainError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(DomainError::InvalidTransition { from: self, to })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Retrying => "RETRYING",
            JobState::Cancelled => "CANCELLED",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown job state: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in JobState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in JobState::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn success_and_failure_require_running() {
        assert!(!JobState::Pending.can_transition_to(JobState::Succeeded));
        assert!(!JobState::Pending.can_transition_to(JobState::Failed));
        assert!(!JobState::Retrying.can_transition_to(JobState::Succeeded));
        assert!(JobState::Running.can_transition_to(JobState::Succeeded));
    }

    #[test]
    fn every_non_terminal_state_can_be_cancelled() {
        for from in JobState::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(JobState::Cancelled));
        }
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("retrying".parse::<JobState>().unwrap(), JobState::Retrying);
        assert_eq!("RUNNING".parse::<JobState>().unwrap(), JobState::Running);
        assert!("paused".parse::<JobState>().is_err());
    }

    #[test]
    fn illegal_edge_reports_both_ends() {
        let err = JobState::Succeeded
            .ensure_transition(JobState::Running)
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: JobState::Succeeded,
                to: JobState::Running
            }
        );
    }

    fn any_state() -> impl Strategy<Value = JobState> {
        prop::sample::select(JobState::ALL.to_vec())
    }

    proptest! {
        // Any walk that only follows legal edges never leaves a terminal state
        // and never reaches SUCCEEDED/FAILED without passing through RUNNING.
        #[test]
        fn legal_walks_respect_the_machine(steps in prop::collection::vec(any_state(), 0..32)) {
            let mut current = JobState::Pending;
            let mut seen_running = false;
            for next in steps {
                if !current.can_transition_to(next) {
                    continue;
                }
                prop_assert!(!current.is_terminal());
                if next == JobState::Running {
                    seen_running = true;
                }
                if next == JobState::Succeeded || next == JobState::Failed {
                    prop_assert!(seen_running);
                }
                current = next;
            }
        }
    }
}
