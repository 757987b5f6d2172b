//! Retry and fallback decisions after a failed attempt.
//!
//! | error                         | condition                          | step       |
//! |-------------------------------|------------------------------------|------------|
//! | store or working-dir failure  | always                             | Fail       |
//! | text mentions "resume"        | session was resumed, no retry yet  | RetryFresh |
//! | any                           | orchestrated, not yet fallen back  | FallBack   |
//! | any                           | otherwise                          | Fail       |

use crate::error::RunError;
use crate::worker::runner::AgentKind;

/// What the supervisor knows about the attempt that just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptState {
    pub kind: AgentKind,
    /// The attempt passed `--resume`.
    pub resumed: bool,
    pub retried_fresh: bool,
    pub fell_back: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Clear the session handle and run the same strategy without resume.
    RetryFresh,
    /// Switch to the direct strategy.
    FallBack,
    /// Record the error and stop.
    Fail,
}

pub fn next_step(err: &RunError, state: &AttemptState) -> Step {
    if matches!(err, RunError::Store(_) | RunError::Workdir(_)) {
        return Step::Fail;
    }
    if state.resumed && !state.retried_fresh && err.mentions_resume() {
        return Step::RetryFresh;
    }
    if state.kind == AgentKind::Orchestrated && !state.fell_back {
        return Step::FallBack;
    }
    Step::Fail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseError;

    fn state(kind: AgentKind, resumed: bool) -> AttemptState {
        AttemptState {
            kind,
            resumed,
            retried_fresh: false,
            fell_back: false,
        }
    }

    fn resume_err() -> RunError {
        RunError::Exited {
            code: Some(1),
            stderr: "No conversation found with session ID; cannot resume".into(),
        }
    }

    fn other_err() -> RunError {
        RunError::Agent("rate limited".into())
    }

    #[test]
    fn resume_failure_retries_fresh_once() {
        let mut s = state(AgentKind::Direct, true);
        assert_eq!(next_step(&resume_err(), &s), Step::RetryFresh);

        s.retried_fresh = true;
        s.resumed = false;
        assert_eq!(next_step(&resume_err(), &s), Step::Fail);
    }

    #[test]
    fn resume_text_without_resumed_session_does_not_retry() {
        let s = state(AgentKind::Direct, false);
        assert_eq!(next_step(&resume_err(), &s), Step::Fail);
    }

    #[test]
    fn orchestrated_failure_falls_back_once() {
        let mut s = state(AgentKind::Orchestrated, false);
        assert_eq!(next_step(&other_err(), &s), Step::FallBack);

        s.kind = AgentKind::Direct;
        s.fell_back = true;
        assert_eq!(next_step(&other_err(), &s), Step::Fail);
    }

    #[test]
    fn resume_takes_precedence_over_fallback() {
        let s = state(AgentKind::Orchestrated, true);
        assert_eq!(next_step(&resume_err(), &s), Step::RetryFresh);
    }

    #[test]
    fn orchestrated_resume_retry_failure_still_falls_back() {
        let s = AttemptState {
            kind: AgentKind::Orchestrated,
            resumed: false,
            retried_fresh: true,
            fell_back: false,
        };
        assert_eq!(next_step(&other_err(), &s), Step::FallBack);
    }

    #[test]
    fn direct_failure_is_final() {
        let s = state(AgentKind::Direct, false);
        assert_eq!(next_step(&other_err(), &s), Step::Fail);
    }

    #[test]
    fn infrastructure_errors_fail_immediately() {
        let s = state(AgentKind::Orchestrated, true);
        let store = RunError::Store(DatabaseError::Query("resume table locked".into()));
        assert_eq!(next_step(&store, &s), Step::Fail);
        assert_eq!(next_step(&RunError::Workdir("/gone".into()), &s), Step::Fail);
    }
}
