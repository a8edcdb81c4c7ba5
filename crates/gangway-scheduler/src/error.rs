//! Scheduler error types.

use thiserror::Error;

use gangway_placement::EvaluateError;
use gangway_state::GroupPhase;

/// Errors that can occur during gang scheduling operations.
///
/// Running out of capacity is not here: the evaluator reports it as a
/// normal outcome.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid group spec: {0}")]
    InvalidGroupSpec(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("request {request} not found in group {group}")]
    RequestNotFound { group: String, request: String },

    #[error("group {group} is {phase} and no longer accepts this change")]
    GroupClosed { group: String, phase: GroupPhase },

    #[error("group {group}: cannot move from {from} to {to}")]
    InvalidTransition {
        group: String,
        from: GroupPhase,
        to: GroupPhase,
    },

    #[error("group {group}: reservation on node {node} lost a race: {reason}")]
    PartialReservationConflict {
        group: String,
        node: String,
        reason: String,
    },

    #[error("group {group}: commit exceeded {timeout_ms}ms")]
    CommitTimedOut { group: String, timeout_ms: u64 },

    #[error("group {0} was cancelled before commit")]
    Cancelled(String),

    #[error("capacity oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("state store error: {0}")]
    State(#[from] gangway_state::StateError),
}

impl SchedulerError {
    /// Conflicts the controller absorbs by re-queueing the group.
    pub fn is_commit_conflict(&self) -> bool {
        matches!(
            self,
            SchedulerError::PartialReservationConflict { .. } | SchedulerError::CommitTimedOut { .. }
        )
    }
}

impl From<EvaluateError> for SchedulerError {
    fn from(e: EvaluateError) -> Self {
        match e {
            EvaluateError::OracleUnavailable { attempts, last } => {
                SchedulerError::OracleUnavailable(format!("{last} (after {attempts} attempts)"))
            }
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
