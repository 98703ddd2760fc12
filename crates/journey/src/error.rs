use thiserror::Error;
use uuid::Uuid;

use crate::collaborators::{EffectError, EffectErrorKind};
use crate::graph::StepId;

pub type JourneyResult<T> = Result<T, JourneyError>;

#[derive(Error, Debug)]
pub enum JourneyError {
    /// Authoring-time rejection of a trigger config, predicate or step graph.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// A predicate could not be evaluated against its document.
    #[error("Predicate evaluation error: {0}")]
    Predicate(String),

    /// Non-fatal: the dispatcher treats it as a non-match.
    #[error("Trigger predicate error: {0}")]
    TriggerPredicate(String),

    /// Expected under concurrency: another worker owns the row.
    #[error("Enrollment {0} is claimed by another worker")]
    ClaimConflict(Uuid),

    #[error("Step effect failed ({kind}): {message}")]
    StepEffect {
        kind: EffectErrorKind,
        message: String,
    },

    #[error("Outcome of step {step} for enrollment {enrollment} is unknown")]
    UnknownOutcome { enrollment: Uuid, step: StepId },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error(transparent)]
    Core(#[from] eventdesk_core::CoreError),
}

impl JourneyError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        JourneyError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        JourneyError::Validation(message.into())
    }
}

impl From<EffectError> for JourneyError {
    fn from(err: EffectError) -> Self {
        JourneyError::StepEffect {
            kind: err.kind,
            message: err.message,
        }
    }
}
