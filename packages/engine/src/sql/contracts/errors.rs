use crate::{ErrorKind, LixError};

/// Typed planner failures. `Invariant` marks a violated rewrite
/// postcondition and is always a bug rather than a user error.
#[derive(Debug)]
pub(crate) enum PlannerError {
    Parse(String),
    Unsupported(String),
    Invariant(String),
}

impl PlannerError {
    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }
}

impl From<PlannerError> for LixError {
    fn from(value: PlannerError) -> Self {
        match value {
            PlannerError::Parse(message) => LixError::new(ErrorKind::Parse, message),
            PlannerError::Unsupported(message) => LixError::new(ErrorKind::Parse, message),
            PlannerError::Invariant(message) => {
                LixError::new(ErrorKind::PlannerInvariant, message)
            }
        }
    }
}

impl From<LixError> for PlannerError {
    fn from(value: LixError) -> Self {
        match value.kind {
            ErrorKind::PlannerInvariant => PlannerError::Invariant(value.message),
            _ => PlannerError::Parse(value.message),
        }
    }
}

/// Executor failures keep post-commit effect errors distinct: those report
/// without invalidating the committed state.
#[derive(Debug)]
pub(crate) enum ExecutorError {
    Execute(LixError),
    PostCommit { effect_id: String, error: LixError },
}

impl From<LixError> for ExecutorError {
    fn from(value: LixError) -> Self {
        Self::Execute(value)
    }
}

impl From<ExecutorError> for LixError {
    fn from(value: ExecutorError) -> Self {
        match value {
            ExecutorError::Execute(error) => error,
            ExecutorError::PostCommit { effect_id, error } => LixError::new(
                ErrorKind::Io,
                format!("post-commit effect '{effect_id}' failed: {error}"),
            ),
        }
    }
}
