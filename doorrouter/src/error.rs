use std::time::Duration;

/// A rejected mutation. The connector rolls back and tries something else.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationFailure {
    #[error("{requirement} failed: {detail}")]
    Requirement { requirement: String, detail: String },

    #[error("impossible: {0}")]
    Impossible(String),

    #[error("no options: {0}")]
    NoOptions(String),

    #[error("point of no return: {0}")]
    NoReturn(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Validation(#[from] ValidationFailure),

    #[error("missing access point: {0}")]
    MissingAccessPoint(String),

    #[error("search budget exhausted after {iterations} iterations ({elapsed:?})")]
    BudgetExhausted { iterations: usize, elapsed: Duration },
}
