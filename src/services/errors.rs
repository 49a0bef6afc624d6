use thiserror::Error;

use crate::services::oracle::OracleError;
use crate::store::StoreError;

/// Preconditions checked before a session or job is created.
#[derive(Debug, Clone, PartialEq, Error)]
pub(crate) enum Precondition {
    #[error("insufficient training data: {found} training annotations, {required} required")]
    InsufficientTrainingData { required: u32, found: i64 },
    #[error("no active model for template")]
    NoActiveModel,
    #[error("sheet {sheet_id} is not ready for grading ({reason})")]
    SheetNotReady { sheet_id: String, reason: String },
}

#[derive(Debug, Error)]
pub(crate) enum GradingError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Precondition(#[from] Precondition),
    #[error("oracle failure: {0}")]
    Oracle(#[from] OracleError),
    #[error("{0}")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("store failure: {0}")]
    Store(StoreError),
}

impl From<StoreError> for GradingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(entity) => GradingError::NotFound(entity),
            StoreError::Conflict(message) => GradingError::Conflict(message),
            other => GradingError::Store(other),
        }
    }
}

impl GradingError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        GradingError::Validation(message.into())
    }
}
