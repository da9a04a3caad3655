use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("TRANSIENT: {0}")]
    Transient(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INVALID_STATE: {0}")]
    InvalidState(String),
    #[error("CONFLICT: {0}")]
    Conflict(String),
    #[error("ACCOUNTING_LOSS: {elapsed_seconds}s for {demand_id} were not credited: {reason}")]
    AccountingLoss {
        demand_id: String,
        elapsed_seconds: u64,
        reason: String,
    },
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// Errors that a later reconciliation or a manual retry can clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Io(_))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Transient(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
