use thiserror::Error;

/// Error taxonomy for the scheduling core. Interactive callers see these
/// verbatim; the sweep treats `RunSkipped` as benign and swallows the rest
/// at the per-schedule boundary.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// The occurrence was explicitly skipped; a no-op for the sweep.
    #[error("occurrence {schedule_id} @ {run_date} is skipped")]
    RunSkipped {
        schedule_id: String,
        run_date: String,
    },

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Stable error code for the IPC envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_failed",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::RunSkipped { .. } => "run_skipped",
            Self::Storage(_) => "db_error",
        }
    }
}
