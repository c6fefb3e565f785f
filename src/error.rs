use crate::schedule::TimeWindowStatus;

/// Caller-visible outcomes of the attendance engine. All of these are
/// recoverable: the daemon reports them over IPC and keeps running.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("attendance cannot be opened while the class is {status}")]
    IneligibleWindow { status: TimeWindowStatus },

    #[error("an active session already exists for this class")]
    AlreadyActive { session_id: String },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("session is already closed")]
    AlreadyClosed,

    #[error("no session matches that token or code")]
    UnknownCredential,

    #[error("the attendance window is closed")]
    WindowClosed,

    #[error("attendance is already recorded for this student")]
    AlreadyRecorded,

    #[error("a determination already exists for this student")]
    Conflict,

    #[error("could not allocate a distinct session code after {0} attempts")]
    CodeAllocation(usize),

    #[error("{0}")]
    BadInput(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl EngineError {
    /// Stable IPC error code for this outcome.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::IneligibleWindow { .. } => "ineligible_window",
            EngineError::AlreadyActive { .. } => "already_active",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyClosed => "already_closed",
            EngineError::UnknownCredential => "unknown_credential",
            EngineError::WindowClosed => "window_closed",
            EngineError::AlreadyRecorded => "already_recorded",
            EngineError::Conflict => "conflict",
            EngineError::CodeAllocation(_) => "code_allocation_failed",
            EngineError::BadInput(_) => "bad_params",
            EngineError::Storage(_) => "storage_failed",
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}
