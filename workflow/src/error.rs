use std::fmt;

/// Result type for workflow storage and orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the workflow crate.
#[derive(Debug)]
pub enum Error {
    /// The underlying SQLite database failed.
    Storage(rusqlite::Error),
    /// Serializing or deserializing a JSON column failed.
    Serialization(serde_json::Error),
    /// No workflow exists with the given id.
    NotFound(String),
    /// A phase exceeded its configured timeout.
    Timeout { phase: String },
    /// A phase exhausted its retry budget.
    RetriesExhausted { phase: String, last_error: String },
    /// A signal was sent to a workflow that cannot accept it (e.g. resume on a completed workflow).
    InvalidSignal { workflow_id: String, signal: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Storage(err) => write!(f, "storage error: {}", err),
            Error::Serialization(err) => write!(f, "serialization error: {}", err),
            Error::NotFound(id) => write!(f, "no workflow with id '{}'", id),
            Error::Timeout { phase } => write!(f, "phase '{}' timed out", phase),
            Error::RetriesExhausted { phase, last_error } => {
                write!(f, "phase '{}' exhausted retries: {}", phase, last_error)
            }
            Error::InvalidSignal { workflow_id, signal } => write!(
                f,
                "signal '{}' is not valid for workflow '{}' in its current state",
                signal, workflow_id
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Storage(err) => Some(err),
            Error::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err)
    }
}
