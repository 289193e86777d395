use std::sync::Arc;

use thiserror::Error;

use crate::param::ParamId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Server Error: {0}")]
    ServerError(String),

    #[error("Bad config error: {0}")]
    BadConfigError(String),

    #[error("Parameter {0} is not defined for this prepared statement")]
    UnknownParameter(ParamId),

    #[error("Required arguments for executing prepared statement mismatch: expected {expected}, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("Parameter {0} missing for executing prepared statement")]
    MissingParameter(ParamId),

    #[error("Connection went away and no restore factory is configured")]
    ConnectionLost,

    /// Shared by every call that was queued while the failed restore was in flight
    #[error("Failed to restore the connection: {0}")]
    RestoreFailed(Arc<Error>),

    #[error("Library bug: {0}")]
    LibraryBug(color_eyre::Report),
}

impl Error {
    /// The error a restore attempt failed with, if this is a `RestoreFailed`
    pub fn restore_cause(&self) -> Option<&Arc<Error>> {
        match self {
            Error::RestoreFailed(cause) => Some(cause),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
