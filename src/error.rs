//! Error types for msgbus-rs.

use thiserror::Error;

use crate::envelope::DecodeError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue does not exist: {0}")]
    QueueNotFound(String),

    #[error("no handler registered for queue: {0}")]
    HandlerNotFound(String),

    #[error("handler already registered for queue: {0}")]
    HandlerConflict(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Infrastructure failures worth retrying at the backend-call level.
    ///
    /// Never counted against a message's `attempt`.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Backend(_) | Error::Io(_) => true,
            Error::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
