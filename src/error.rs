//! Error types for lanekeeper.

use thiserror::Error;

use crate::model::LaneStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("lane not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: LaneStatus, to: LaneStatus },

    /// Another administrative client holds the lease for this operation
    /// type. Retryable with backoff, not a failure.
    #[error("operation {op_type} already in progress")]
    LockBusy { op_type: String },

    #[error("refused: {0}")]
    Refused(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
