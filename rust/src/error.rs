use std::io;

use thiserror::Error;

/// Errors produced by the block data layer.
///
/// The enum is `Clone` so that a terminal result can be handed to every
/// waiter of a write session or coalesced remote read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridFsError {
    #[error("io error occurred while reading from a secondary source")]
    IOError(String),
    #[error("not enough space reserved to store data")]
    OverCapacity(String),
    #[error("maximum data size exceeded")]
    OutOfSpace(String),
    #[error("no previous block data found for partial update")]
    MissingBlockData(String),
    #[error("affinity range is too wide")]
    RangeTooWide(String),
    #[error("write failed on node")]
    NodeFailure(String),
    #[error("cache operation failed")]
    CacheError(String),
    #[error("transport operation failed")]
    TransportError(String),
    #[error("operation was cancelled")]
    Cancelled(String),
    #[error("internal error, this shouldn't happen")]
    InternalError(String),
}

impl From<io::Error> for GridFsError {
    fn from(value: io::Error) -> Self {
        GridFsError::IOError(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GridFsError>;
