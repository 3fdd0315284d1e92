use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::segment::{RequesterId, Status};

pub type Result<T> = std::result::Result<T, ScanError>;

/// Everything that can go wrong between a requester and the compute side.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Bad arguments, unreadable data or a malformed request record.
    #[error("invalid input: {0}")]
    Input(String),

    /// A segment, channel or worker pool could not be obtained.
    #[error("{context}: {source}")]
    Resource {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("no shared segment registered for requester {0}")]
    NotFound(RequesterId),

    #[error("index {index} out of range for {len} elements")]
    Range { index: usize, len: usize },

    #[error("segment of requester {0} was destroyed")]
    UseAfterFree(RequesterId),

    #[error("illegal status transition {from:?} -> {to:?}")]
    InvalidTransition { from: Status, to: Status },

    #[error("segment is {actual:?}, operation needs {expected:?}")]
    WrongStatus { expected: Status, actual: Status },

    #[error("segment {path} is corrupt: {reason}")]
    CorruptSegment { path: PathBuf, reason: String },

    #[error("no result after {0:?}")]
    Timeout(Duration),
}

impl ScanError {
    pub(crate) fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    pub(crate) fn resource(context: impl Into<String>, source: io::Error) -> Self {
        Self::Resource {
            context: context.into(),
            source,
        }
    }
}
