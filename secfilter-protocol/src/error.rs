//! Error types for the section-filter API.

use thiserror::Error;

/// Errors returned by filter and session operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// Malformed or mismatched arguments.
    #[error("Bad parameter: {0}")]
    BadParam(String),

    /// Memory for a filter or buffer could not be obtained.
    #[error("Out of memory")]
    OutOfMemory,

    /// The concurrent filter limit has been reached.
    #[error("Out of filter handles (max: {max})")]
    OutOfHandles { max: usize },

    /// Unknown or closed filter/session.
    #[error("Invalid handle")]
    InvalidHandle,

    /// The demultiplexer is not available yet.
    #[error("Demultiplexer not ready")]
    NotReady,

    /// Operation is not valid in the filter's current state.
    #[error("Operation {operation} not allowed in state {state}")]
    WrongState {
        operation: &'static str,
        state: &'static str,
    },

    /// Generic failure.
    #[error("Failed: {0}")]
    Failed(String),
}

impl FilterError {
    /// Convenience constructor for [`FilterError::BadParam`].
    pub fn bad_param(msg: impl Into<String>) -> Self {
        FilterError::BadParam(msg.into())
    }

    /// Convenience constructor for [`FilterError::Failed`].
    pub fn failed(msg: impl Into<String>) -> Self {
        FilterError::Failed(msg.into())
    }

    /// Numeric result code for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            FilterError::BadParam(_) => ResultCode::BadParam,
            FilterError::OutOfMemory => ResultCode::OutOfMemory,
            FilterError::OutOfHandles { .. } => ResultCode::OutOfHandles,
            FilterError::InvalidHandle => ResultCode::InvalidHandle,
            FilterError::NotReady => ResultCode::NotReady,
            FilterError::WrongState { .. } => ResultCode::WrongState,
            FilterError::Failed(_) => ResultCode::Failed,
        }
    }
}

/// Result code reported to callers that work with numeric status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ResultCode {
    /// Operation succeeded.
    Success = 0x0000,
    /// Generic failure.
    Failed = 0x0001,
    /// Malformed or mismatched arguments.
    BadParam = 0x0002,
    /// Out of memory.
    OutOfMemory = 0x0003,
    /// Concurrent filter limit reached.
    OutOfHandles = 0x0004,
    /// Unknown or closed handle.
    InvalidHandle = 0x0005,
    /// Demultiplexer not ready.
    NotReady = 0x0006,
    /// Operation invalid in the current state.
    WrongState = 0x0007,
}

impl From<u16> for ResultCode {
    fn from(value: u16) -> Self {
        match value {
            0x0000 => ResultCode::Success,
            0x0002 => ResultCode::BadParam,
            0x0003 => ResultCode::OutOfMemory,
            0x0004 => ResultCode::OutOfHandles,
            0x0005 => ResultCode::InvalidHandle,
            0x0006 => ResultCode::NotReady,
            0x0007 => ResultCode::WrongState,
            _ => ResultCode::Failed,
        }
    }
}

impl From<ResultCode> for u16 {
    fn from(value: ResultCode) -> Self {
        value as u16
    }
}

impl<T> From<&Result<T, FilterError>> for ResultCode {
    fn from(result: &Result<T, FilterError>) -> Self {
        match result {
            Ok(_) => ResultCode::Success,
            Err(e) => e.code(),
        }
    }
}

impl ResultCode {
    /// Returns true if this code indicates success.
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}
