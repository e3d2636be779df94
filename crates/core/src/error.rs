//! Runtime Error Model
//!
//! Core operations fail in one of two ways:
//!
//! - **Direct path**: return `Result<_, RtError>` and propagate with `?`.
//! - **Non-direct path**: return the error sentinel `Value::ERROR` and park
//!   the error in the thread's pending-exception slot (see `ThreadCtx`).
//!   This is used where a `Value` must be threaded through deeply nested
//!   allocation paths.
//!
//! The collector never catches errors except at a single boundary: forced
//! collection is suppressed while mark work is executing.

use thiserror::Error;

/// Error kinds visible from the core runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RtError {
    /// Allocation could not be satisfied even after a forced collection.
    #[error("out of memory")]
    Memory,

    /// Invalid argument to a core operation.
    #[error("ValueError: {0}")]
    Value(String),

    /// Wrong value kind for an operation.
    #[error("TypeError: {0}")]
    Type(String),

    /// Out-of-range index.
    #[error("IndexError: {0}")]
    Index(String),

    /// An internal invariant would be violated.
    #[error("RuntimeError: {0}")]
    Runtime(String),

    /// A codec reported an invalid byte sequence in strict mode.
    #[error("DecodeError: {0}")]
    Decode(String),

    /// A codec could not represent a character in strict mode.
    #[error("EncodeError: {0}")]
    Encode(String),

    /// Keyboard interrupt delivered at a safe point.
    #[error("interrupt")]
    Interrupt,
}

impl RtError {
    /// Shorthand constructors used throughout the runtime.
    pub fn value(msg: impl Into<String>) -> RtError {
        RtError::Value(msg.into())
    }

    pub fn type_error(msg: impl Into<String>) -> RtError {
        RtError::Type(msg.into())
    }

    pub fn index(msg: impl Into<String>) -> RtError {
        RtError::Index(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> RtError {
        RtError::Runtime(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> RtError {
        RtError::Decode(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> RtError {
        RtError::Encode(msg.into())
    }
}
