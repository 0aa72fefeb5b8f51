//! Usage errors raised by stream operations.
//!
//! These indicate programmer error and are returned synchronously from the
//! offending call. Runtime failures (a write that could not be completed, a
//! stream closed because of an I/O error) are never returned here; they are
//! carried as [`anyhow::Error`] values through the completion and close
//! callbacks instead.

use thiserror::Error;

/// Result type alias for stream operations that can fail on misuse.
pub type FlowResult<T> = Result<T, FlowError>;

/// Errors returned when a stream is used outside its protocol.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("attempt to push data to paused readable stream")]
    PushWhilePaused,

    #[error("survive() can only be called from the on_closing callback")]
    SurviveOutsideClosing,

    #[error("write request {0} was already completed")]
    AlreadyCompleted(u64),

    #[error("invalid stream configuration: {0}")]
    Config(String),
}
