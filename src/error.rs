//! Custom error types for the application.
//!
//! `ControlError` consolidates the error sources of the control devices:
//! configuration parsing, middleware (remote device) failures, operator
//! input validation, and cancelled fan-out calls. Background loops never
//! let these escape the process; they are counted against a failure budget
//! and surfaced through the device state instead (see [`crate::fusion`]).

use crate::middleware::{DeviceState, MiddlewareError};
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ControlError>;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Middleware(#[from] MiddlewareError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cancelled {0}")]
    Cancelled(String),

    #[error("Slot '{slot}' not allowed in state {state}")]
    NotAllowed { slot: String, state: DeviceState },

    #[error("Power Procedure not available")]
    PowerProcedureUnavailable,

    #[error("Measurement aborted")]
    Aborted,

    #[error("Device actor is gone")]
    ActorGone,
}
