//! Custom error types for the crate.
//!
//! This module defines the primary error type, `ScanError`, using the
//! `thiserror` crate. The taxonomy separates local validation failures,
//! which reject a command before any hardware write is attempted, from
//! transport failures, which abort the in-progress convergence loop and
//! the enclosing scan:
//!
//! - **`InvalidMode`**: a voltage command was issued in closed-loop mode or a
//!   position command in open-loop mode. Non-retryable; the single command is
//!   rejected and the device is untouched.
//! - **`OutOfRange`**: a command value falls outside `[0, limit]`. Rejected
//!   without touching hardware.
//! - **`Transport`**: a serial write or read failed. Not retried here; the
//!   scan tears down (outputs disabled, sink closed) and the error propagates.
//! - **`Unconverged`**: only produced when the convergence policy is set to
//!   treat an unconverged axis move as an error rather than returning the
//!   last reading.
//!
//! `Io` and `Csv` wrap the result sink's file-level failures via `#[from]`,
//! so sink code can use the `?` operator directly.

use crate::protocol::AxisMode;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AptResult<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("command requires {required} mode but controller is in {actual} mode")]
    InvalidMode { required: AxisMode, actual: AxisMode },

    #[error("{what} {value} outside [0, {limit}]")]
    OutOfRange {
        what: &'static str,
        value: f64,
        limit: f64,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("device not connected")]
    NotConnected,

    #[error("axis did not converge within {iterations} iterations (last reading {reading} counts)")]
    Unconverged { iterations: u32, reading: i16 },

    #[error("invalid scan plan: {0}")]
    Plan(String),

    #[error("scan worker failed: {0}")]
    Worker(String),

    #[error("result sink is not open")]
    SinkClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}
