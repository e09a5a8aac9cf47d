//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it gives one consistent way to report what can go
//! wrong during a sweep, from configuration problems to a stalled encoder.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: figment extraction failures and semantic
//!   validation failures of the loaded configuration. Fatal at startup.
//! - **`Connection`**: a device session could not be established. Fatal at
//!   startup; no acquisition is attempted.
//! - **`DeviceTimeout`**: a blocking device read exceeded its configured bound.
//!   Fatal to the current sweep.
//! - **`Transport`**: the device link failed mid-sweep (EOF, write error,
//!   closed session).
//! - **`MalformedResponse`**: the device answered, but not with the data the
//!   query promises (non-numeric scalar, wrong waveform length, broken block).
//! - **`Export`**: the sealed sweep cannot be written in the export schema.
//! - **`Cancelled`**: the operator stopped the sweep.
//! - **`InvalidState`**: the sweep state machine was driven out of order.
//! - **`ShutdownFailed`**: one or more device sessions failed to close after a
//!   sweep. Logged; it never replaces the sweep outcome.
//!
//! Undecodable encoder lines are not represented here: they are dropped by the
//! decoder (see [`crate::decoder::AngleDecodeError`]) and never abort a sweep.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type of the acquisition crate.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file or environment could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A device session could not be opened or failed its handshake.
    #[error("Failed to connect to {device}: {message}")]
    Connection {
        /// Device description (port or resource)
        device: String,
        /// Failure detail
        message: String,
    },

    /// A blocking device read did not complete within its bound.
    #[error("Timeout after {timeout:?} on {device} during {operation}")]
    DeviceTimeout {
        /// Device description
        device: String,
        /// Operation that stalled
        operation: String,
        /// Configured bound
        timeout: Duration,
    },

    /// Unrecoverable transport failure on an open session.
    #[error("Transport error on {device}: {message}")]
    Transport {
        /// Device description
        device: String,
        /// Failure detail
        message: String,
    },

    /// The device answered with data that does not match the query contract.
    #[error("Malformed response to '{command}': {response}")]
    MalformedResponse {
        /// Command or query that produced the response
        command: String,
        /// Description of the offending response
        response: String,
    },

    /// Export artifact could not be produced.
    #[error("Export error: {0}")]
    Export(String),

    /// Sweep cancelled by the operator.
    #[error("Sweep cancelled: {0}")]
    Cancelled(String),

    /// State machine misuse.
    #[error("Invalid sweep state: {0}")]
    InvalidState(String),

    /// Functionality compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Several teardown steps failed.
    #[error("Shutdown failed with errors: {0:?}")]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl From<csv::Error> for DaqError {
    fn from(err: csv::Error) -> Self {
        DaqError::Export(err.to_string())
    }
}

impl DaqError {
    /// Shorthand for a malformed-response error.
    pub(crate) fn malformed(command: impl Into<String>, response: impl Into<String>) -> Self {
        DaqError::MalformedResponse {
            command: command.into(),
            response: response.into(),
        }
    }

    /// Shorthand for a transport error.
    pub(crate) fn transport(device: impl Into<String>, message: impl ToString) -> Self {
        DaqError::Transport {
            device: device.into(),
            message: message.to_string(),
        }
    }
}
