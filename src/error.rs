//! Error types for the datacenter-monitor-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The radio is not available, powered off, or unsupported on this system.
    #[error("Bluetooth radio unavailable or disabled")]
    RadioUnavailable,

    /// The platform refused the runtime permission needed for scanning.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// No peripheral advertising the monitor service was seen within the scan window.
    #[error("No peripheral advertising {service} found")]
    NotFound {
        /// The service UUID that was scanned for.
        service: String,
    },

    /// The connection attempt failed before a session was established.
    #[error("Connection failed: {reason}")]
    ConnectFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The peripheral does not expose the expected service or characteristics.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the missing service or characteristic.
        uuid: String,
    },

    /// Characteristic not found on the connected peripheral.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// A payload was shorter than the field being decoded.
    #[error("Malformed payload: need {expected} bytes, got {actual}")]
    MalformedPayload {
        /// Number of bytes the decoder needed.
        expected: usize,
        /// Number of bytes actually received.
        actual: usize,
    },

    /// The transport rejected the operation or completed it with a non-success status.
    #[error("Operation failed with status {status:#04x}")]
    OperationFailed {
        /// The GATT status code reported by the transport.
        status: u8,
    },

    /// An operation did not complete within its timeout.
    #[error("Operation timed out")]
    TimedOut,

    /// An operation or scan was cancelled, usually by a disconnect.
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation requires a session but none is connected.
    #[error("Peripheral not connected")]
    NotConnected,

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert a btleplug error, surfacing permission problems as their own variant.
    pub fn from_btleplug(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => Error::PermissionDenied,
            other => Error::Bluetooth(other),
        }
    }

    /// Whether the shell should offer the user a retry for this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::ConnectFailed { .. }
                | Error::ServiceNotFound { .. }
                | Error::RadioUnavailable
                | Error::PermissionDenied
                | Error::TimedOut
        )
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
