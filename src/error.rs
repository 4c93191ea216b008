//! Error types for the ble-session crate.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::ble::types::{DeviceId, RadioState};
use crate::session::registry::SessionId;

/// Opaque failure reported by the radio stack.
///
/// The core never interprets or retries these; the cause is kept only for
/// diagnostics. Two hardware errors compare equal when they render the same
/// message.
#[derive(Clone)]
pub struct HardwareError {
    cause: Arc<dyn std::error::Error + Send + Sync + 'static>,
}

impl HardwareError {
    /// Wrap an underlying driver error.
    pub fn new<E>(cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            cause: Arc::new(cause),
        }
    }

    /// Build a hardware error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// The underlying cause.
    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.cause.as_ref()
    }
}

impl fmt::Debug for HardwareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HardwareError")
            .field(&self.cause.to_string())
            .finish()
    }
}

impl fmt::Display for HardwareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.cause, f)
    }
}

impl std::error::Error for HardwareError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

impl PartialEq for HardwareError {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cause, &other.cause) || self.cause.to_string() == other.cause.to_string()
    }
}

impl Eq for HardwareError {}

impl From<btleplug::Error> for HardwareError {
    fn from(e: btleplug::Error) -> Self {
        Self::new(e)
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

/// The main error type for this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The radio is not powered on, so scanning or connecting is not possible.
    #[error("Radio not ready (state: {state})")]
    RadioNotReady {
        /// The radio state at the time of the request.
        state: RadioState,
    },

    /// The device was not seen during the current scan.
    #[error("Unknown device: {device}")]
    UnknownDevice {
        /// The device that was requested.
        device: DeviceId,
    },

    /// Another connection is already outstanding.
    #[error("Already connecting to {device}")]
    AlreadyConnecting {
        /// The device that currently holds the connection slot.
        device: DeviceId,
    },

    /// Operation requires a connected device.
    #[error("Device not connected")]
    NotConnected,

    /// A service discovery is already outstanding on this device.
    #[error("Service discovery already in progress")]
    DiscoveryInProgress,

    /// A live session already uses this identifier.
    #[error("Duplicate session: {id}")]
    DuplicateSession {
        /// The identifier that collided.
        id: SessionId,
    },

    /// The adapter delegate this session needs is held by another live session.
    #[error("Adapter in use by session {id}")]
    AdapterInUse {
        /// The session holding the delegate.
        id: SessionId,
    },

    /// No live session uses this identifier.
    #[error("Session not found: {id}")]
    SessionNotFound {
        /// The identifier that was looked up.
        id: SessionId,
    },

    /// Failure reported by the radio stack.
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    /// Bluetooth is not available on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The adapter does not support the requested operation.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// The hardware did not complete the request in time.
    #[error("Operation timed out")]
    Timeout,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<btleplug::Error> for Error {
    fn from(e: btleplug::Error) -> Self {
        Self::Hardware(HardwareError::from(e))
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
