//! Error types for the accel-gyro-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available, powered off, or not authorized.
    #[error("Bluetooth not available: {state}")]
    AdapterUnavailable {
        /// The adapter state that was reported.
        state: String,
    },

    /// No peripheral advertising the target service was found in time.
    #[error("No sensor found within {secs:.1}s")]
    ScanTimeout {
        /// How long the scan ran, in seconds.
        secs: f64,
    },

    /// Service or characteristic enumeration failed.
    #[error("Discovery failed: {0}")]
    DiscoveryFailed(AdapterError),

    /// A connect, read, write, or subscribe request failed.
    #[error("I/O failed: {0}")]
    IoFailed(AdapterError),

    /// A characteristic value was not valid UTF-8 text.
    #[error("Value from characteristic {uuid} is not valid UTF-8 ({len} bytes)")]
    DecodeFailed {
        /// The characteristic the value came from.
        uuid: String,
        /// Length of the rejected value.
        len: usize,
    },

    /// Operation requires a connection but the sensor is not connected.
    #[error("Sensor not connected")]
    NotConnected,

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// The manager configuration cannot work.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// The session event loop has stopped.
    #[error("Session closed")]
    SessionClosed,
}

/// Failure reported by a BLE adapter alongside a completion event.
///
/// Kept as plain text so events stay `Clone` regardless of platform error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AdapterError {
    /// Human readable description from the platform.
    pub message: String,
}

impl AdapterError {
    /// Create an adapter error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<btleplug::Error> for AdapterError {
    fn from(e: btleplug::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<Error> for AdapterError {
    fn from(e: Error) -> Self {
        match e {
            Error::Bluetooth(e) => e.into(),
            other => Self::new(other.to_string()),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::DiscoveryFailed(AdapterError::new("gatt busy"));
        assert_eq!(e.to_string(), "Discovery failed: gatt busy");

        let e = Error::ScanTimeout { secs: 5.0 };
        assert_eq!(e.to_string(), "No sensor found within 5.0s");
    }

    #[test]
    fn test_adapter_error_from_btleplug() {
        let e: AdapterError = btleplug::Error::DeviceNotFound.into();
        assert!(!e.message.is_empty());
    }
}
