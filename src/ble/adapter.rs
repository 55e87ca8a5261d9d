//! The BLE adapter capability the connection manager drives.
//!
//! Requests go out through [`BleAdapter`] and return immediately; their
//! completions come back later as [`Event`]s fed into
//! [`ConnectionManager::handle_event`](crate::ConnectionManager::handle_event).

use btleplug::api::CentralState;
use uuid::Uuid;

use crate::ble::timer::TimerToken;
use crate::error::AdapterError;

/// Power/availability state of the local Bluetooth radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AdapterState {
    /// State not yet known.
    #[default]
    Unknown,
    /// The radio is restarting.
    Resetting,
    /// The platform has no BLE support.
    Unsupported,
    /// The application is not allowed to use Bluetooth.
    Unauthorized,
    /// Bluetooth is turned off.
    PoweredOff,
    /// Bluetooth is on and usable.
    PoweredOn,
}

impl AdapterState {
    /// Check if the radio can be used.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Resetting => write!(f, "resetting"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::PoweredOff => write!(f, "poweredOff"),
            Self::PoweredOn => write!(f, "poweredOn"),
        }
    }
}

impl From<CentralState> for AdapterState {
    fn from(state: CentralState) -> Self {
        match state {
            CentralState::PoweredOn => Self::PoweredOn,
            CentralState::PoweredOff => Self::PoweredOff,
            _ => Self::Unknown,
        }
    }
}

/// Opaque identity of a discovered peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralHandle(pub String);

impl PeripheralHandle {
    /// Create a handle from a platform identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The platform identifier.
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something that happened on the adapter or the scan timer.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The radio changed power state.
    AdapterStateChanged(AdapterState),
    /// A peripheral advertising the scanned service was seen.
    PeripheralDiscovered(PeripheralHandle),
    /// A connect request completed.
    LinkEstablished(PeripheralHandle),
    /// A connect request failed.
    LinkFailed {
        /// The peripheral that could not be connected.
        peripheral: PeripheralHandle,
        /// What went wrong.
        error: AdapterError,
    },
    /// Service discovery completed.
    ServicesDiscovered(Result<Vec<Uuid>, AdapterError>),
    /// Characteristic discovery for one service completed.
    CharacteristicsDiscovered {
        /// The service that was enumerated.
        service: Uuid,
        /// Characteristic UUIDs found, or the failure.
        result: Result<Vec<Uuid>, AdapterError>,
    },
    /// The peripheral invalidated previously discovered services.
    ServicesInvalidated(Vec<Uuid>),
    /// A write request was acknowledged.
    WriteComplete {
        /// The characteristic written.
        characteristic: Uuid,
        /// Acknowledgement outcome.
        result: Result<(), AdapterError>,
    },
    /// A value arrived, either as a read response or a notification.
    ValueUpdated {
        /// The characteristic the value belongs to.
        characteristic: Uuid,
        /// Raw value bytes, or the failure.
        result: Result<Vec<u8>, AdapterError>,
    },
    /// A subscribe or unsubscribe request completed.
    NotifyStateUpdated {
        /// The characteristic concerned.
        characteristic: Uuid,
        /// Outcome of the request.
        result: Result<(), AdapterError>,
    },
    /// The scan timer fired.
    ScanTimeout(TimerToken),
}

/// Central-role BLE primitives.
///
/// Every method issues a request and returns immediately. Implementations
/// report the outcome by delivering the matching [`Event`].
pub trait BleAdapter {
    /// Scan for peripherals advertising `service`.
    fn start_scan(&mut self, service: Uuid);

    /// Stop any scan in progress. Safe to call when not scanning.
    fn stop_scan(&mut self);

    /// Connect to a discovered peripheral.
    fn connect(&mut self, peripheral: &PeripheralHandle);

    /// Drop the link to a peripheral.
    fn disconnect(&mut self, peripheral: &PeripheralHandle);

    /// Discover services on a connected peripheral, restricted to `filter`.
    fn discover_services(&mut self, peripheral: &PeripheralHandle, filter: &[Uuid]);

    /// Discover all characteristics of `service`.
    fn discover_characteristics(&mut self, peripheral: &PeripheralHandle, service: Uuid);

    /// Write `value` to a characteristic, with response.
    fn write(&mut self, peripheral: &PeripheralHandle, characteristic: Uuid, value: Vec<u8>);

    /// Read a characteristic.
    fn read(&mut self, peripheral: &PeripheralHandle, characteristic: Uuid);

    /// Enable or disable notifications on a characteristic.
    fn set_notify(&mut self, peripheral: &PeripheralHandle, characteristic: Uuid, enabled: bool);
}
