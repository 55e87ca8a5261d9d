//! Connection manager configuration.
//!
//! The sensor firmware ships in a few variants that differ only in which
//! characteristics are read, written, or subscribed to. Each variant is a
//! [`ManagerConfig`] preset rather than a separate manager.

use std::time::Duration;
use uuid::Uuid;

use crate::ble::uuids::*;
use crate::error::{Error, Result};

/// How long scanning may run without discovering the sensor.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Sampling interval written by [`UpdateTrigger::WriteInterval`] by default.
pub const DEFAULT_INTERVAL_VALUE: &str = "7.5";

/// Logical role a discovered characteristic can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CharacteristicRole {
    /// Accepts the sampling interval as text.
    WritableInterval,
    /// Returns a motion reading when read.
    ReadableData,
    /// Pushes motion readings as notifications.
    NotifiableData,
}

impl std::fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WritableInterval => write!(f, "writable-interval"),
            Self::ReadableData => write!(f, "readable-data"),
            Self::NotifiableData => write!(f, "notifiable-data"),
        }
    }
}

/// Mapping from characteristic role to UUID.
///
/// Unset roles are simply not used by the variant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicRoles {
    /// Characteristic that takes the sampling interval.
    pub writable_interval: Option<Uuid>,
    /// Characteristic read for an explicit reading.
    pub readable_data: Option<Uuid>,
    /// Characteristic subscribed to for pushed readings.
    pub notifiable_data: Option<Uuid>,
}

impl CharacteristicRoles {
    /// Get the UUID configured for a role.
    pub fn get(&self, role: CharacteristicRole) -> Option<Uuid> {
        match role {
            CharacteristicRole::WritableInterval => self.writable_interval,
            CharacteristicRole::ReadableData => self.readable_data,
            CharacteristicRole::NotifiableData => self.notifiable_data,
        }
    }

    /// Roles whose configured UUID equals `uuid`.
    ///
    /// One characteristic may serve more than one role (e.g. a motion
    /// characteristic that is both readable and notifiable).
    pub fn roles_for(&self, uuid: &Uuid) -> Vec<CharacteristicRole> {
        [
            CharacteristicRole::WritableInterval,
            CharacteristicRole::ReadableData,
            CharacteristicRole::NotifiableData,
        ]
        .into_iter()
        .filter(|role| self.get(*role).as_ref() == Some(uuid))
        .collect()
    }

    /// Check if no role is configured.
    pub fn is_empty(&self) -> bool {
        self.writable_interval.is_none()
            && self.readable_data.is_none()
            && self.notifiable_data.is_none()
    }
}

/// What [`request_update_now`](crate::ConnectionManager::request_update_now) does.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UpdateTrigger {
    /// Write the interval value; a successful write is followed by a read of
    /// the readable-data characteristic when one is bound.
    WriteInterval {
        /// Text written to the writable-interval characteristic.
        value: String,
    },
    /// Read the readable-data characteristic directly.
    ReadData,
}

impl UpdateTrigger {
    /// The role this trigger issues its request against.
    pub fn role(&self) -> CharacteristicRole {
        match self {
            Self::WriteInterval { .. } => CharacteristicRole::WritableInterval,
            Self::ReadData => CharacteristicRole::ReadableData,
        }
    }
}

/// Configuration for a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerConfig {
    /// The service the sensor advertises and that scanning filters on.
    pub service_uuid: Uuid,
    /// Characteristic UUIDs by role.
    pub roles: CharacteristicRoles,
    /// Behavior of an on-demand update.
    pub update_trigger: UpdateTrigger,
    /// How long to scan before giving up.
    pub scan_timeout: Duration,
}

impl ManagerConfig {
    /// Write the sampling interval, then read a reading back.
    pub fn interval_request() -> Self {
        Self {
            service_uuid: ACCEL_GYRO_SERVICE_UUID,
            roles: CharacteristicRoles {
                writable_interval: Some(SET_INTERVAL_CHARACTERISTIC_UUID),
                readable_data: Some(MOTION_DATA_CHARACTERISTIC_UUID),
                notifiable_data: None,
            },
            update_trigger: UpdateTrigger::WriteInterval {
                value: DEFAULT_INTERVAL_VALUE.to_string(),
            },
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
        }
    }

    /// Read a reading directly, no interval configuration.
    pub fn direct_read() -> Self {
        Self {
            service_uuid: ACCEL_GYRO_SERVICE_UUID,
            roles: CharacteristicRoles {
                writable_interval: None,
                readable_data: Some(MOTION_DATA_CHARACTERISTIC_UUID),
                notifiable_data: None,
            },
            update_trigger: UpdateTrigger::ReadData,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
        }
    }

    /// Write the sampling interval and receive readings as notifications.
    pub fn motion_notify() -> Self {
        Self {
            service_uuid: ACCEL_GYRO_SERVICE_UUID,
            roles: CharacteristicRoles {
                writable_interval: Some(SET_INTERVAL_CHARACTERISTIC_UUID),
                readable_data: None,
                notifiable_data: Some(MOTION_DATA_CHARACTERISTIC_UUID),
            },
            update_trigger: UpdateTrigger::WriteInterval {
                value: DEFAULT_INTERVAL_VALUE.to_string(),
            },
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
        }
    }

    /// Set the scan timeout.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the service UUID.
    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.service_uuid = uuid;
        self
    }

    /// Set the characteristic role mapping.
    pub fn with_roles(mut self, roles: CharacteristicRoles) -> Self {
        self.roles = roles;
        self
    }

    /// Set the update trigger.
    pub fn with_update_trigger(mut self, trigger: UpdateTrigger) -> Self {
        self.update_trigger = trigger;
        self
    }

    /// Check the configuration can work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if no role is configured, if the
    /// update trigger needs a role that is missing, or if the scan timeout is
    /// zero.
    pub fn validate(&self) -> Result<()> {
        if self.roles.is_empty() {
            return Err(Error::InvalidConfig {
                reason: "no characteristic roles configured".to_string(),
            });
        }

        let role = self.update_trigger.role();
        if self.roles.get(role).is_none() {
            return Err(Error::InvalidConfig {
                reason: format!("update trigger needs the {} characteristic", role),
            });
        }

        if self.scan_timeout.is_zero() {
            return Err(Error::InvalidConfig {
                reason: "scan timeout must be non-zero".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::interval_request()
    }
}
