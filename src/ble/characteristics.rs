//! GATT characteristic handling.
//!
//! Provides functionality for discovering, reading, writing, and subscribing
//! to BLE characteristics on the connected sensor.

use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::ble::adapter::{Event, PeripheralHandle};
use crate::error::{Error, Result};

/// Handler for GATT characteristics on the connected sensor.
pub struct CharacteristicHandler {
    /// The peripheral to communicate with.
    peripheral: Peripheral,
    /// Identity of the peripheral.
    handle: PeripheralHandle,
    /// Cached characteristics by UUID.
    characteristics: Arc<RwLock<HashMap<Uuid, Characteristic>>>,
    /// Where notifications are posted as value updates.
    event_tx: mpsc::UnboundedSender<Event>,
    /// Handle to the notification listener task.
    listener_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl CharacteristicHandler {
    /// Create a new characteristic handler for a connected peripheral.
    pub fn new(
        peripheral: Peripheral,
        handle: PeripheralHandle,
        event_tx: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            peripheral,
            handle,
            characteristics: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            listener_handle: RwLock::new(None),
        }
    }

    /// The peripheral this handler talks to.
    pub fn handle(&self) -> &PeripheralHandle {
        &self.handle
    }

    /// Get the peripheral.
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    /// Discover services, keeping those in `filter` (all if empty).
    pub async fn discover_services(&self, filter: &[Uuid]) -> Result<Vec<Uuid>> {
        self.peripheral
            .discover_services()
            .await
            .map_err(Error::Bluetooth)?;

        let services: Vec<Uuid> = self
            .peripheral
            .services()
            .iter()
            .map(|service| service.uuid)
            .filter(|uuid| filter.is_empty() || filter.contains(uuid))
            .collect();

        debug!("Discovered {} matching services", services.len());

        Ok(services)
    }

    /// Discover and cache all characteristics of `service`.
    ///
    /// This should be called after discovering services.
    pub async fn discover_characteristics(&self, service: &Uuid) -> Result<Vec<Uuid>> {
        let service = self
            .peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == *service)
            .ok_or_else(|| Error::ServiceNotFound {
                uuid: service.to_string(),
            })?;

        let mut chars = self.characteristics.write();
        let mut found = Vec::with_capacity(service.characteristics.len());

        for characteristic in service.characteristics {
            debug!(
                "Found characteristic: {} in service {} ({:?})",
                characteristic.uuid, service.uuid, characteristic.properties
            );
            found.push(characteristic.uuid);
            chars.insert(characteristic.uuid, characteristic);
        }

        Ok(found)
    }

    /// Get a characteristic by UUID.
    pub fn get_characteristic(&self, uuid: &Uuid) -> Option<Characteristic> {
        self.characteristics.read().get(uuid).cloned()
    }

    /// Check if a characteristic exists.
    pub fn has_characteristic(&self, uuid: &Uuid) -> bool {
        self.characteristics.read().contains_key(uuid)
    }

    fn characteristic(&self, uuid: &Uuid) -> Result<Characteristic> {
        self.get_characteristic(uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })
    }

    /// Read a characteristic value.
    pub async fn read(&self, uuid: &Uuid) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(uuid)?;

        let data = self
            .peripheral
            .read(&characteristic)
            .await
            .map_err(Error::Bluetooth)?;

        trace!("Read {} bytes from characteristic {}", data.len(), uuid);

        Ok(data)
    }

    /// Write to a characteristic, with response.
    pub async fn write(&self, uuid: &Uuid, data: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(uuid)?;

        self.peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await
            .map_err(Error::Bluetooth)?;

        trace!("Wrote {} bytes to characteristic {}", data.len(), uuid);

        Ok(())
    }

    /// Subscribe to notifications from a characteristic.
    ///
    /// Starts the notification listener if it is not running.
    pub async fn subscribe(&self, uuid: &Uuid) -> Result<()> {
        let characteristic = self.characteristic(uuid)?;

        debug!(
            "Subscribing to {}, properties: {:?}",
            uuid, characteristic.properties
        );

        self.start_notifications().await?;

        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(Error::Bluetooth)?;

        debug!("Subscribed to notifications from {}", uuid);

        Ok(())
    }

    /// Unsubscribe from notifications from a characteristic.
    pub async fn unsubscribe(&self, uuid: &Uuid) -> Result<()> {
        let characteristic = self.characteristic(uuid)?;

        self.peripheral
            .unsubscribe(&characteristic)
            .await
            .map_err(Error::Bluetooth)?;

        debug!("Unsubscribed from notifications from {}", uuid);

        Ok(())
    }

    /// Forward notifications as [`Event::ValueUpdated`].
    async fn start_notifications(&self) -> Result<()> {
        if self.listener_handle.read().is_some() {
            return Ok(());
        }

        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(Error::Bluetooth)?;

        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            debug!("Notification listener started");

            while let Some(notification) = notifications.next().await {
                trace!(
                    "Notification received from {}: {} bytes",
                    notification.uuid,
                    notification.value.len()
                );

                let event = Event::ValueUpdated {
                    characteristic: notification.uuid,
                    result: Ok(notification.value),
                };

                if event_tx.send(event).is_err() {
                    error!("Event channel closed, dropping notifications");
                    break;
                }
            }

            debug!("Notification listener stopped");
        });

        *self.listener_handle.write() = Some(handle);

        Ok(())
    }

    /// Stop forwarding notifications.
    pub fn stop_notifications(&self) {
        if let Some(handle) = self.listener_handle.write().take() {
            handle.abort();
        }
    }

    /// Disconnect from the peripheral.
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_notifications();
        self.peripheral
            .disconnect()
            .await
            .map_err(Error::Bluetooth)
    }
}

impl Drop for CharacteristicHandler {
    fn drop(&mut self) {
        self.stop_notifications();
    }
}
