//! BLE scanning functionality.
//!
//! Provides the scanner that finds the sensor and watches the adapter for
//! power and link changes.

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::ble::adapter::{AdapterState, Event, PeripheralHandle};
use crate::error::{Error, Result};

/// State shared between the scanner and its event task.
#[derive(Default)]
struct ScanState {
    /// Service being scanned for, while scanning.
    service: Option<Uuid>,
    /// Peripherals already reported during the current scan.
    announced: HashSet<String>,
    /// Peripheral whose disconnection should be reported, with the services
    /// that disconnection invalidates.
    watched: Option<(String, Vec<Uuid>)>,
}

impl ScanState {
    /// Services invalidated by `identifier` disconnecting.
    ///
    /// Only the watched peripheral counts, and only once; the watch is
    /// cleared when it matches.
    fn invalidate(&mut self, identifier: &str) -> Option<Vec<Uuid>> {
        match self.watched.take() {
            Some((watched, services)) if watched == identifier => Some(services),
            other => {
                self.watched = other;
                None
            }
        }
    }
}

/// BLE scanner for discovering the sensor.
pub struct BleScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Scan filter and link watch.
    state: Arc<RwLock<ScanState>>,
    /// Peripherals seen so far, by platform identifier.
    discovered: Arc<RwLock<HashMap<String, Peripheral>>>,
    /// Where translated events are posted.
    event_tx: mpsc::UnboundedSender<Event>,
    /// Handle to the adapter event task.
    event_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl BleScanner {
    /// Create a scanner on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new(event_tx: mpsc::UnboundedSender<Event>) -> Result<Self> {
        let manager = Manager::new().await.map_err(|e| Error::AdapterUnavailable {
            state: e.to_string(),
        })?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| Error::AdapterUnavailable {
                state: "no adapter".to_string(),
            })?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter, event_tx))
    }

    /// Create a scanner with a specific adapter.
    pub fn with_adapter(adapter: Adapter, event_tx: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            adapter,
            state: Arc::new(RwLock::new(ScanState::default())),
            discovered: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_handle: RwLock::new(None),
        }
    }

    /// Start translating adapter events.
    ///
    /// Runs until the scanner is dropped, scanning or not, so power changes
    /// and disconnections are always reported.
    pub async fn start_event_loop(&self) -> Result<()> {
        if self.event_handle.read().is_some() {
            return Ok(());
        }

        let mut events = self.adapter.events().await.map_err(Error::Bluetooth)?;

        let adapter = self.adapter.clone();
        let state = self.state.clone();
        let discovered = self.discovered.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                Self::handle_event(event, &adapter, &state, &discovered, &event_tx).await;
            }

            debug!("Adapter event loop ended");
        });

        *self.event_handle.write() = Some(handle);

        Ok(())
    }

    /// Query the adapter's current power state.
    pub async fn adapter_state(&self) -> Result<AdapterState> {
        let state = self.adapter.adapter_state().await.map_err(Error::Bluetooth)?;
        Ok(state.into())
    }

    /// Start scanning for peripherals advertising `service`.
    ///
    /// # Errors
    ///
    /// Returns an error if scanning cannot be started.
    pub async fn start_scanning(&self, service: Uuid) -> Result<()> {
        info!("Starting BLE scan for service {}", service);

        {
            let mut state = self.state.write();
            state.service = Some(service);
            state.announced.clear();
        }

        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(Error::Bluetooth)?;

        // Peripherals cached by the platform from an earlier scan produce no
        // new discovery event.
        for peripheral in self.adapter.peripherals().await.map_err(Error::Bluetooth)? {
            Self::process_peripheral(peripheral, &self.state, &self.discovered, &self.event_tx)
                .await;
        }

        Ok(())
    }

    /// Stop scanning.
    pub async fn stop_scanning(&self) -> Result<()> {
        if self.state.write().service.take().is_none() {
            trace!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");

        self.adapter.stop_scan().await.map_err(Error::Bluetooth)?;

        Ok(())
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        self.state.read().service.is_some()
    }

    /// Look up a discovered peripheral.
    pub fn peripheral(&self, handle: &PeripheralHandle) -> Option<Peripheral> {
        self.discovered.read().get(handle.id()).cloned()
    }

    /// Report disconnection of `handle` as invalidation of `services`.
    pub fn watch(&self, handle: &PeripheralHandle, services: Vec<Uuid>) {
        self.state.write().watched = Some((handle.id().to_string(), services));
    }

    /// Stop reporting disconnections.
    pub fn unwatch(&self) {
        self.state.write().watched = None;
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Handle a BLE central event.
    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        state: &Arc<RwLock<ScanState>>,
        discovered: &Arc<RwLock<HashMap<String, Peripheral>>>,
        event_tx: &mpsc::UnboundedSender<Event>,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                trace!("Device seen: {:?}", id);
                if let Some(peripheral) = Self::lookup(adapter, &id).await {
                    Self::process_peripheral(peripheral, state, discovered, event_tx).await;
                }
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);

                let invalidated = state.write().invalidate(&id.to_string());

                // A dropped link invalidates every discovered service.
                if let Some(services) = invalidated {
                    let _ = event_tx.send(Event::ServicesInvalidated(services));
                }
            }
            CentralEvent::StateUpdate(central_state) => {
                let _ = event_tx.send(Event::AdapterStateChanged(central_state.into()));
            }
            _ => {}
        }
    }

    async fn lookup(adapter: &Adapter, id: &PeripheralId) -> Option<Peripheral> {
        match adapter.peripheral(id).await {
            Ok(p) => Some(p),
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                None
            }
        }
    }

    /// Report a peripheral if it advertises the scanned service.
    async fn process_peripheral(
        peripheral: Peripheral,
        state: &Arc<RwLock<ScanState>>,
        discovered: &Arc<RwLock<HashMap<String, Peripheral>>>,
        event_tx: &mpsc::UnboundedSender<Event>,
    ) {
        let service = match state.read().service {
            Some(service) => service,
            None => return,
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            Ok(None) => return,
            Err(e) => {
                error!("Failed to read peripheral properties: {}", e);
                return;
            }
        };

        if !properties.services.contains(&service) {
            return;
        }

        let identifier = peripheral.id().to_string();

        if !state.write().announced.insert(identifier.clone()) {
            return;
        }

        debug!(
            "Sensor advertisement from {} ({:?}, rssi {:?})",
            identifier, properties.local_name, properties.rssi
        );

        discovered.write().insert(identifier.clone(), peripheral);

        let _ = event_tx.send(Event::PeripheralDiscovered(PeripheralHandle::new(
            identifier,
        )));
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        if let Some(handle) = self.event_handle.write().take() {
            handle.abort();
        }
    }
}
