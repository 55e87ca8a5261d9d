//! [`BleAdapter`] implementation on top of btleplug.
//!
//! Requests are queued to a single worker task that runs them one at a time
//! against the platform stack, in the order the manager issued them, and
//! posts each completion as an [`Event`].

use btleplug::api::Peripheral as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ble::adapter::{AdapterState, BleAdapter, Event, PeripheralHandle};
use crate::ble::characteristics::CharacteristicHandler;
use crate::ble::scanner::BleScanner;
use crate::error::{AdapterError, Error, Result};

/// A queued adapter request.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    StartScan(Uuid),
    StopScan,
    Connect(PeripheralHandle),
    Disconnect(PeripheralHandle),
    DiscoverServices(PeripheralHandle, Vec<Uuid>),
    DiscoverCharacteristics(PeripheralHandle, Uuid),
    Write(PeripheralHandle, Uuid, Vec<u8>),
    Read(PeripheralHandle, Uuid),
    SetNotify(PeripheralHandle, Uuid, bool),
}

/// BLE adapter backed by the platform Bluetooth stack.
pub struct BtleplugAdapter {
    /// Scanner shared with the worker.
    scanner: Arc<BleScanner>,
    /// Request queue.
    command_tx: mpsc::UnboundedSender<Command>,
    /// The worker task.
    worker: JoinHandle<()>,
}

impl BtleplugAdapter {
    /// Open the first Bluetooth adapter. Events are posted on `event_tx`.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new(event_tx: mpsc::UnboundedSender<Event>) -> Result<Self> {
        let scanner = BleScanner::new(event_tx.clone()).await?;
        Self::with_scanner(scanner, event_tx).await
    }

    /// Build on an existing scanner.
    pub async fn with_scanner(
        scanner: BleScanner,
        event_tx: mpsc::UnboundedSender<Event>,
    ) -> Result<Self> {
        scanner.start_event_loop().await?;

        let scanner = Arc::new(scanner);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            scanner: scanner.clone(),
            handler: None,
            event_tx,
        };
        let worker = tokio::spawn(worker.run(command_rx));

        Ok(Self {
            scanner,
            command_tx,
            worker,
        })
    }

    /// Query the adapter's current power state.
    pub async fn adapter_state(&self) -> Result<AdapterState> {
        self.scanner.adapter_state().await
    }

    /// Get the scanner.
    pub fn scanner(&self) -> &BleScanner {
        &self.scanner
    }

    /// Finish queued requests and stop the worker.
    pub async fn close(self) {
        drop(self.command_tx);
        if let Err(e) = self.worker.await {
            error!("Adapter worker failed: {}", e);
        }
    }

    fn submit(&self, command: Command) {
        if self.command_tx.send(command).is_err() {
            warn!("Adapter worker stopped, dropping request");
        }
    }
}

impl BleAdapter for BtleplugAdapter {
    fn start_scan(&mut self, service: Uuid) {
        self.submit(Command::StartScan(service));
    }

    fn stop_scan(&mut self) {
        self.submit(Command::StopScan);
    }

    fn connect(&mut self, peripheral: &PeripheralHandle) {
        self.submit(Command::Connect(peripheral.clone()));
    }

    fn disconnect(&mut self, peripheral: &PeripheralHandle) {
        self.submit(Command::Disconnect(peripheral.clone()));
    }

    fn discover_services(&mut self, peripheral: &PeripheralHandle, filter: &[Uuid]) {
        self.submit(Command::DiscoverServices(
            peripheral.clone(),
            filter.to_vec(),
        ));
    }

    fn discover_characteristics(&mut self, peripheral: &PeripheralHandle, service: Uuid) {
        self.submit(Command::DiscoverCharacteristics(peripheral.clone(), service));
    }

    fn write(&mut self, peripheral: &PeripheralHandle, characteristic: Uuid, value: Vec<u8>) {
        self.submit(Command::Write(peripheral.clone(), characteristic, value));
    }

    fn read(&mut self, peripheral: &PeripheralHandle, characteristic: Uuid) {
        self.submit(Command::Read(peripheral.clone(), characteristic));
    }

    fn set_notify(&mut self, peripheral: &PeripheralHandle, characteristic: Uuid, enabled: bool) {
        self.submit(Command::SetNotify(
            peripheral.clone(),
            characteristic,
            enabled,
        ));
    }
}

/// Runs queued requests one at a time.
struct Worker {
    scanner: Arc<BleScanner>,
    /// GATT access to the connected peripheral.
    handler: Option<CharacteristicHandler>,
    event_tx: mpsc::UnboundedSender<Event>,
}

impl Worker {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = command_rx.recv().await {
            debug!("Adapter request: {:?}", command);
            self.execute(command).await;
        }

        if let Some(handler) = self.handler.take() {
            self.scanner.unwatch();
            if let Err(e) = handler.disconnect().await {
                warn!("Error disconnecting {}: {}", handler.handle(), e);
            }
        }

        debug!("Adapter worker ended");
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::StartScan(service) => {
                if let Err(e) = self.scanner.start_scanning(service).await {
                    error!("Failed to start scan: {}", e);
                }
            }
            Command::StopScan => {
                if let Err(e) = self.scanner.stop_scanning().await {
                    error!("Failed to stop scan: {}", e);
                }
            }
            Command::Connect(peripheral) => {
                let event = match self.connect(&peripheral).await {
                    Ok(()) => Event::LinkEstablished(peripheral),
                    Err(e) => Event::LinkFailed {
                        peripheral,
                        error: e.into(),
                    },
                };
                self.post(event);
            }
            Command::Disconnect(peripheral) => {
                if let Err(e) = self.disconnect(&peripheral).await {
                    warn!("Error disconnecting {}: {}", peripheral, e);
                }
            }
            Command::DiscoverServices(peripheral, filter) => {
                let result = match self.handler(&peripheral) {
                    Ok(handler) => handler.discover_services(&filter).await,
                    Err(e) => Err(e),
                };

                if let Ok(services) = &result {
                    self.scanner.watch(&peripheral, services.clone());
                }

                self.post(Event::ServicesDiscovered(result.map_err(AdapterError::from)));
            }
            Command::DiscoverCharacteristics(peripheral, service) => {
                let result = match self.handler(&peripheral) {
                    Ok(handler) => handler.discover_characteristics(&service).await,
                    Err(e) => Err(e),
                };
                self.post(Event::CharacteristicsDiscovered {
                    service,
                    result: result.map_err(AdapterError::from),
                });
            }
            Command::Write(peripheral, characteristic, value) => {
                let result = match self.handler(&peripheral) {
                    Ok(handler) => handler.write(&characteristic, &value).await,
                    Err(e) => Err(e),
                };
                self.post(Event::WriteComplete {
                    characteristic,
                    result: result.map_err(AdapterError::from),
                });
            }
            Command::Read(peripheral, characteristic) => {
                let result = match self.handler(&peripheral) {
                    Ok(handler) => handler.read(&characteristic).await,
                    Err(e) => Err(e),
                };
                self.post(Event::ValueUpdated {
                    characteristic,
                    result: result.map_err(AdapterError::from),
                });
            }
            Command::SetNotify(peripheral, characteristic, enabled) => {
                let result = match self.handler(&peripheral) {
                    Ok(handler) if enabled => handler.subscribe(&characteristic).await,
                    Ok(handler) => handler.unsubscribe(&characteristic).await,
                    Err(e) => Err(e),
                };
                self.post(Event::NotifyStateUpdated {
                    characteristic,
                    result: result.map_err(AdapterError::from),
                });
            }
        }
    }

    async fn connect(&mut self, handle: &PeripheralHandle) -> Result<()> {
        let peripheral = self
            .scanner
            .peripheral(handle)
            .ok_or(Error::NotConnected)?;

        // Check if already connected at BLE level
        if peripheral.is_connected().await.unwrap_or(false) {
            info!("Peripheral {} already connected at BLE level", handle);
        } else {
            peripheral.connect().await.map_err(Error::Bluetooth)?;
            info!("Successfully connected to {}", handle);
        }

        self.handler = Some(CharacteristicHandler::new(
            peripheral,
            handle.clone(),
            self.event_tx.clone(),
        ));

        Ok(())
    }

    async fn disconnect(&mut self, handle: &PeripheralHandle) -> Result<()> {
        match self.handler.take() {
            Some(handler) if handler.handle() == handle => {
                self.scanner.unwatch();
                handler.disconnect().await?;
                info!("Disconnected from {}", handle);
                Ok(())
            }
            other => {
                self.handler = other;
                Err(Error::NotConnected)
            }
        }
    }

    fn handler(&self, handle: &PeripheralHandle) -> Result<&CharacteristicHandler> {
        self.handler
            .as_ref()
            .filter(|handler| handler.handle() == handle)
            .ok_or(Error::NotConnected)
    }

    fn post(&self, event: Event) {
        if self.event_tx.send(event).is_err() {
            debug!("Event channel closed");
        }
    }
}
