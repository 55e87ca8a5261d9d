//! Session for talking to the sensor from async code.
//!
//! A [`Session`] owns a [`ConnectionManager`] on a background task, feeds it
//! adapter and timer events, and republishes its output on a broadcast
//! channel.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::ble::adapter::{AdapterState, BleAdapter, Event};
use crate::ble::connection::{ConnectionManager, ConnectionState};
use crate::ble::platform::BtleplugAdapter;
use crate::ble::timer::{ScanTimer, TokioScanTimer};
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::observer::{BroadcastObserver, ManagerUpdate};

/// Capacity of the update broadcast channel.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Request sent to the event loop.
enum SessionCommand {
    RequestUpdate(oneshot::Sender<Result<()>>),
    Shutdown,
}

/// A running connection to the sensor.
pub struct Session {
    /// Requests to the event loop.
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    /// Shared with the manager; publishes updates and tracks state.
    observer: BroadcastObserver,
    /// Receiver opened before the loop started, handed to the first subscriber.
    first_updates: Mutex<Option<broadcast::Receiver<ManagerUpdate>>>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// Event loop task.
    loop_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl Session {
    /// Open the Bluetooth adapter and start looking for the sensor.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or Bluetooth is not
    /// available.
    pub async fn start(config: ManagerConfig) -> Result<Self> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let adapter = BtleplugAdapter::new(event_tx.clone()).await?;
        let initial_state = match adapter.adapter_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Could not query adapter state: {}", e);
                AdapterState::Unknown
            }
        };

        let timer = TokioScanTimer::new(event_tx.clone());
        let observer = BroadcastObserver::new(UPDATE_CHANNEL_CAPACITY);
        let manager = ConnectionManager::new(config, adapter, timer, observer);

        // Later power changes arrive as adapter events.
        if initial_state != AdapterState::Unknown {
            let _ = event_tx.send(Event::AdapterStateChanged(initial_state));
        }

        Ok(Self::spawn(manager, event_rx, |adapter: BtleplugAdapter| {
            adapter.close().boxed()
        }))
    }

    /// Run `manager` on a background task.
    ///
    /// `on_close` receives the adapter once the loop has shut the manager
    /// down.
    pub fn spawn<A, T, F>(
        manager: ConnectionManager<A, T, BroadcastObserver>,
        event_rx: mpsc::UnboundedReceiver<Event>,
        on_close: F,
    ) -> Self
    where
        A: BleAdapter + Send + 'static,
        T: ScanTimer + Send + 'static,
        F: FnOnce(A) -> BoxFuture<'static, ()> + Send + 'static,
    {
        let observer = manager.observer().clone();
        let first_updates = observer.subscribe();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            let mut manager = Self::run(manager, event_rx, command_rx).await;
            manager.shutdown();

            let (adapter, _, _) = manager.into_parts();
            on_close(adapter).await;

            debug!("Session ended");
        });

        Self {
            command_tx,
            observer,
            first_updates: Mutex::new(Some(first_updates)),
            callback_counter: AtomicU64::new(0),
            loop_handle: RwLock::new(Some(handle)),
        }
    }

    /// Process events and commands until shutdown.
    async fn run<A, T>(
        mut manager: ConnectionManager<A, T, BroadcastObserver>,
        mut event_rx: mpsc::UnboundedReceiver<Event>,
        mut command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> ConnectionManager<A, T, BroadcastObserver>
    where
        A: BleAdapter,
        T: ScanTimer,
    {
        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => {
                    manager.handle_event(event);
                }
                command = command_rx.recv() => match command {
                    Some(SessionCommand::RequestUpdate(reply)) => {
                        let _ = reply.send(manager.request_update_now());
                    }
                    Some(SessionCommand::Shutdown) | None => break,
                },
            }
        }

        manager
    }

    /// Get the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.observer.connection_state()
    }

    /// Subscribe to connection and data updates.
    ///
    /// The first subscriber, receiver or callback, gets every update since
    /// the session started, including the initial `searching`. Later
    /// subscribers see updates from the time they subscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerUpdate> {
        self.first_updates
            .lock()
            .take()
            .unwrap_or_else(|| self.observer.subscribe())
    }

    /// Ask the sensor for a fresh reading. The reading arrives as a
    /// [`ManagerUpdate::Data`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] or [`Error::CharacteristicNotFound`]
    /// from the manager, or [`Error::SessionClosed`] after shutdown.
    pub async fn request_update_now(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(SessionCommand::RequestUpdate(reply_tx))
            .map_err(|_| Error::SessionClosed)?;

        reply_rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Register a callback for connection state changes.
    pub fn on_connection_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.on_update(move |update| {
            if let ManagerUpdate::Connection(state) = update {
                callback(state);
            }
        })
    }

    /// Register a callback for received values.
    ///
    /// The callback gets the decoded text and whether it answered a read.
    pub fn on_data<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(String, bool) + Send + Sync + 'static,
    {
        self.on_update(move |update| {
            if let ManagerUpdate::Data {
                text, is_requested, ..
            } = update
            {
                callback(text, is_requested);
            }
        })
    }

    fn on_update<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ManagerUpdate) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(update) => callback(update),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Callback {} lagged, skipped {} updates", callback_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Check if the event loop is still running.
    pub fn is_running(&self) -> bool {
        self.loop_handle
            .read()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop scanning, disconnect, and end the event loop.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down session");

        let _ = self.command_tx.send(SessionCommand::Shutdown);

        let handle = self.loop_handle.write().take();
        if let Some(handle) = handle {
            handle.await.map_err(|_| Error::SessionClosed)?;
        }

        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.command_tx.send(SessionCommand::Shutdown);
    }
}
