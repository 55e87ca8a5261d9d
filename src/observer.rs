//! Outward-facing status and data updates.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::ble::connection::ConnectionState;

/// Receives connection status and data updates from a
/// [`ConnectionManager`](crate::ConnectionManager).
#[cfg_attr(test, mockall::automock)]
pub trait Observer {
    /// Called on every connection state transition.
    fn update_connection(&mut self, state: ConnectionState);

    /// Called for every successfully decoded value.
    ///
    /// `is_requested` is true for read responses on the readable-data
    /// characteristic and false for notifications.
    fn update_data(&mut self, text: String, is_requested: bool);
}

/// An update published by a [`BroadcastObserver`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ManagerUpdate {
    /// Connection state changed.
    Connection(ConnectionState),
    /// A value arrived.
    Data {
        /// Decoded text.
        text: String,
        /// Whether this answered an explicit read.
        is_requested: bool,
        /// When the value was decoded.
        received_at: DateTime<Utc>,
    },
}

/// [`Observer`] that republishes updates on a broadcast channel.
///
/// Clones share the channel and the last connection state.
#[derive(Debug, Clone)]
pub struct BroadcastObserver {
    /// Channel for updates.
    update_tx: broadcast::Sender<ManagerUpdate>,
    /// Last reported connection state.
    state: Arc<RwLock<ConnectionState>>,
}

impl BroadcastObserver {
    /// Create an observer with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (update_tx, _) = broadcast::channel(capacity);
        Self::with_sender(update_tx)
    }

    /// Create an observer publishing on an existing channel.
    pub fn with_sender(update_tx: broadcast::Sender<ManagerUpdate>) -> Self {
        Self {
            update_tx,
            state: Arc::new(RwLock::new(ConnectionState::default())),
        }
    }

    /// Get the last reported connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Subscribe to updates.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerUpdate> {
        self.update_tx.subscribe()
    }

    fn publish(&self, update: ManagerUpdate) {
        // No receivers is fine.
        let sent = self.update_tx.send(update).unwrap_or(0);
        trace!("Update delivered to {} receivers", sent);
    }
}

impl Observer for BroadcastObserver {
    fn update_connection(&mut self, state: ConnectionState) {
        *self.state.write() = state;
        self.publish(ManagerUpdate::Connection(state));
    }

    fn update_data(&mut self, text: String, is_requested: bool) {
        self.publish(ManagerUpdate::Data {
            text,
            is_requested,
            received_at: Utc::now(),
        });
    }
}
