// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # accel-gyro-ble
//!
//! A cross-platform Rust client for the AccelGyro motion sensor endpoint,
//! a single-purpose Bluetooth Low Energy peripheral that reports
//! accelerometer and gyroscope readings as text.
//!
//! ## Features
//!
//! - **Sensor Discovery**: Scan for the sensor's service with a timeout
//! - **Connection State Machine**: Connect, discover the service and its
//!   characteristics, and report `searching`/`connected`/`disconnected`
//! - **On-demand Readings**: Write the sampling interval and read back, or
//!   read directly
//! - **Notifications**: Subscribe to pushed readings
//! - **Firmware Variants**: One manager configured per variant via
//!   [`ManagerConfig`] presets
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use accel_gyro_ble::{ManagerConfig, ManagerUpdate, Result, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let session = Session::start(ManagerConfig::interval_request()).await?;
//!     let mut updates = session.subscribe();
//!
//!     while let Ok(update) = updates.recv().await {
//!         match update {
//!             ManagerUpdate::Connection(state) => {
//!                 println!("Sensor {}", state);
//!                 if state.is_connected() {
//!                     session.request_update_now().await?;
//!                 }
//!             }
//!             ManagerUpdate::Data { text, .. } => {
//!                 println!("Reading: {}", text);
//!                 break;
//!             }
//!         }
//!     }
//!
//!     session.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Custom Adapters
//!
//! [`ConnectionManager`] is a plain state machine over the [`BleAdapter`],
//! [`ScanTimer`](ble::ScanTimer) and [`Observer`] traits. Feed it
//! [`Event`](ble::Event)s from any BLE stack through
//! [`ConnectionManager::handle_event`].
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration and
//!   update types

// Public modules
pub mod ble;
pub mod config;
pub mod error;
pub mod observer;
pub mod session;
pub mod utils;

// Re-exports for convenience
pub use ble::adapter::{AdapterState, BleAdapter, PeripheralHandle};
pub use ble::connection::{ConnectionManager, ConnectionState};
pub use config::{CharacteristicRole, CharacteristicRoles, ManagerConfig, UpdateTrigger};
pub use error::{AdapterError, Error, Result};
pub use observer::{BroadcastObserver, ManagerUpdate, Observer};
pub use session::{CallbackHandle, Session};
pub use utils::{decode_text, encode_text};
