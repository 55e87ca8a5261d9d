//! BLE communication module.
//!
//! This module provides the connection state machine and the btleplug-backed
//! Bluetooth Low Energy plumbing it drives.

pub mod adapter;
pub mod characteristics;
pub mod connection;
pub mod platform;
pub mod scanner;
pub mod timer;
pub mod uuids;

pub use adapter::{AdapterState, BleAdapter, Event, PeripheralHandle};
pub use characteristics::CharacteristicHandler;
pub use connection::{BoundCharacteristics, ConnectionManager, ConnectionState};
pub use platform::BtleplugAdapter;
pub use scanner::BleScanner;
pub use timer::{ScanTimer, TimerToken, TokioScanTimer};
pub use uuids::*;
