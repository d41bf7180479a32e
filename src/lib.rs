// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # datacenter-monitor-ble
//!
//! A Rust library for monitoring a datacenter environment sensor over
//! Bluetooth Low Energy.
//!
//! The peripheral exposes one service with three characteristics:
//! temperature and humidity (read and notify) and a heater switch (write).
//! This crate finds the peripheral, manages the connection lifecycle,
//! serializes GATT operations through a transaction queue with timeouts and
//! retries, and publishes decoded telemetry.
//!
//! ## Features
//!
//! - **Discovery**: Time-bounded scan filtered by the monitor service UUID
//! - **Session Management**: Connect/disconnect state machine with service verification
//! - **Transaction Queue**: One GATT operation in flight, FIFO, with timeout and retry
//! - **Telemetry**: Latest value per signal plus a change feed
//! - **Heater Control**: Acknowledged writes to the heater characteristic
//! - **Simulation**: An in-process platform for tests and demos
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use datacenter_monitor_ble::{CharacteristicRole, Result, SensorMonitor};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let monitor = SensorMonitor::new().await?;
//!
//!     // Scan, connect and wait for the setup sequence to start
//!     monitor.request_scan_and_connect().await?;
//!     monitor.wait_until_ready(Duration::from_secs(10)).await?;
//!
//!     let mut samples = monitor.subscribe();
//!     while let Ok(sample) = samples.recv().await {
//!         if sample.role == CharacteristicRole::TemperatureReadNotify {
//!             println!("Temperature: {}°C", sample.value);
//!         }
//!     }
//!
//!     monitor.shutdown().await?;
//!     Ok(())
//! }
//! ```
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
//! - `serde`: Enable serialization/deserialization for data and configuration types

// Public modules
pub mod ble;
pub mod config;
pub mod data;
pub mod dispatcher;
pub mod error;
pub mod monitor;
pub mod protocol;

// Re-exports for convenience
pub use config::{MonitorConfig, RetryPolicy};
pub use dispatcher::TelemetryDispatcher;
pub use error::{Error, Result};
pub use monitor::{CallbackHandle, SensorMonitor};

// Re-export commonly used types from submodules
pub use ble::connection::{ConnectionEvent, ConnectionState};
pub use ble::operation::{OperationOutcome, OperationSpec};
pub use ble::transport::{DisconnectReason, PeripheralHandle, RadioStatus};
pub use ble::uuids::CharacteristicRole;
pub use data::{SampleSource, TelemetrySample};
pub use protocol::HeaterState;
