//! BLE communication module.
//!
//! This module provides the link layer for the monitor peripheral: the
//! platform seam, discovery, the transaction queue and the connection state
//! machine that drives them.

pub mod connection;
pub mod operation;
pub mod platform;
pub mod queue;
pub mod scanner;
pub mod simulated;
pub mod transport;
pub mod uuids;

pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use operation::{Operation, OperationKind, OperationOutcome, OperationSpec, OperationTicket};
pub use platform::BtleplugPlatform;
pub use queue::{QueueStats, TransactionQueue};
pub use scanner::PeripheralLocator;
pub use simulated::SimulatedPlatform;
pub use transport::{
    DisconnectReason, GattService, GattStatus, LinkEvent, LinkPlatform, OperationId,
    PeripheralHandle, RadioStatus,
};
pub use uuids::*;
