//! Platform link abstraction.
//!
//! [`LinkPlatform`] is the outbound interface the core needs from the radio
//! layer. Every method only *issues* work and returns once the platform has
//! accepted it; the outcome arrives later as a [`LinkEvent`] on the stream
//! returned by [`LinkPlatform::events`]. This mirrors callback-driven BLE
//! stacks where at most one GATT request may be outstanding and nothing is
//! queued, retried, or timed out on the caller's behalf.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;

/// Opaque reference to a discovered peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralHandle {
    /// Platform key used to address the peripheral in requests and events.
    pub id: String,
    /// Stable device address string.
    pub address: String,
    /// Advertised local name, if any.
    pub local_name: Option<String>,
    /// Signal strength in dBm at discovery time.
    pub rssi: Option<i16>,
}

impl PeripheralHandle {
    /// Create a handle whose platform key and address are the same string.
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            id: address.clone(),
            address,
            local_name: None,
            rssi: None,
        }
    }

    /// Set the advertised local name.
    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }
}

impl std::fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.local_name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// GATT status code reported with a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub u8);

impl GattStatus {
    /// The request succeeded.
    pub const SUCCESS: GattStatus = GattStatus(0x00);
    /// Generic failure (GATT_ERROR).
    pub const FAILURE: GattStatus = GattStatus(0x85);

    /// Check for success.
    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

/// Identity of one issued link request, echoed back in its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What kind of request a completion answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionKind {
    /// Characteristic read.
    Read,
    /// Characteristic write with response.
    Write,
    /// Notification enable (CCCD write).
    Subscribe,
}

/// A service found during discovery, with the characteristic UUIDs it contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristic UUIDs within the service.
    pub characteristics: Vec<Uuid>,
}

/// Why a link went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DisconnectReason {
    /// The local side asked for the disconnect.
    Requested,
    /// The peripheral or radio dropped the link.
    LinkLost,
    /// Service discovery failed at the transport level.
    DiscoveryFailed,
    /// The peripheral does not expose the monitor service and characteristics.
    ServiceNotFound,
    /// The platform event stream ended.
    TransportClosed,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::LinkLost => write!(f, "link lost"),
            Self::DiscoveryFailed => write!(f, "service discovery failed"),
            Self::ServiceNotFound => write!(f, "service not found"),
            Self::TransportClosed => write!(f, "transport closed"),
        }
    }
}

/// Radio and permission preconditions reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioStatus {
    /// Radio powered on and permissions granted.
    Ready,
    /// Radio present but switched off.
    PoweredOff,
    /// No usable radio on this host.
    Unsupported,
    /// Scanning permission not granted.
    PermissionDenied,
}

/// Asynchronous signal from the platform.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// An advertisement was seen while scanning.
    Discovered {
        /// The advertising peripheral.
        peripheral: PeripheralHandle,
        /// Service UUIDs carried in the advertisement.
        services: Vec<Uuid>,
    },
    /// A connect request reached the connected state.
    Connected {
        /// Platform key of the peripheral.
        peripheral: String,
    },
    /// A connect request failed before the link came up.
    ConnectFailed {
        /// Platform key of the peripheral.
        peripheral: String,
        /// Platform description of the failure.
        reason: String,
    },
    /// The link went down.
    Disconnected {
        /// Platform key of the peripheral.
        peripheral: String,
        /// Why the link went down.
        reason: DisconnectReason,
    },
    /// Service discovery finished.
    ServicesDiscovered {
        /// Platform key of the peripheral.
        peripheral: String,
        /// Discovered services, or the failure status.
        result: std::result::Result<Vec<GattService>, GattStatus>,
    },
    /// A read, write, or subscribe request finished.
    Completion {
        /// Platform key of the peripheral.
        peripheral: String,
        /// Identity of the request being answered.
        id: OperationId,
        /// Kind of request being answered.
        kind: CompletionKind,
        /// Characteristic the request targeted.
        characteristic: Uuid,
        /// Result status.
        status: GattStatus,
        /// Value read (empty for writes and subscribes).
        value: Bytes,
    },
    /// The peripheral pushed a new characteristic value.
    Notification {
        /// Platform key of the peripheral.
        peripheral: String,
        /// Characteristic that changed.
        characteristic: Uuid,
        /// New value.
        value: Bytes,
    },
}

impl LinkEvent {
    /// Platform key of the peripheral this event concerns.
    pub fn peripheral_id(&self) -> &str {
        match self {
            Self::Discovered { peripheral, .. } => &peripheral.id,
            Self::Connected { peripheral }
            | Self::ConnectFailed { peripheral, .. }
            | Self::Disconnected { peripheral, .. }
            | Self::ServicesDiscovered { peripheral, .. }
            | Self::Completion { peripheral, .. }
            | Self::Notification { peripheral, .. } => peripheral,
        }
    }
}

/// Outbound interface to the platform radio layer.
///
/// Request methods return `Err` only when the platform refuses to accept the
/// request at all; accepted requests always produce a matching [`LinkEvent`]
/// unless the link goes down first.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LinkPlatform: Send + Sync + 'static {
    /// Report radio and permission preconditions.
    async fn radio_status(&self) -> RadioStatus;

    /// Subscribe to platform events.
    fn events(&self) -> broadcast::Receiver<LinkEvent>;

    /// Start a discovery scan reporting only advertisements carrying `service`.
    async fn start_scan(&self, service: Uuid) -> Result<()>;

    /// Stop any running discovery scan.
    async fn stop_scan(&self) -> Result<()>;

    /// Begin connecting to a peripheral.
    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<()>;

    /// Tear down the link and release the connection resource.
    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<()>;

    /// Begin service discovery on a connected peripheral.
    async fn discover_services(&self, peripheral: &PeripheralHandle) -> Result<()>;

    /// Begin a characteristic read.
    async fn read_characteristic(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: Uuid,
        id: OperationId,
    ) -> Result<()>;

    /// Begin a characteristic write with response.
    async fn write_characteristic(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: Uuid,
        value: Bytes,
        id: OperationId,
    ) -> Result<()>;

    /// Begin enabling notifications (writes the client configuration descriptor).
    async fn enable_notifications(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: Uuid,
        id: OperationId,
    ) -> Result<()>;
}
