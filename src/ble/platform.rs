//! btleplug-backed platform.
//!
//! Adapts the btleplug central API to the event-driven [`LinkPlatform`]
//! contract: every request is started on a spawned task and its result is
//! published on the event stream, echoing the request's [`OperationId`].

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{
    CompletionKind, DisconnectReason, GattService, GattStatus, LinkEvent, LinkPlatform,
    OperationId, PeripheralHandle, RadioStatus,
};
use crate::ble::uuids::CLIENT_CHARACTERISTIC_CONFIG_UUID;
use crate::error::{Error, Result};

/// State shared with the adapter listener and request tasks.
#[derive(Clone)]
struct Shared {
    /// Peripherals seen so far, keyed by platform id string.
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    /// Peripherals whose next adapter disconnect event is ours.
    requested_disconnects: Arc<Mutex<HashSet<String>>>,
    /// Notification forwarders per connected peripheral.
    forwarders: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    /// Last radio state reported by the adapter.
    radio: Arc<RwLock<RadioStatus>>,
    event_tx: broadcast::Sender<LinkEvent>,
}

impl Shared {
    fn emit(&self, event: LinkEvent) {
        let _ = self.event_tx.send(event);
    }

    fn stop_forwarder(&self, id: &str) {
        if let Some(handle) = self.forwarders.lock().remove(id) {
            handle.abort();
        }
    }
}

/// [`LinkPlatform`] on the host's first Bluetooth adapter.
pub struct BtleplugPlatform {
    adapter: Adapter,
    shared: Shared,
    listener: JoinHandle<()>,
}

impl BtleplugPlatform {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RadioUnavailable`] if there is no usable adapter, or
    /// [`Error::PermissionDenied`] if the host refused access.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(Self::radio_error)?;

        let adapter = manager
            .adapters()
            .await
            .map_err(Self::radio_error)?
            .into_iter()
            .next()
            .ok_or(Error::RadioUnavailable)?;

        Self::with_adapter(adapter).await
    }

    /// Use a specific adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        // State updates only arrive on change, so ask for the current one.
        let radio = match adapter.adapter_state().await {
            Ok(state) => radio_from_central(state).unwrap_or(RadioStatus::Ready),
            Err(e) => {
                debug!("Adapter state unavailable: {}", e);
                RadioStatus::Ready
            }
        };
        info!("Initial radio state: {:?}", radio);

        let (event_tx, _) = broadcast::channel(256);
        let shared = Shared {
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            requested_disconnects: Arc::new(Mutex::new(HashSet::new())),
            forwarders: Arc::new(Mutex::new(HashMap::new())),
            radio: Arc::new(RwLock::new(radio)),
            event_tx,
        };

        let mut events = adapter.events().await.map_err(Error::from_btleplug)?;
        let listener = {
            let adapter = adapter.clone();
            let shared = shared.clone();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    Self::handle_event(event, &adapter, &shared).await;
                }
                debug!("Adapter event stream ended");
            })
        };

        Ok(Self {
            adapter,
            shared,
            listener,
        })
    }

    /// The underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn radio_error(err: btleplug::Error) -> Error {
        match Error::from_btleplug(err) {
            Error::PermissionDenied => Error::PermissionDenied,
            other => {
                debug!("Bluetooth unavailable: {}", other);
                Error::RadioUnavailable
            }
        }
    }

    async fn handle_event(event: CentralEvent, adapter: &Adapter, shared: &Shared) {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                Self::report_peripheral(adapter, id, shared).await;
            }
            CentralEvent::DeviceDisconnected(id) => {
                let key = id.to_string();
                shared.stop_forwarder(&key);
                if shared.requested_disconnects.lock().remove(&key) {
                    trace!("Adapter confirmed requested disconnect of {}", key);
                    return;
                }
                debug!("Device disconnected: {}", key);
                shared.emit(LinkEvent::Disconnected {
                    peripheral: key,
                    reason: DisconnectReason::LinkLost,
                });
            }
            CentralEvent::StateUpdate(state) => {
                let Some(status) = radio_from_central(state) else {
                    return;
                };
                info!("Radio state changed: {:?}", status);
                *shared.radio.write() = status;
            }
            _ => {}
        }
    }

    async fn report_peripheral(adapter: &Adapter, id: PeripheralId, shared: &Shared) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let key = id.to_string();
        let handle = PeripheralHandle {
            id: key.clone(),
            address: properties.address.to_string(),
            local_name: properties.local_name.clone(),
            rssi: properties.rssi,
        };

        shared.peripherals.write().insert(key, peripheral);
        shared.emit(LinkEvent::Discovered {
            peripheral: handle,
            services: properties.services,
        });
    }

    fn peripheral(&self, handle: &PeripheralHandle) -> Result<Peripheral> {
        self.shared
            .peripherals
            .read()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| Error::ConnectFailed {
                reason: format!("unknown peripheral {}", handle),
            })
    }

    fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })
    }

    fn complete(
        shared: &Shared,
        peripheral: &str,
        id: OperationId,
        kind: CompletionKind,
        characteristic: Uuid,
        result: std::result::Result<Vec<u8>, btleplug::Error>,
    ) {
        let (status, value) = match result {
            Ok(value) => (GattStatus::SUCCESS, Bytes::from(value)),
            Err(e) => {
                warn!("{:?} {} on {} failed: {}", kind, id, characteristic, e);
                (GattStatus::FAILURE, Bytes::new())
            }
        };

        shared.emit(LinkEvent::Completion {
            peripheral: peripheral.to_string(),
            id,
            kind,
            characteristic,
            status,
            value,
        });
    }
}

impl Drop for BtleplugPlatform {
    fn drop(&mut self) {
        self.listener.abort();
        for (_, handle) in self.shared.forwarders.lock().drain() {
            handle.abort();
        }
    }
}

/// Radio status for an adapter state. `Unknown` carries no information.
fn radio_from_central(state: CentralState) -> Option<RadioStatus> {
    match state {
        CentralState::PoweredOn => Some(RadioStatus::Ready),
        CentralState::PoweredOff => Some(RadioStatus::PoweredOff),
        CentralState::Unknown => None,
    }
}

/// Whether notifications can be enabled: a notify or indicate property, or a
/// client configuration descriptor to write.
fn supports_notifications(characteristic: &Characteristic) -> bool {
    characteristic
        .properties
        .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
        || characteristic
            .descriptors
            .iter()
            .any(|d| d.uuid == CLIENT_CHARACTERISTIC_CONFIG_UUID)
}

#[async_trait]
impl LinkPlatform for BtleplugPlatform {
    async fn radio_status(&self) -> RadioStatus {
        match self.adapter.adapter_state().await {
            Ok(state) => {
                if let Some(status) = radio_from_central(state) {
                    *self.shared.radio.write() = status;
                }
            }
            Err(e) => trace!("Adapter state query failed: {}", e),
        }
        *self.shared.radio.read()
    }

    fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.event_tx.subscribe()
    }

    async fn start_scan(&self, service: Uuid) -> Result<()> {
        debug!("Starting BLE scan for {}", service);
        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(Error::from_btleplug)
    }

    async fn stop_scan(&self) -> Result<()> {
        debug!("Stopping BLE scan");
        self.adapter.stop_scan().await.map_err(Error::from_btleplug)
    }

    async fn connect(&self, handle: &PeripheralHandle) -> Result<()> {
        let peripheral = self.peripheral(handle)?;
        let shared = self.shared.clone();
        let key = handle.id.clone();
        shared.requested_disconnects.lock().remove(&key);

        tokio::spawn(async move {
            if let Err(e) = peripheral.connect().await {
                shared.emit(LinkEvent::ConnectFailed {
                    peripheral: key,
                    reason: e.to_string(),
                });
                return;
            }

            match peripheral.notifications().await {
                Ok(mut notifications) => {
                    let forwarder_shared = shared.clone();
                    let forwarder_key = key.clone();
                    let forwarder = tokio::spawn(async move {
                        while let Some(notification) = notifications.next().await {
                            forwarder_shared.emit(LinkEvent::Notification {
                                peripheral: forwarder_key.clone(),
                                characteristic: notification.uuid,
                                value: Bytes::from(notification.value),
                            });
                        }
                        trace!("Notification stream for {} ended", forwarder_key);
                    });
                    if let Some(old) = shared.forwarders.lock().insert(key.clone(), forwarder) {
                        old.abort();
                    }
                }
                Err(e) => error!("Failed to get notifications stream: {}", e),
            }

            shared.emit(LinkEvent::Connected { peripheral: key });
        });

        Ok(())
    }

    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<()> {
        let peripheral = self.peripheral(handle)?;
        let shared = self.shared.clone();
        let key = handle.id.clone();
        shared.requested_disconnects.lock().insert(key.clone());

        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect {}: {}", key, e);
            }
            shared.stop_forwarder(&key);
            shared.emit(LinkEvent::Disconnected {
                peripheral: key,
                reason: DisconnectReason::Requested,
            });
        });

        Ok(())
    }

    async fn discover_services(&self, handle: &PeripheralHandle) -> Result<()> {
        let peripheral = self.peripheral(handle)?;
        let shared = self.shared.clone();
        let key = handle.id.clone();

        tokio::spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => Ok(peripheral
                    .services()
                    .into_iter()
                    .map(|service| GattService {
                        uuid: service.uuid,
                        characteristics: service
                            .characteristics
                            .into_iter()
                            .map(|c| c.uuid)
                            .collect(),
                    })
                    .collect()),
                Err(e) => {
                    warn!("Failed to discover services on {}: {}", key, e);
                    Err(GattStatus::FAILURE)
                }
            };
            shared.emit(LinkEvent::ServicesDiscovered {
                peripheral: key,
                result,
            });
        });

        Ok(())
    }

    async fn read_characteristic(
        &self,
        handle: &PeripheralHandle,
        characteristic: Uuid,
        id: OperationId,
    ) -> Result<()> {
        let peripheral = self.peripheral(handle)?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        let shared = self.shared.clone();
        let key = handle.id.clone();

        tokio::spawn(async move {
            let result = peripheral.read(&target).await;
            Self::complete(&shared, &key, id, CompletionKind::Read, characteristic, result);
        });

        Ok(())
    }

    async fn write_characteristic(
        &self,
        handle: &PeripheralHandle,
        characteristic: Uuid,
        value: Bytes,
        id: OperationId,
    ) -> Result<()> {
        let peripheral = self.peripheral(handle)?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        let shared = self.shared.clone();
        let key = handle.id.clone();

        tokio::spawn(async move {
            let result = peripheral
                .write(&target, &value, WriteType::WithResponse)
                .await
                .map(|()| Vec::new());
            Self::complete(&shared, &key, id, CompletionKind::Write, characteristic, result);
        });

        Ok(())
    }

    async fn enable_notifications(
        &self,
        handle: &PeripheralHandle,
        characteristic: Uuid,
        id: OperationId,
    ) -> Result<()> {
        let peripheral = self.peripheral(handle)?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        if !supports_notifications(&target) {
            warn!("{} has no notification support", characteristic);
            return Err(Error::OperationFailed {
                status: GattStatus::FAILURE.0,
            });
        }
        let shared = self.shared.clone();
        let key = handle.id.clone();

        tokio::spawn(async move {
            // btleplug writes the client configuration descriptor for us.
            let result = peripheral.subscribe(&target).await.map(|()| Vec::new());
            Self::complete(
                &shared,
                &key,
                id,
                CompletionKind::Subscribe,
                characteristic,
                result,
            );
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{HUMIDITY_CHARACTERISTIC_UUID, MONITOR_SERVICE_UUID};

    #[test]
    fn test_radio_from_central() {
        assert_eq!(
            radio_from_central(CentralState::PoweredOn),
            Some(RadioStatus::Ready)
        );
        // An adapter that is already off must not read as ready
        assert_eq!(
            radio_from_central(CentralState::PoweredOff),
            Some(RadioStatus::PoweredOff)
        );
        assert_eq!(radio_from_central(CentralState::Unknown), None);
    }

    fn humidity(properties: CharPropFlags, descriptors: &[Uuid]) -> Characteristic {
        Characteristic {
            uuid: HUMIDITY_CHARACTERISTIC_UUID,
            service_uuid: MONITOR_SERVICE_UUID,
            properties,
            descriptors: descriptors
                .iter()
                .map(|uuid| btleplug::api::Descriptor {
                    uuid: *uuid,
                    service_uuid: MONITOR_SERVICE_UUID,
                    characteristic_uuid: HUMIDITY_CHARACTERISTIC_UUID,
                })
                .collect(),
        }
    }

    #[test]
    fn test_supports_notifications() {
        assert!(supports_notifications(&humidity(
            CharPropFlags::READ | CharPropFlags::NOTIFY,
            &[]
        )));
        assert!(supports_notifications(&humidity(
            CharPropFlags::READ,
            &[CLIENT_CHARACTERISTIC_CONFIG_UUID]
        )));
        assert!(!supports_notifications(&humidity(CharPropFlags::WRITE, &[])));
    }
}
