//! In-process platform simulator.
//!
//! [`SimulatedPlatform`] implements [`LinkPlatform`] entirely in memory so the
//! session logic can be exercised without radio hardware. Completions are
//! delivered from spawned tasks, after the issuing call has returned, the same
//! way a real stack delivers callbacks. The simulator also records every
//! request and the highest number of GATT requests it ever saw outstanding.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::transport::{
    CompletionKind, DisconnectReason, GattService, GattStatus, LinkEvent, LinkPlatform,
    OperationId, PeripheralHandle, RadioStatus,
};
use crate::ble::uuids::*;
use crate::error::{Error, Result};

/// A request the simulator received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkRequest {
    /// Scan started with a service filter.
    StartScan(Uuid),
    /// Scan stopped.
    StopScan,
    /// Connect to a peripheral.
    Connect(String),
    /// Disconnect from a peripheral.
    Disconnect(String),
    /// Discover services.
    DiscoverServices(String),
    /// GATT read, write, or notification enable.
    Gatt {
        /// Request identity.
        id: OperationId,
        /// Request kind.
        kind: CompletionKind,
        /// Target characteristic.
        characteristic: Uuid,
        /// Written value (empty otherwise).
        value: Bytes,
    },
}

struct SimState {
    radio: RadioStatus,
    advertisers: Vec<(PeripheralHandle, Vec<Uuid>)>,
    scanning: bool,
    scan_starts: usize,
    scan_stops: usize,
    fail_scan: bool,
    connect_error: bool,
    connect_refused: bool,
    connect_attempts: usize,
    connect_delay: Duration,
    services: Vec<GattService>,
    discovery_status: Option<GattStatus>,
    values: HashMap<Uuid, Bytes>,
    statuses: HashMap<Uuid, GattStatus>,
    swallow: HashMap<Uuid, u32>,
    response_limit: Option<usize>,
    answered: usize,
    response_delay: Duration,
    in_flight: usize,
    max_in_flight: usize,
    history: Vec<LinkRequest>,
}

/// In-memory [`LinkPlatform`] for tests and demos.
pub struct SimulatedPlatform {
    state: Arc<Mutex<SimState>>,
    events: broadcast::Sender<LinkEvent>,
}

impl SimulatedPlatform {
    /// Create a simulator exposing a complete monitor service.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);

        Self {
            state: Arc::new(Mutex::new(SimState {
                radio: RadioStatus::Ready,
                advertisers: Vec::new(),
                scanning: false,
                scan_starts: 0,
                scan_stops: 0,
                fail_scan: false,
                connect_error: false,
                connect_refused: false,
                connect_attempts: 0,
                connect_delay: Duration::ZERO,
                services: vec![Self::monitor_service()],
                discovery_status: None,
                values: HashMap::new(),
                statuses: HashMap::new(),
                swallow: HashMap::new(),
                response_limit: None,
                answered: 0,
                response_delay: Duration::ZERO,
                in_flight: 0,
                max_in_flight: 0,
                history: Vec::new(),
            })),
            events,
        }
    }

    /// The monitor service with all three characteristics.
    pub fn monitor_service() -> GattService {
        GattService {
            uuid: MONITOR_SERVICE_UUID,
            characteristics: CharacteristicRole::ALL
                .iter()
                .map(|role| role.uuid())
                .collect(),
        }
    }

    // === Scripting ===

    /// Advertise a peripheral with the given service UUIDs.
    pub fn add_advertiser(&self, peripheral: PeripheralHandle, services: Vec<Uuid>) {
        self.state.lock().advertisers.push((peripheral, services));
    }

    /// Set the reported radio status.
    pub fn set_radio_status(&self, status: RadioStatus) {
        self.state.lock().radio = status;
    }

    /// Make `start_scan` fail.
    pub fn set_fail_scan(&self, fail: bool) {
        self.state.lock().fail_scan = fail;
    }

    /// Make `connect` return an error immediately.
    pub fn set_connect_error(&self, fail: bool) {
        self.state.lock().connect_error = fail;
    }

    /// Make accepted connects fail asynchronously.
    pub fn set_connect_refused(&self, refused: bool) {
        self.state.lock().connect_refused = refused;
    }

    /// Make every `connect` call take `delay` before it returns.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Replace the services reported by discovery.
    pub fn set_services(&self, services: Vec<GattService>) {
        self.state.lock().services = services;
    }

    /// Make service discovery fail with a status.
    pub fn set_discovery_failure(&self, status: Option<GattStatus>) {
        self.state.lock().discovery_status = status;
    }

    /// Set the value returned by reads of a characteristic.
    pub fn set_value(&self, characteristic: Uuid, value: impl Into<Bytes>) {
        self.state.lock().values.insert(characteristic, value.into());
    }

    /// Complete requests for a characteristic with a status.
    pub fn set_status(&self, characteristic: Uuid, status: GattStatus) {
        self.state.lock().statuses.insert(characteristic, status);
    }

    /// Leave the next `count` requests for a characteristic unanswered.
    pub fn swallow_requests(&self, characteristic: Uuid, count: u32) {
        self.state.lock().swallow.insert(characteristic, count);
    }

    /// Answer only the first `limit` GATT requests, then stay silent.
    pub fn set_response_limit(&self, limit: Option<usize>) {
        self.state.lock().response_limit = limit;
    }

    /// Delay before each GATT completion is delivered.
    pub fn set_response_delay(&self, delay: Duration) {
        self.state.lock().response_delay = delay;
    }

    /// Push a notification from a peripheral.
    pub fn notify(&self, peripheral: &str, characteristic: Uuid, value: impl Into<Bytes>) {
        self.emit(LinkEvent::Notification {
            peripheral: peripheral.to_string(),
            characteristic,
            value: value.into(),
        });
    }

    /// Drop the link from the peripheral side.
    pub fn drop_link(&self, peripheral: &str) {
        debug!("Simulated link loss for {}", peripheral);
        self.emit(LinkEvent::Disconnected {
            peripheral: peripheral.to_string(),
            reason: DisconnectReason::LinkLost,
        });
    }

    /// Inject an arbitrary event.
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    // === Inspection ===

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<LinkRequest> {
        self.state.lock().history.clone()
    }

    /// GATT requests received, as (kind, characteristic) pairs.
    pub fn gatt_requests(&self) -> Vec<(CompletionKind, Uuid)> {
        self.state
            .lock()
            .history
            .iter()
            .filter_map(|request| match request {
                LinkRequest::Gatt {
                    kind,
                    characteristic,
                    ..
                } => Some((*kind, *characteristic)),
                _ => None,
            })
            .collect()
    }

    /// Highest number of answered GATT requests ever outstanding at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }

    /// Number of scans started.
    pub fn scan_starts(&self) -> usize {
        self.state.lock().scan_starts
    }

    /// Number of scan stop requests.
    pub fn scan_stops(&self) -> usize {
        self.state.lock().scan_stops
    }

    /// Number of connect requests accepted or refused.
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    /// Wait until at least `count` GATT requests have been received.
    pub async fn wait_for_gatt_requests(&self, count: usize, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, async {
            while self.gatt_requests().len() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .map_err(|_| Error::TimedOut)
    }

    fn record(&self, request: LinkRequest) {
        trace!("Simulator request: {:?}", request);
        self.state.lock().history.push(request);
    }

    fn spawn_event(&self, event: LinkEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let _ = events.send(event);
        });
    }

    fn gatt(
        &self,
        peripheral: &PeripheralHandle,
        kind: CompletionKind,
        characteristic: Uuid,
        value: Bytes,
        id: OperationId,
    ) {
        self.record(LinkRequest::Gatt {
            id,
            kind,
            characteristic,
            value: value.clone(),
        });

        let (status, response, delay) = {
            let mut state = self.state.lock();

            let swallowed = match state.swallow.get_mut(&characteristic) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            let over_limit = state
                .response_limit
                .is_some_and(|limit| state.answered >= limit);
            if swallowed || over_limit {
                debug!("Simulator leaving {} unanswered", id);
                return;
            }

            state.answered += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);

            let status = state
                .statuses
                .get(&characteristic)
                .copied()
                .unwrap_or(GattStatus::SUCCESS);
            let response = match kind {
                CompletionKind::Read => state
                    .values
                    .get(&characteristic)
                    .cloned()
                    .unwrap_or_default(),
                CompletionKind::Write => {
                    state.values.insert(characteristic, value);
                    Bytes::new()
                }
                CompletionKind::Subscribe => Bytes::new(),
            };
            (status, response, state.response_delay)
        };

        let event = LinkEvent::Completion {
            peripheral: peripheral.id.clone(),
            id,
            kind,
            characteristic,
            status,
            value: response,
        };
        let state = self.state.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            state.lock().in_flight -= 1;
            let _ = events.send(event);
        });
    }
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkPlatform for SimulatedPlatform {
    async fn radio_status(&self) -> RadioStatus {
        self.state.lock().radio
    }

    fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    async fn start_scan(&self, service: Uuid) -> Result<()> {
        self.record(LinkRequest::StartScan(service));

        let matches: Vec<_> = {
            let mut state = self.state.lock();
            if state.fail_scan {
                return Err(Error::RadioUnavailable);
            }
            state.scanning = true;
            state.scan_starts += 1;
            state
                .advertisers
                .iter()
                .filter(|(_, services)| services.contains(&service))
                .cloned()
                .collect()
        };

        // Platform filtering is advisory; non-matching advertisers are still reported
        // so callers must check the service list themselves.
        let others: Vec<_> = self
            .state
            .lock()
            .advertisers
            .iter()
            .filter(|(_, services)| !services.contains(&service))
            .cloned()
            .collect();

        for (peripheral, services) in others.into_iter().chain(matches) {
            self.spawn_event(LinkEvent::Discovered {
                peripheral,
                services,
            });
        }

        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(LinkRequest::StopScan);
        let mut state = self.state.lock();
        state.scanning = false;
        state.scan_stops += 1;
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<()> {
        self.record(LinkRequest::Connect(peripheral.id.clone()));

        let (error, refused, delay) = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            (state.connect_error, state.connect_refused, state.connect_delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if error {
            return Err(Error::ConnectFailed {
                reason: "simulated connect error".to_string(),
            });
        }

        let event = if refused {
            LinkEvent::ConnectFailed {
                peripheral: peripheral.id.clone(),
                reason: "simulated refusal".to_string(),
            }
        } else {
            LinkEvent::Connected {
                peripheral: peripheral.id.clone(),
            }
        };
        self.spawn_event(event);
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<()> {
        self.record(LinkRequest::Disconnect(peripheral.id.clone()));
        self.spawn_event(LinkEvent::Disconnected {
            peripheral: peripheral.id.clone(),
            reason: DisconnectReason::Requested,
        });
        Ok(())
    }

    async fn discover_services(&self, peripheral: &PeripheralHandle) -> Result<()> {
        self.record(LinkRequest::DiscoverServices(peripheral.id.clone()));

        let result = {
            let state = self.state.lock();
            match state.discovery_status {
                Some(status) => Err(status),
                None => Ok(state.services.clone()),
            }
        };
        self.spawn_event(LinkEvent::ServicesDiscovered {
            peripheral: peripheral.id.clone(),
            result,
        });
        Ok(())
    }

    async fn read_characteristic(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: Uuid,
        id: OperationId,
    ) -> Result<()> {
        self.gatt(peripheral, CompletionKind::Read, characteristic, Bytes::new(), id);
        Ok(())
    }

    async fn write_characteristic(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: Uuid,
        value: Bytes,
        id: OperationId,
    ) -> Result<()> {
        self.gatt(peripheral, CompletionKind::Write, characteristic, value, id);
        Ok(())
    }

    async fn enable_notifications(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: Uuid,
        id: OperationId,
    ) -> Result<()> {
        self.gatt(
            peripheral,
            CompletionKind::Subscribe,
            characteristic,
            Bytes::new(),
            id,
        );
        Ok(())
    }
}
