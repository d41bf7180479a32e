//! Connection lifecycle management.
//!
//! The [`ConnectionManager`] owns the connect/disconnect state machine for the
//! monitor peripheral. Each [`start`](ConnectionManager::start) opens a new
//! session: a spawned loop that owns the live peripheral handle and a fresh
//! [`TransactionQueue`], and is the only place session state is mutated. The
//! session ends on the first link-down signal and is never reused.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::ble::operation::{Operation, OperationSpec, OperationTicket};
use crate::ble::queue::{Completed, CompletionSignal, QueueStats, TransactionQueue};
use crate::ble::transport::{
    DisconnectReason, GattService, LinkEvent, LinkPlatform, PeripheralHandle,
};
use crate::ble::uuids::{is_monitor_service, CharacteristicRole, MONITOR_SERVICE_UUID};
use crate::config::MonitorConfig;
use crate::dispatcher::TelemetryDispatcher;
use crate::error::{Error, Result};
use crate::protocol::HeaterState;

/// Connection state of the monitor session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No session.
    #[default]
    Idle,
    /// Looking for the peripheral.
    Scanning,
    /// Connect requested.
    Connecting,
    /// Link up, discovering services.
    ServiceDiscovery,
    /// Services verified; operations are being executed.
    Ready,
    /// Disconnect requested.
    Disconnecting,
    /// Session over.
    Disconnected(DisconnectReason),
}

impl ConnectionState {
    /// Check if the session is ready for operations.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if a session is in progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Scanning
                | Self::Connecting
                | Self::ServiceDiscovery
                | Self::Ready
                | Self::Disconnecting
        )
    }

    /// Check if a new session may be started from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Scanning | Self::Disconnected(_))
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ServiceDiscovery => write!(f, "ServiceDiscovery"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Disconnected(reason) => write!(f, "Disconnected ({})", reason),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Platform key of the session's peripheral, if one has been chosen.
    pub peripheral: Option<String>,
    /// The new connection state.
    pub state: ConnectionState,
}

/// Shared state cell: the current state plus its change feed.
#[derive(Clone)]
struct StateCell {
    state: Arc<RwLock<ConnectionState>>,
    peripheral: Arc<RwLock<Option<String>>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl StateCell {
    fn get(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set(&self, new_state: ConnectionState) {
        let mut state = self.state.write();
        self.apply(&mut state, new_state);
    }

    /// Move to `new_state` only if the current state satisfies `allowed`.
    ///
    /// Leaving a terminal state passes through `Idle` first, so every session
    /// starts from `Idle`.
    fn transition_if(
        &self,
        allowed: impl Fn(&ConnectionState) -> bool,
        new_state: ConnectionState,
        peripheral: Option<&str>,
    ) -> bool {
        let mut state = self.state.write();
        if !allowed(&state) {
            return false;
        }
        if let Some(id) = peripheral {
            *self.peripheral.write() = Some(id.to_string());
        }
        if matches!(*state, ConnectionState::Disconnected(_)) {
            self.apply(&mut state, ConnectionState::Idle);
        }
        self.apply(&mut state, new_state);
        true
    }

    fn apply(&self, state: &mut ConnectionState, new_state: ConnectionState) {
        let old_state = std::mem::replace(state, new_state);
        if old_state == new_state {
            return;
        }

        debug!("Connection state changed: {} -> {}", old_state, new_state);
        let _ = self.event_tx.send(ConnectionEvent {
            peripheral: self.peripheral.read().clone(),
            state: new_state,
        });
    }
}

enum Command {
    Enqueue(Operation),
    Disconnect(oneshot::Sender<()>),
}

struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Manages the connection to the monitor peripheral.
pub struct ConnectionManager<P: LinkPlatform + ?Sized> {
    /// Platform to drive.
    platform: Arc<P>,
    /// Where decoded telemetry goes.
    dispatcher: Arc<TelemetryDispatcher>,
    /// Timeouts, retry policy and setup sequence.
    config: MonitorConfig,
    /// Current state and change feed.
    cell: StateCell,
    /// The running session, if any.
    session: Mutex<Option<SessionHandle>>,
    /// Statistics of the most recent session's queue.
    stats: Arc<RwLock<QueueStats>>,
    /// Sessions started so far.
    sessions: AtomicU64,
}

impl<P: LinkPlatform + ?Sized> ConnectionManager<P> {
    /// Create a connection manager.
    pub fn new(
        platform: Arc<P>,
        dispatcher: Arc<TelemetryDispatcher>,
        config: MonitorConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.connection_event_capacity.max(1));

        Self {
            platform,
            dispatcher,
            config,
            cell: StateCell {
                state: Arc::new(RwLock::new(ConnectionState::Idle)),
                peripheral: Arc::new(RwLock::new(None)),
                event_tx,
            },
            session: Mutex::new(None),
            stats: Arc::new(RwLock::new(QueueStats::default())),
            sessions: AtomicU64::new(0),
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.cell.get()
    }

    /// Check if ready for operations.
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Platform key of the current or last session's peripheral.
    pub fn peripheral_id(&self) -> Option<String> {
        self.cell.peripheral.read().clone()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.cell.event_tx.subscribe()
    }

    /// Queue statistics of the current or last session.
    pub fn queue_stats(&self) -> QueueStats {
        *self.stats.read()
    }

    /// Mark the start of a discovery scan.
    ///
    /// Returns `false` if a session is already in progress.
    pub(crate) fn begin_scan(&self) -> bool {
        self.cell.transition_if(
            |state| matches!(state, ConnectionState::Idle | ConnectionState::Disconnected(_)),
            ConnectionState::Scanning,
            None,
        )
    }

    /// Return to `Idle` after a scan that did not lead to a connect.
    pub(crate) fn end_scan(&self) {
        self.cell.transition_if(
            |state| matches!(state, ConnectionState::Scanning),
            ConnectionState::Idle,
            None,
        );
    }

    /// Start a session with a peripheral.
    ///
    /// Only honored from `Idle`, `Scanning` or `Disconnected`; while a session
    /// is connecting or connected this is a no-op. A connect request the
    /// platform refuses returns the state to `Idle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectFailed`] if the platform refused the connect.
    pub async fn start(&self, peripheral: PeripheralHandle) -> Result<()> {
        match self.open_session(peripheral, ConnectionState::can_start) {
            Some(connected) => Self::await_connect(connected).await,
            None => Ok(()),
        }
    }

    /// Start a session with the peripheral a discovery scan just found.
    ///
    /// Unlike [`start`](Self::start) this requires the state to still be
    /// `Scanning`, so a disconnect issued while the scan was running wins.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the scan was abandoned, or
    /// [`Error::ConnectFailed`] if the platform refused the connect.
    pub(crate) async fn start_scanned(&self, peripheral: PeripheralHandle) -> Result<()> {
        match self.open_session(peripheral, |state| matches!(state, ConnectionState::Scanning)) {
            Some(connected) => Self::await_connect(connected).await,
            None => Err(Error::Cancelled),
        }
    }

    /// Move to `Connecting` and spawn the session that will issue the connect.
    ///
    /// The session handle is stored before the connect is awaited, so a
    /// disconnect issued while connecting reaches the session.
    fn open_session(
        &self,
        peripheral: PeripheralHandle,
        allowed: impl Fn(&ConnectionState) -> bool,
    ) -> Option<oneshot::Receiver<Result<()>>> {
        let mut session = self.session.lock();
        if !self
            .cell
            .transition_if(allowed, ConnectionState::Connecting, Some(&peripheral.id))
        {
            debug!(
                "Ignoring start for {}, session is {}",
                peripheral,
                self.state()
            );
            return None;
        }

        // Subscribe before connecting so the link-up signal cannot be missed.
        let events = self.platform.events();

        let number = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        let queue = TransactionQueue::new(self.config.operation_timeout, self.config.retry)
            .starting_at((number << 32) | 1);
        *self.stats.write() = QueueStats::default();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = oneshot::channel();
        let run = Session {
            platform: self.platform.clone(),
            peripheral,
            queue,
            dispatcher: self.dispatcher.clone(),
            cell: self.cell.clone(),
            stats: self.stats.clone(),
            events,
            commands: command_rx,
            setup_sequence: self.config.setup_sequence.clone(),
            disconnect_timeout: self.config.disconnect_timeout,
        };
        let task = tokio::spawn(run.run(connected_tx));

        if let Some(previous) = session.replace(SessionHandle { commands, task }) {
            // A previous session only lingers here after it has already ended.
            previous.task.abort();
        }

        Some(connected_rx)
    }

    async fn await_connect(connected: oneshot::Receiver<Result<()>>) -> Result<()> {
        match connected.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(Error::ConnectFailed { reason })) => Err(Error::ConnectFailed { reason }),
            Ok(Err(other)) => Err(Error::ConnectFailed {
                reason: other.to_string(),
            }),
            Err(_) => Err(Error::ConnectFailed {
                reason: "session ended before connecting".to_string(),
            }),
        }
    }

    /// Submit an operation to the session's transaction queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] unless the session is `Ready`.
    pub fn enqueue(&self, spec: OperationSpec) -> Result<OperationTicket> {
        if !self.is_ready() {
            return Err(Error::NotConnected);
        }

        let session = self.session.lock();
        let handle = session.as_ref().ok_or(Error::NotConnected)?;
        let (operation, ticket) = spec.into_operation();
        handle
            .commands
            .send(Command::Enqueue(operation))
            .map_err(|_| Error::NotConnected)?;
        Ok(ticket)
    }

    /// Disconnect the current session.
    ///
    /// Cancels every pending operation, tears the link down and waits for the
    /// session to reach `Disconnected`. A session still connecting is torn
    /// down as soon as the platform accepts the connect. While scanning the
    /// state simply returns to `Idle`. Idempotent when no session is running.
    pub async fn disconnect(&self) -> Result<()> {
        let commands = {
            let session = self.session.lock();
            match session.as_ref() {
                Some(handle) if !handle.task.is_finished() => handle.commands.clone(),
                _ => {
                    if !self.cell.transition_if(
                        |state| matches!(state, ConnectionState::Scanning),
                        ConnectionState::Idle,
                        None,
                    ) {
                        debug!("Disconnect requested with no session running");
                    }
                    return Ok(());
                }
            }
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if commands.send(Command::Disconnect(ack_tx)).is_err() {
            return Ok(());
        }
        // A dropped ack means the session ended on its own first.
        let _ = ack_rx.await;
        Ok(())
    }

    /// Wait until the state satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimedOut`] if the state does not match within `timeout`.
    pub async fn wait_for_state<F>(&self, predicate: F, timeout: Duration) -> Result<ConnectionState>
    where
        F: Fn(&ConnectionState) -> bool,
    {
        let mut events = self.subscribe();
        let current = self.state();
        if predicate(&current) {
            return Ok(current);
        }

        tokio::time::timeout(timeout, async {
            loop {
                match events.recv().await {
                    Ok(event) if predicate(&event.state) => return Ok(event.state),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let current = self.state();
                        if predicate(&current) {
                            return Ok(current);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::Internal("connection feed closed".to_string()))
                    }
                }
            }
        })
        .await
        .map_err(|_| Error::TimedOut)?
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// One session: owns the link, the queue and all session state.
struct Session<P: LinkPlatform + ?Sized> {
    platform: Arc<P>,
    peripheral: PeripheralHandle,
    queue: TransactionQueue,
    dispatcher: Arc<TelemetryDispatcher>,
    cell: StateCell,
    stats: Arc<RwLock<QueueStats>>,
    events: broadcast::Receiver<LinkEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    setup_sequence: Vec<OperationSpec>,
    disconnect_timeout: Duration,
}

impl<P: LinkPlatform + ?Sized> Session<P> {
    async fn run(mut self, connected: oneshot::Sender<Result<()>>) {
        info!("Connecting to {}", self.peripheral);
        if let Err(e) = self.platform.connect(&self.peripheral).await {
            warn!("Connect to {} failed: {}", self.peripheral, e);
            self.cell.set(ConnectionState::Idle);
            let _ = connected.send(Err(e));
            return;
        }
        let _ = connected.send(Ok(()));
        debug!("Session for {} started", self.peripheral);

        loop {
            if self.cell.get().is_ready() {
                self.queue.pump(&*self.platform, &self.peripheral).await;
            }
            *self.stats.write() = self.queue.stats();

            let deadline = self.queue.next_deadline();
            // Commands first so an enqueue sent before a link-down signal is
            // still resolved by this session.
            let flow = tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Enqueue(operation)) => {
                        self.queue.enqueue(operation);
                        Flow::Continue
                    }
                    Some(Command::Disconnect(ack)) => {
                        self.tear_down(DisconnectReason::Requested).await;
                        let _ = ack.send(());
                        Flow::Stop
                    }
                    // Manager dropped.
                    None => {
                        self.tear_down(DisconnectReason::Requested).await;
                        Flow::Stop
                    }
                },
                event = self.events.recv() => match event {
                    Ok(event) => self.on_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Session missed {} platform events", skipped);
                        Flow::Continue
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("Platform event stream closed");
                        self.end(DisconnectReason::TransportClosed);
                        Flow::Stop
                    }
                },
                _ = wait_until(deadline) => {
                    self.queue.expire(Instant::now());
                    Flow::Continue
                }
            };

            if flow == Flow::Stop {
                break;
            }
        }

        *self.stats.write() = self.queue.stats();
        info!("Session for {} ended: {}", self.peripheral, self.cell.get());
    }

    async fn on_event(&mut self, event: LinkEvent) -> Flow {
        if event.peripheral_id() != self.peripheral.id {
            return Flow::Continue;
        }

        match event {
            LinkEvent::Connected { .. } => {
                if self.cell.get() != ConnectionState::Connecting {
                    debug!("Ignoring duplicate connected signal from {}", self.peripheral);
                    return Flow::Continue;
                }
                info!("Connected to {}", self.peripheral);
                self.cell.set(ConnectionState::ServiceDiscovery);
                if let Err(e) = self.platform.discover_services(&self.peripheral).await {
                    warn!("Service discovery request failed: {}", e);
                    self.tear_down(DisconnectReason::DiscoveryFailed).await;
                    return Flow::Stop;
                }
                Flow::Continue
            }
            LinkEvent::ConnectFailed { reason, .. } => {
                if self.cell.get() != ConnectionState::Connecting {
                    return Flow::Continue;
                }
                warn!("Connect to {} failed: {}", self.peripheral, reason);
                self.end_quietly();
                self.cell.set(ConnectionState::Idle);
                Flow::Stop
            }
            LinkEvent::ServicesDiscovered { result, .. } => {
                if self.cell.get() != ConnectionState::ServiceDiscovery {
                    debug!("Ignoring service discovery result outside discovery");
                    return Flow::Continue;
                }
                match result {
                    Ok(services) => match missing_characteristic(&services) {
                        None => {
                            self.cell.set(ConnectionState::Ready);
                            self.enqueue_setup();
                            Flow::Continue
                        }
                        Some(missing) => {
                            warn!("{} is missing {}", self.peripheral, missing);
                            self.tear_down(DisconnectReason::ServiceNotFound).await;
                            Flow::Stop
                        }
                    },
                    Err(status) => {
                        warn!(
                            "Service discovery on {} failed with status {:#04x}",
                            self.peripheral, status.0
                        );
                        self.tear_down(DisconnectReason::DiscoveryFailed).await;
                        Flow::Stop
                    }
                }
            }
            LinkEvent::Completion {
                id,
                kind,
                characteristic,
                status,
                value,
                ..
            } => {
                let signal = CompletionSignal {
                    id,
                    kind,
                    characteristic,
                    status,
                    value,
                };
                if let Some(completed) = self.queue.on_completion(signal) {
                    self.on_completed(completed);
                }
                Flow::Continue
            }
            LinkEvent::Notification {
                characteristic,
                value,
                ..
            } => {
                match CharacteristicRole::from_uuid(&characteristic) {
                    Some(role) if role.is_telemetry() => {
                        // Decode failures are counted and logged by the dispatcher.
                        let _ = self.dispatcher.ingest_notification(role, &value);
                    }
                    _ => trace!("Ignoring notification from {}", characteristic),
                }
                Flow::Continue
            }
            LinkEvent::Disconnected { reason, .. } => {
                info!("{} disconnected: {}", self.peripheral, reason);
                self.end(reason);
                Flow::Stop
            }
            LinkEvent::Discovered { .. } => Flow::Continue,
        }
    }

    fn on_completed(&self, completed: Completed) {
        match completed {
            Completed::Read { role, value } => {
                let _ = self.dispatcher.ingest_read(role, &value);
            }
            Completed::Write {
                role: CharacteristicRole::HeaterWrite,
                payload,
            } => match HeaterState::decode(&payload) {
                Ok(state) => {
                    self.dispatcher.record_heater(state);
                }
                Err(e) => debug!("Heater write echo not recorded: {}", e),
            },
            Completed::Write { role, .. } => debug!("Write to {} acknowledged", role),
            Completed::Subscribe { role } => debug!("Notifications enabled for {}", role),
        }
    }

    /// Enqueue the setup sequence. Steps are independent; a failing step does
    /// not stop the rest.
    fn enqueue_setup(&mut self) {
        for spec in self.setup_sequence.clone() {
            let label = format!("{} {}", spec.kind.label(), spec.role);
            let (operation, ticket) = spec.into_operation();
            self.queue.enqueue(operation);
            tokio::spawn(async move {
                let outcome = ticket.await;
                if outcome.is_success() {
                    trace!("Setup step {} succeeded", label);
                } else {
                    warn!("Setup step {} ended: {:?}", label, outcome);
                }
            });
        }
    }

    fn end_quietly(&mut self) {
        self.queue.cancel_all();
        *self.stats.write() = self.queue.stats();
    }

    /// End the session after the link has already gone down.
    fn end(&mut self, reason: DisconnectReason) {
        self.queue.cancel_all();
        *self.stats.write() = self.queue.stats();
        self.cell.set(ConnectionState::Disconnected(reason));
    }

    /// Tear the link down from this side and end the session.
    ///
    /// Waits up to the disconnect timeout for the link-down signal so it is
    /// consumed here rather than by a later session.
    async fn tear_down(&mut self, reason: DisconnectReason) {
        self.cell.set(ConnectionState::Disconnecting);
        let cancelled = self.queue.cancel_all();
        *self.stats.write() = self.queue.stats();
        debug!("Disconnecting {} ({} operations cancelled)", self.peripheral, cancelled);

        match self.platform.disconnect(&self.peripheral).await {
            Ok(()) => {
                let id = self.peripheral.id.clone();
                let events = &mut self.events;
                let link_down = async {
                    loop {
                        match events.recv().await {
                            Ok(LinkEvent::Disconnected { peripheral, .. }) if peripheral == id => {
                                return
                            }
                            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                };
                if tokio::time::timeout(self.disconnect_timeout, link_down)
                    .await
                    .is_err()
                {
                    warn!("No link-down signal from {}", self.peripheral);
                }
            }
            Err(e) => error!("Failed to disconnect {}: {}", self.peripheral, e),
        }

        self.cell.set(ConnectionState::Disconnected(reason));
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The first expected service or characteristic absent from `services`.
fn missing_characteristic(services: &[GattService]) -> Option<String> {
    let Some(service) = services.iter().find(|s| is_monitor_service(&s.uuid)) else {
        return Some(format!("service {}", MONITOR_SERVICE_UUID));
    };

    CharacteristicRole::ALL
        .iter()
        .find(|role| !service.characteristics.contains(&role.uuid()))
        .map(|role| format!("{} characteristic {}", role, role.uuid()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::operation::OperationOutcome;
    use crate::ble::simulated::SimulatedPlatform;
    use crate::ble::transport::CompletionKind;
    use crate::ble::uuids::*;

    const WAIT: Duration = Duration::from_secs(2);

    fn setup() -> (
        Arc<SimulatedPlatform>,
        Arc<TelemetryDispatcher>,
        ConnectionManager<SimulatedPlatform>,
    ) {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.set_value(HUMIDITY_CHARACTERISTIC_UUID, vec![45]);
        platform.set_value(TEMPERATURE_CHARACTERISTIC_UUID, vec![21]);
        let dispatcher = Arc::new(TelemetryDispatcher::default());
        let config = MonitorConfig::default().with_operation_timeout(Duration::from_millis(200));
        let manager = ConnectionManager::new(platform.clone(), dispatcher.clone(), config);
        (platform, dispatcher, manager)
    }

    fn handle() -> PeripheralHandle {
        PeripheralHandle::new("D4:36:39:6F:AA:01")
    }

    #[test]
    fn test_state_helpers() {
        assert!(ConnectionState::Idle.can_start());
        assert!(ConnectionState::Disconnected(DisconnectReason::LinkLost).can_start());
        assert!(!ConnectionState::Ready.can_start());
        assert!(ConnectionState::ServiceDiscovery.is_active());
        assert_eq!(
            ConnectionState::Disconnected(DisconnectReason::Requested).to_string(),
            "Disconnected (requested)"
        );
    }

    #[test]
    fn test_missing_characteristic() {
        let full = SimulatedPlatform::monitor_service();
        assert_eq!(missing_characteristic(&[full.clone()]), None);

        let mut partial = full;
        partial.characteristics.retain(|c| *c != HEATER_STATE_CHARACTERISTIC_UUID);
        assert!(missing_characteristic(&[partial])
            .unwrap()
            .starts_with("Heater"));

        assert!(missing_characteristic(&[]).unwrap().starts_with("service"));
    }

    #[tokio::test]
    async fn test_start_reaches_ready_and_runs_setup() {
        let (platform, dispatcher, manager) = setup();
        let mut events = manager.subscribe();

        manager.start(handle()).await.unwrap();
        manager
            .wait_for_state(ConnectionState::is_ready, WAIT)
            .await
            .unwrap();
        platform.wait_for_gatt_requests(5, WAIT).await.unwrap();

        let states: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|event| event.state)
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::ServiceDiscovery,
                ConnectionState::Ready,
            ]
        );

        let ticket = manager
            .enqueue(OperationSpec::read(CharacteristicRole::TemperatureReadNotify))
            .unwrap();
        assert!(ticket.await.is_success());
        assert_eq!(
            dispatcher
                .latest_for(CharacteristicRole::HumidityReadNotify)
                .map(|s| s.value),
            Some(45)
        );
        assert_eq!(platform.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_start_is_noop() {
        let (platform, _dispatcher, manager) = setup();

        manager.start(handle()).await.unwrap();
        manager.start(handle()).await.unwrap();
        manager
            .wait_for_state(ConnectionState::is_ready, WAIT)
            .await
            .unwrap();
        manager.start(handle()).await.unwrap();

        assert_eq!(platform.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_connected_signal_is_ignored() {
        let (platform, _dispatcher, manager) = setup();
        manager.start(handle()).await.unwrap();
        manager
            .wait_for_state(ConnectionState::is_ready, WAIT)
            .await
            .unwrap();

        platform.emit(LinkEvent::Connected {
            peripheral: handle().id,
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let discoveries = platform
            .requests()
            .into_iter()
            .filter(|r| matches!(r, crate::ble::simulated::LinkRequest::DiscoverServices(_)))
            .count();
        assert_eq!(discoveries, 1);
        assert!(manager.is_ready());
    }

    #[tokio::test]
    async fn test_connect_error_returns_to_idle() {
        let (platform, _dispatcher, manager) = setup();
        platform.set_connect_error(true);

        let result = manager.start(handle()).await;
        assert!(matches!(result, Err(Error::ConnectFailed { .. })));
        assert_eq!(manager.state(), ConnectionState::Idle);

        // The caller may retry
        platform.set_connect_error(false);
        manager.start(handle()).await.unwrap();
        manager
            .wait_for_state(ConnectionState::is_ready, WAIT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_service_disconnects() {
        let (platform, _dispatcher, manager) = setup();
        platform.set_services(vec![GattService {
            uuid: MONITOR_SERVICE_UUID,
            characteristics: vec![HUMIDITY_CHARACTERISTIC_UUID],
        }]);

        manager.start(handle()).await.unwrap();
        let state = manager
            .wait_for_state(|s| matches!(s, ConnectionState::Disconnected(_)), WAIT)
            .await
            .unwrap();

        assert_eq!(
            state,
            ConnectionState::Disconnected(DisconnectReason::ServiceNotFound)
        );
        assert!(platform.gatt_requests().is_empty());
    }

    #[tokio::test]
    async fn test_link_loss_cancels_pending() {
        let (platform, _dispatcher, manager) = setup();
        // Leave the first setup read hanging
        platform.swallow_requests(HUMIDITY_CHARACTERISTIC_UUID, 1);

        manager.start(handle()).await.unwrap();
        manager
            .wait_for_state(ConnectionState::is_ready, WAIT)
            .await
            .unwrap();
        let ticket = manager
            .enqueue(OperationSpec::read(CharacteristicRole::TemperatureReadNotify))
            .unwrap();
        platform.wait_for_gatt_requests(1, WAIT).await.unwrap();

        platform.drop_link(&handle().id);

        assert!(matches!(ticket.await, OperationOutcome::Cancelled));
        assert_eq!(
            manager.state(),
            ConnectionState::Disconnected(DisconnectReason::LinkLost)
        );
        assert_eq!(manager.queue_stats().cancelled, 6);
        assert!(matches!(
            manager.enqueue(OperationSpec::read(CharacteristicRole::HumidityReadNotify)),
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (platform, _dispatcher, manager) = setup();

        // Nothing running
        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Idle);

        manager.start(handle()).await.unwrap();
        manager
            .wait_for_state(ConnectionState::is_ready, WAIT)
            .await
            .unwrap();
        manager.disconnect().await.unwrap();
        assert_eq!(
            manager.state(),
            ConnectionState::Disconnected(DisconnectReason::Requested)
        );

        manager.disconnect().await.unwrap();
        let disconnects = platform
            .requests()
            .into_iter()
            .filter(|r| matches!(r, crate::ble::simulated::LinkRequest::Disconnect(_)))
            .count();
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_tears_down() {
        let (platform, _dispatcher, manager) = setup();
        platform.set_connect_delay(Duration::from_millis(100));
        let manager = Arc::new(manager);
        let mut events = manager.subscribe();

        let starter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start(handle()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.state(), ConnectionState::Connecting);

        manager.disconnect().await.unwrap();
        starter.await.unwrap().unwrap();
        assert_eq!(
            manager.state(),
            ConnectionState::Disconnected(DisconnectReason::Requested)
        );

        // The session must not come back up afterwards
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            manager.state(),
            ConnectionState::Disconnected(DisconnectReason::Requested)
        );
        assert!(platform.gatt_requests().is_empty());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.state);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected(DisconnectReason::Requested),
            ]
        );
    }

    #[tokio::test]
    async fn test_disconnect_while_scanning_blocks_connect() {
        let (platform, _dispatcher, manager) = setup();
        assert!(manager.begin_scan());

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Idle);

        // The scan's match arrives after the disconnect
        let result = manager.start_scanned(handle()).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(platform.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_heater_write_is_recorded() {
        let (platform, dispatcher, manager) = setup();
        manager.start(handle()).await.unwrap();
        manager
            .wait_for_state(ConnectionState::is_ready, WAIT)
            .await
            .unwrap();

        let ticket = manager
            .enqueue(OperationSpec::heater(HeaterState::On))
            .unwrap();
        assert!(ticket.await.is_success());

        let heater = dispatcher
            .latest_for(CharacteristicRole::HeaterWrite)
            .unwrap();
        assert_eq!(heater.heater_state(), Some(HeaterState::On));
        assert!(platform
            .gatt_requests()
            .contains(&(CompletionKind::Write, HEATER_STATE_CHARACTERISTIC_UUID)));
    }
}
