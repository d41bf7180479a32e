//! Sensor monitor facade.
//!
//! [`SensorMonitor`] is the entry point a UI shell talks to. It checks the
//! radio preconditions, runs the discovery scan, hands the found peripheral to
//! the [`ConnectionManager`] and exposes the telemetry the session produces.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::ble::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::ble::operation::OperationSpec;
use crate::ble::platform::BtleplugPlatform;
use crate::ble::queue::QueueStats;
use crate::ble::scanner::PeripheralLocator;
use crate::ble::transport::{DisconnectReason, LinkPlatform, RadioStatus};
use crate::ble::uuids::{CharacteristicRole, MONITOR_SERVICE_UUID};
use crate::config::MonitorConfig;
use crate::data::TelemetrySample;
use crate::dispatcher::TelemetryDispatcher;
use crate::error::{Error, Result};
use crate::protocol::HeaterState;

/// Handle for a registered callback.
///
/// The callback is unregistered when this handle is dropped.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
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

/// Monitor for one datacenter sensor peripheral.
pub struct SensorMonitor<P: LinkPlatform + ?Sized = BtleplugPlatform> {
    /// Platform radio layer.
    platform: Arc<P>,
    /// Discovery.
    locator: PeripheralLocator<P>,
    /// Session state machine.
    connection: ConnectionManager<P>,
    /// Decoded telemetry.
    dispatcher: Arc<TelemetryDispatcher>,
    /// Configuration.
    config: MonitorConfig,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl SensorMonitor<BtleplugPlatform> {
    /// Create a monitor on the host's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Self::with_config(MonitorConfig::default()).await
    }

    /// Create a monitor on the host's first Bluetooth adapter with a configuration.
    pub async fn with_config(config: MonitorConfig) -> Result<Self> {
        let platform = BtleplugPlatform::new().await?;
        Self::with_platform(Arc::new(platform), config)
    }
}

impl<P: LinkPlatform + ?Sized> SensorMonitor<P> {
    /// Create a monitor on any platform.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the configuration is invalid.
    pub fn with_platform(platform: Arc<P>, config: MonitorConfig) -> Result<Self> {
        config.validate()?;

        let dispatcher = Arc::new(TelemetryDispatcher::new(config.telemetry_capacity));
        let connection =
            ConnectionManager::new(platform.clone(), dispatcher.clone(), config.clone());

        Ok(Self {
            locator: PeripheralLocator::new(platform.clone()),
            platform,
            connection,
            dispatcher,
            config,
            callback_counter: AtomicU64::new(0),
        })
    }

    // === Session control ===

    /// Scan for the monitor peripheral and start a session with the first match.
    ///
    /// Returns once the connect request has been accepted; use
    /// [`wait_until_ready`](Self::wait_until_ready) or the connection feed to
    /// follow the session. A no-op while a session is already in progress.
    ///
    /// # Errors
    ///
    /// - [`Error::RadioUnavailable`] / [`Error::PermissionDenied`] if the
    ///   platform preconditions are not met.
    /// - [`Error::NotFound`] if nothing matched within the scan window.
    /// - [`Error::Cancelled`] if the scan was stopped or a disconnect was
    ///   requested before the connect went out.
    /// - [`Error::ConnectFailed`] if the platform refused the connect.
    pub async fn request_scan_and_connect(&self) -> Result<()> {
        match self.platform.radio_status().await {
            RadioStatus::Ready => {}
            RadioStatus::PoweredOff | RadioStatus::Unsupported => {
                return Err(Error::RadioUnavailable)
            }
            RadioStatus::PermissionDenied => return Err(Error::PermissionDenied),
        }

        if !self.connection.begin_scan() {
            debug!(
                "Scan and connect ignored, session is {}",
                self.connection.state()
            );
            return Ok(());
        }
        let _scan_state = ScanState(&self.connection);

        let peripheral = self
            .locator
            .locate(MONITOR_SERVICE_UUID, self.config.scan_window)
            .await?;

        self.connection.start_scanned(peripheral).await
    }

    /// Wait until the session is `Ready`.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceNotFound`] if the peripheral lacked the monitor service.
    /// - [`Error::ConnectFailed`] if the session ended before becoming ready.
    /// - [`Error::TimedOut`] if neither happened within `timeout`.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let state = self
            .connection
            .wait_for_state(
                |state| {
                    matches!(
                        state,
                        ConnectionState::Ready
                            | ConnectionState::Idle
                            | ConnectionState::Disconnected(_)
                    )
                },
                timeout,
            )
            .await?;

        match state {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Disconnected(DisconnectReason::ServiceNotFound) => {
                Err(Error::ServiceNotFound {
                    uuid: MONITOR_SERVICE_UUID.to_string(),
                })
            }
            other => Err(Error::ConnectFailed {
                reason: format!("session ended in state {}", other),
            }),
        }
    }

    /// Stop a scan started by [`request_scan_and_connect`](Self::request_scan_and_connect).
    pub fn stop_scan(&self) {
        self.locator.stop();
    }

    /// Disconnect the current session, cancelling pending operations.
    ///
    /// Stops a running scan as well, and a peripheral it already matched is
    /// not connected. Idempotent.
    pub async fn request_disconnect(&self) -> Result<()> {
        if self.connection.state() == ConnectionState::Scanning {
            self.locator.stop();
        }
        self.connection.disconnect().await
    }

    /// Command the heater and wait for the peripheral to acknowledge.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] unless the session is ready, or the
    /// write's failure, timeout or cancellation.
    pub async fn request_heater_state(&self, on: bool) -> Result<()> {
        let state = HeaterState::from(on);
        info!("Setting heater {:?}", state);

        let ticket = self.connection.enqueue(OperationSpec::heater(state))?;
        ticket.await.into_result().map(|_| ())
    }

    /// Submit an arbitrary operation to the session's queue and wait for it.
    pub async fn submit(&self, spec: OperationSpec) -> Result<Option<bytes::Bytes>> {
        self.connection.enqueue(spec)?.await.into_result()
    }

    /// Stop scanning and disconnect.
    pub async fn shutdown(&self) -> Result<()> {
        self.locator.stop();
        self.connection.disconnect().await
    }

    // === Telemetry ===

    /// Latest sample per characteristic role.
    pub fn latest_telemetry(&self) -> HashMap<CharacteristicRole, TelemetrySample> {
        self.dispatcher.latest()
    }

    /// Latest sample for one role.
    pub fn latest_for(&self, role: CharacteristicRole) -> Option<TelemetrySample> {
        self.dispatcher.latest_for(role)
    }

    /// Subscribe to every telemetry sample.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetrySample> {
        self.dispatcher.subscribe()
    }

    /// Register a callback for telemetry samples.
    pub fn on_telemetry<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&TelemetrySample) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.dispatcher.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(sample) => callback(&sample),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Telemetry callback skipped {} samples", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Number of samples dropped because they failed to decode.
    pub fn dropped_samples(&self) -> u64 {
        self.dispatcher.dropped_samples()
    }

    // === Connection ===

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    /// Register a callback for connection state changes.
    pub fn on_connection_state<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.connection.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event.state),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Platform key of the current or last session's peripheral.
    pub fn peripheral_id(&self) -> Option<String> {
        self.connection.peripheral_id()
    }

    /// Queue statistics of the current or last session.
    pub fn queue_stats(&self) -> QueueStats {
        self.connection.queue_stats()
    }

    /// Whether a discovery scan is running.
    pub fn is_scanning(&self) -> bool {
        self.locator.is_scanning()
    }

    /// The configuration in use.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }
}

/// Returns the state to `Idle` if a scan ends without a session starting,
/// including when the scanning future is dropped.
struct ScanState<'a, P: LinkPlatform + ?Sized>(&'a ConnectionManager<P>);

impl<P: LinkPlatform + ?Sized> Drop for ScanState<'_, P> {
    fn drop(&mut self) {
        self.0.end_scan();
    }
}
