//! End-to-end session scenarios against the simulated platform.

use datacenter_monitor_ble::ble::simulated::{LinkRequest, SimulatedPlatform};
use datacenter_monitor_ble::ble::transport::{
    CompletionKind, GattService, GattStatus, LinkEvent, OperationId,
};
use datacenter_monitor_ble::ble::uuids::*;
use datacenter_monitor_ble::{
    ConnectionState, DisconnectReason, Error, HeaterState, MonitorConfig, PeripheralHandle,
    SampleSource, SensorMonitor,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(3);
const ADDRESS: &str = "C0:FF:EE:00:00:01";
// Battery service; advertised by a neighbouring device that must be skipped.
const GENERIC_SERVICE: uuid::Uuid = uuid::Uuid::from_u128(0x0000_180f_0000_1000_8000_00805f9b34fb);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn platform() -> Arc<SimulatedPlatform> {
    init_tracing();
    let platform = Arc::new(SimulatedPlatform::new());
    platform.add_advertiser(
        PeripheralHandle::new("AA:BB:CC:00:00:00"),
        vec![GENERIC_SERVICE],
    );
    platform.add_advertiser(
        PeripheralHandle::new(ADDRESS).with_local_name("DC-Monitor"),
        vec![MONITOR_SERVICE_UUID],
    );
    platform.set_value(HUMIDITY_CHARACTERISTIC_UUID, vec![0x16]);
    platform.set_value(TEMPERATURE_CHARACTERISTIC_UUID, vec![21]);
    platform
}

fn monitor(
    platform: &Arc<SimulatedPlatform>,
    config: MonitorConfig,
) -> SensorMonitor<SimulatedPlatform> {
    SensorMonitor::with_platform(platform.clone(), config).unwrap()
}

fn config() -> MonitorConfig {
    MonitorConfig::default()
        .with_scan_window(Duration::from_millis(500))
        .with_operation_timeout(Duration::from_millis(150))
}

/// Poll `condition` until it holds or `WAIT` elapses.
async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn setup_sequence() -> Vec<(CompletionKind, uuid::Uuid)> {
    vec![
        (CompletionKind::Read, HUMIDITY_CHARACTERISTIC_UUID),
        (CompletionKind::Read, TEMPERATURE_CHARACTERISTIC_UUID),
        (CompletionKind::Write, HEATER_STATE_CHARACTERISTIC_UUID),
        (CompletionKind::Subscribe, HUMIDITY_CHARACTERISTIC_UUID),
        (CompletionKind::Subscribe, TEMPERATURE_CHARACTERISTIC_UUID),
    ]
}

#[tokio::test]
async fn happy_path_runs_setup_sequence_in_order() {
    let platform = platform();
    platform.set_response_delay(Duration::from_millis(5));
    let monitor = monitor(&platform, config());
    let mut states = monitor.subscribe_connection();

    assert_ok!(monitor.request_scan_and_connect().await);
    assert_ok!(monitor.wait_until_ready(WAIT).await);
    assert_eq!(monitor.peripheral_id().as_deref(), Some(ADDRESS));

    eventually(|| monitor.queue_stats().succeeded == 5).await;

    assert_eq!(platform.gatt_requests(), setup_sequence());
    assert_eq!(platform.max_in_flight(), 1);
    assert_eq!(platform.scan_starts(), 1);
    assert_eq!(platform.scan_stops(), 1);

    let humidity = monitor
        .latest_for(CharacteristicRole::HumidityReadNotify)
        .unwrap();
    assert_eq!(humidity.value, 22);
    assert_eq!(humidity.source, SampleSource::Read);
    let temperature = monitor
        .latest_for(CharacteristicRole::TemperatureReadNotify)
        .unwrap();
    assert_eq!(temperature.value, 21);
    assert_eq!(
        monitor
            .latest_for(CharacteristicRole::HeaterWrite)
            .and_then(|s| s.heater_state()),
        Some(HeaterState::Off)
    );

    let observed: Vec<_> = std::iter::from_fn(|| states.try_recv().ok())
        .map(|event| event.state)
        .collect();
    assert_eq!(
        observed,
        vec![
            ConnectionState::Scanning,
            ConnectionState::Connecting,
            ConnectionState::ServiceDiscovery,
            ConnectionState::Ready,
        ]
    );
}

#[tokio::test]
async fn read_timeout_is_retried_once_then_sequence_continues() {
    let platform = platform();
    platform.swallow_requests(HUMIDITY_CHARACTERISTIC_UUID, 1);
    let monitor = monitor(&platform, config());

    assert_ok!(monitor.request_scan_and_connect().await);
    assert_ok!(monitor.wait_until_ready(WAIT).await);
    eventually(|| monitor.queue_stats().succeeded == 5).await;

    let mut expected = setup_sequence();
    expected.insert(0, (CompletionKind::Read, HUMIDITY_CHARACTERISTIC_UUID));
    assert_eq!(platform.gatt_requests(), expected);

    let stats = monitor.queue_stats();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.timed_out, 0);
    assert_eq!(stats.issued, 6);
    assert_eq!(
        monitor
            .latest_for(CharacteristicRole::HumidityReadNotify)
            .map(|s| s.value),
        Some(22)
    );
}

#[tokio::test]
async fn write_timeout_does_not_abort_setup() {
    let platform = platform();
    platform.swallow_requests(HEATER_STATE_CHARACTERISTIC_UUID, 1);
    let monitor = monitor(&platform, config());

    assert_ok!(monitor.request_scan_and_connect().await);
    assert_ok!(monitor.wait_until_ready(WAIT).await);
    eventually(|| monitor.queue_stats().succeeded == 4).await;

    let stats = monitor.queue_stats();
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.retried, 0);
    assert_eq!(platform.gatt_requests(), setup_sequence());
}

#[tokio::test]
async fn disconnect_mid_sequence_cancels_rest_and_restart_is_fresh() {
    let platform = platform();
    // The heater write (third step) never completes
    platform.set_response_limit(Some(2));
    let monitor = monitor(&platform, config().with_operation_timeout(Duration::from_secs(10)));

    assert_ok!(monitor.request_scan_and_connect().await);
    assert_ok!(monitor.wait_until_ready(WAIT).await);
    eventually(|| platform.gatt_requests().len() == 3).await;
    eventually(|| monitor.queue_stats().succeeded == 2).await;

    platform.drop_link(ADDRESS);
    eventually(|| !monitor.connection_state().is_active()).await;

    assert_eq!(
        monitor.connection_state(),
        ConnectionState::Disconnected(DisconnectReason::LinkLost)
    );
    let stats = monitor.queue_stats();
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.cancelled, 3);
    assert_err!(monitor.request_heater_state(true).await);

    // A new session starts from Idle with a fresh queue and setup sequence
    platform.set_response_limit(None);
    let mut states = monitor.subscribe_connection();
    assert_ok!(monitor.request_scan_and_connect().await);
    assert_ok!(monitor.wait_until_ready(WAIT).await);
    eventually(|| monitor.queue_stats().succeeded == 5).await;

    assert_eq!(states.recv().await.unwrap().state, ConnectionState::Idle);
    let stats = monitor.queue_stats();
    assert_eq!(stats.cancelled, 0);
    assert_eq!(stats.issued, 5);
    assert_eq!(&platform.gatt_requests()[3..], &setup_sequence()[..]);
}

#[tokio::test]
async fn missing_characteristic_ends_session_with_service_not_found() {
    let platform = platform();
    platform.set_services(vec![GattService {
        uuid: MONITOR_SERVICE_UUID,
        characteristics: vec![
            HUMIDITY_CHARACTERISTIC_UUID,
            TEMPERATURE_CHARACTERISTIC_UUID,
        ],
    }]);
    let monitor = monitor(&platform, config());

    assert_ok!(monitor.request_scan_and_connect().await);
    let result = monitor.wait_until_ready(WAIT).await;

    assert!(matches!(result, Err(Error::ServiceNotFound { .. })));
    eventually(|| {
        monitor.connection_state()
            == ConnectionState::Disconnected(DisconnectReason::ServiceNotFound)
    })
    .await;
    assert!(platform.gatt_requests().is_empty());
    assert!(platform
        .requests()
        .contains(&LinkRequest::Disconnect(ADDRESS.to_string())));
}

#[tokio::test]
async fn discovery_failure_ends_session() {
    let platform = platform();
    platform.set_discovery_failure(Some(GattStatus::FAILURE));
    let monitor = monitor(&platform, config());

    assert_ok!(monitor.request_scan_and_connect().await);
    assert_err!(monitor.wait_until_ready(WAIT).await);
    eventually(|| {
        monitor.connection_state()
            == ConnectionState::Disconnected(DisconnectReason::DiscoveryFailed)
    })
    .await;
}

#[tokio::test]
async fn connect_failures_return_to_idle() {
    let platform = platform();
    let monitor = monitor(&platform, config());

    // Refused by the platform outright
    platform.set_connect_error(true);
    let result = monitor.request_scan_and_connect().await;
    assert!(matches!(result, Err(Error::ConnectFailed { .. })));
    assert_eq!(monitor.connection_state(), ConnectionState::Idle);

    // Accepted, then failed asynchronously
    platform.set_connect_error(false);
    platform.set_connect_refused(true);
    assert_ok!(monitor.request_scan_and_connect().await);
    assert!(matches!(
        monitor.wait_until_ready(WAIT).await,
        Err(Error::ConnectFailed { .. })
    ));
    assert_eq!(monitor.connection_state(), ConnectionState::Idle);

    // And the caller can retry
    platform.set_connect_refused(false);
    assert_ok!(monitor.request_scan_and_connect().await);
    assert_ok!(monitor.wait_until_ready(WAIT).await);
    assert_eq!(platform.connect_attempts(), 3);
}

#[tokio::test]
async fn concurrent_requests_connect_once() {
    let platform = platform();
    let monitor = monitor(&platform, config());

    let (first, second) = tokio::join!(
        monitor.request_scan_and_connect(),
        monitor.request_scan_and_connect()
    );
    assert_ok!(first);
    assert_ok!(second);
    assert_ok!(monitor.wait_until_ready(WAIT).await);

    // Once ready, another request is a no-op too
    assert_ok!(monitor.request_scan_and_connect().await);
    assert_eq!(platform.scan_starts(), 1);
    assert_eq!(platform.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn scan_without_match_is_not_found() {
    let platform = Arc::new(SimulatedPlatform::new());
    platform.add_advertiser(PeripheralHandle::new(ADDRESS), vec![GENERIC_SERVICE]);
    let monitor = monitor(&platform, config());

    let result = monitor.request_scan_and_connect().await;
    assert!(matches!(result, Err(Error::NotFound { .. })));
    assert!(!platform.is_scanning());
    assert_eq!(platform.connect_attempts(), 0);
    assert_eq!(monitor.connection_state(), ConnectionState::Idle);
}

#[tokio::test]
async fn stop_scan_cancels_request() {
    let platform = Arc::new(SimulatedPlatform::new());
    let monitor = Arc::new(monitor(
        &platform,
        config().with_scan_window(Duration::from_secs(30)),
    ));

    let task = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.request_scan_and_connect().await })
    };
    eventually(|| platform.is_scanning()).await;
    monitor.stop_scan();

    assert!(matches!(task.await.unwrap(), Err(Error::Cancelled)));
    assert!(!platform.is_scanning());
    assert_eq!(monitor.connection_state(), ConnectionState::Idle);
}

#[tokio::test]
async fn notifications_update_telemetry() {
    let platform = platform();
    let monitor = monitor(&platform, config());
    assert_ok!(monitor.request_scan_and_connect().await);
    assert_ok!(monitor.wait_until_ready(WAIT).await);
    eventually(|| monitor.queue_stats().succeeded == 5).await;

    let mut feed = monitor.subscribe();
    platform.notify(ADDRESS, TEMPERATURE_CHARACTERISTIC_UUID, vec![30]);
    let sample = tokio::time::timeout(WAIT, feed.recv()).await.unwrap().unwrap();
    assert_eq!(sample.role, CharacteristicRole::TemperatureReadNotify);
    assert_eq!(sample.value, 30);
    assert_eq!(sample.source, SampleSource::Notification);

    // A truncated payload is dropped without touching the latest value
    platform.notify(ADDRESS, HUMIDITY_CHARACTERISTIC_UUID, Vec::new());
    // Heater is write-only; a notification from it is ignored
    platform.notify(ADDRESS, HEATER_STATE_CHARACTERISTIC_UUID, vec![1, 0]);
    // Another peripheral's notification is not ours
    platform.notify("FF:FF:FF:FF:FF:FF", HUMIDITY_CHARACTERISTIC_UUID, vec![99]);
    platform.notify(ADDRESS, HUMIDITY_CHARACTERISTIC_UUID, vec![60]);

    let sample = tokio::time::timeout(WAIT, feed.recv()).await.unwrap().unwrap();
    assert_eq!(sample.role, CharacteristicRole::HumidityReadNotify);
    assert_eq!(sample.value, 60);
    assert_eq!(monitor.dropped_samples(), 1);
    assert_eq!(
        monitor
            .latest_for(CharacteristicRole::HeaterWrite)
            .and_then(|s| s.heater_state()),
        Some(HeaterState::Off)
    );
}

#[tokio::test]
async fn heater_request_writes_heater_characteristic_only() {
    let platform = platform();
    let monitor = monitor(&platform, config());
    assert_ok!(monitor.request_scan_and_connect().await);
    assert_ok!(monitor.wait_until_ready(WAIT).await);

    assert_ok!(monitor.request_heater_state(true).await);

    let writes: Vec<_> = platform
        .requests()
        .into_iter()
        .filter_map(|request| match request {
            LinkRequest::Gatt {
                kind: CompletionKind::Write,
                characteristic,
                value,
                ..
            } => Some((characteristic, value.to_vec())),
            _ => None,
        })
        .collect();
    assert_eq!(
        writes,
        vec![
            (HEATER_STATE_CHARACTERISTIC_UUID, vec![0x00, 0x00]),
            (HEATER_STATE_CHARACTERISTIC_UUID, vec![0x01, 0x00]),
        ]
    );
    assert_eq!(
        monitor
            .latest_for(CharacteristicRole::HeaterWrite)
            .and_then(|s| s.heater_state()),
        Some(HeaterState::On)
    );
}

#[tokio::test]
async fn rejected_heater_write_surfaces_status() {
    let platform = platform();
    platform.set_status(HEATER_STATE_CHARACTERISTIC_UUID, GattStatus(0x03));
    let monitor = monitor(&platform, config());
    assert_ok!(monitor.request_scan_and_connect().await);
    assert_ok!(monitor.wait_until_ready(WAIT).await);

    let result = monitor.request_heater_state(true).await;
    assert!(matches!(result, Err(Error::OperationFailed { status: 0x03 })));
    assert!(monitor.latest_for(CharacteristicRole::HeaterWrite).is_none());
    // The setup write failed too, yet the subscribes still ran
    assert_eq!(monitor.queue_stats().failed, 2);
    assert_eq!(monitor.queue_stats().succeeded, 4);
}

#[tokio::test]
async fn stray_completion_is_discarded() {
    let platform = platform();
    let monitor = monitor(&platform, config());
    assert_ok!(monitor.request_scan_and_connect().await);
    assert_ok!(monitor.wait_until_ready(WAIT).await);
    eventually(|| monitor.queue_stats().succeeded == 5).await;

    platform.emit(LinkEvent::Completion {
        peripheral: ADDRESS.to_string(),
        id: OperationId(12345),
        kind: CompletionKind::Read,
        characteristic: HUMIDITY_CHARACTERISTIC_UUID,
        status: GattStatus::SUCCESS,
        value: bytes::Bytes::from_static(&[77]),
    });
    assert_ok!(
        monitor
            .submit(datacenter_monitor_ble::OperationSpec::read(
                CharacteristicRole::TemperatureReadNotify
            ))
            .await
    );

    assert_eq!(monitor.queue_stats().discarded, 1);
    assert_eq!(
        monitor
            .latest_for(CharacteristicRole::HumidityReadNotify)
            .map(|s| s.value),
        Some(22)
    );
}

#[tokio::test]
async fn requested_disconnect_is_idempotent() {
    let platform = platform();
    let monitor = monitor(&platform, config());

    assert_ok!(monitor.request_disconnect().await);
    assert_eq!(monitor.connection_state(), ConnectionState::Idle);

    assert_ok!(monitor.request_scan_and_connect().await);
    assert_ok!(monitor.wait_until_ready(WAIT).await);
    assert_ok!(monitor.request_disconnect().await);
    assert_eq!(
        monitor.connection_state(),
        ConnectionState::Disconnected(DisconnectReason::Requested)
    );
    assert_ok!(monitor.request_disconnect().await);
    assert!(matches!(
        monitor.request_heater_state(false).await,
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn disconnect_while_connecting_wins_over_slow_connect() {
    let platform = platform();
    platform.set_connect_delay(Duration::from_millis(100));
    let monitor = Arc::new(monitor(&platform, config()));

    let request = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.request_scan_and_connect().await })
    };
    eventually(|| monitor.connection_state() == ConnectionState::Connecting).await;

    assert_ok!(monitor.request_disconnect().await);
    assert_ok!(request.await.unwrap());
    assert_eq!(
        monitor.connection_state(),
        ConnectionState::Disconnected(DisconnectReason::Requested)
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        monitor.connection_state(),
        ConnectionState::Disconnected(DisconnectReason::Requested)
    );
    assert!(platform.gatt_requests().is_empty());
    assert!(!platform
        .requests()
        .iter()
        .any(|r| matches!(r, LinkRequest::DiscoverServices(_))));
}

#[tokio::test]
async fn radio_preconditions_are_reported() {
    let platform = platform();
    let monitor = monitor(&platform, config());

    platform.set_radio_status(datacenter_monitor_ble::RadioStatus::Unsupported);
    assert!(matches!(
        monitor.request_scan_and_connect().await,
        Err(Error::RadioUnavailable)
    ));
    assert_eq!(platform.scan_starts(), 0);
}
