//! Simulated example: run a full session against the in-process platform
//!
//! Run with: cargo run --example simulated_session

use datacenter_monitor_ble::ble::simulated::SimulatedPlatform;
use datacenter_monitor_ble::ble::uuids::{
    HUMIDITY_CHARACTERISTIC_UUID, MONITOR_SERVICE_UUID, TEMPERATURE_CHARACTERISTIC_UUID,
};
use datacenter_monitor_ble::{MonitorConfig, PeripheralHandle, Result, SensorMonitor};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("datacenter_monitor_ble=debug".parse().unwrap()),
        )
        .init();

    let platform = Arc::new(SimulatedPlatform::new());
    let peripheral = PeripheralHandle::new("C0:FF:EE:00:00:01").with_local_name("DC-Monitor");
    platform.add_advertiser(peripheral.clone(), vec![MONITOR_SERVICE_UUID]);
    platform.set_value(HUMIDITY_CHARACTERISTIC_UUID, vec![41]);
    platform.set_value(TEMPERATURE_CHARACTERISTIC_UUID, vec![23]);
    platform.set_response_delay(Duration::from_millis(30));

    let config = MonitorConfig::default().with_scan_window(Duration::from_secs(2));
    let monitor = SensorMonitor::with_platform(platform.clone(), config)?;

    let _handle = monitor.on_telemetry(|sample| println!("  {}", sample));

    monitor.request_scan_and_connect().await?;
    monitor.wait_until_ready(Duration::from_secs(2)).await?;
    println!("Connected to {}", peripheral);

    // Push a few notifications as the peripheral would
    for (temperature, humidity) in [(24u8, 42u8), (25, 44), (27, 47)] {
        tokio::time::sleep(Duration::from_millis(200)).await;
        platform.notify(&peripheral.id, TEMPERATURE_CHARACTERISTIC_UUID, vec![temperature]);
        platform.notify(&peripheral.id, HUMIDITY_CHARACTERISTIC_UUID, vec![humidity]);
    }

    monitor.request_heater_state(true).await?;

    println!("\nLatest telemetry:");
    let mut latest: Vec<_> = monitor.latest_telemetry().into_values().collect();
    latest.sort_by_key(|sample| sample.role);
    for sample in latest {
        println!("  {}", sample);
    }

    platform.drop_link(&peripheral.id);
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("\nAfter link loss: {}", monitor.connection_state());
    println!("Session stats: {:?}", monitor.queue_stats());

    Ok(())
}
