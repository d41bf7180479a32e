//! Live example: connect to the monitor peripheral and print telemetry
//!
//! Run with: cargo run --example monitor

use datacenter_monitor_ble::{CharacteristicRole, Result, SensorMonitor};
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

    println!("Scanning for the datacenter monitor...");

    let monitor = SensorMonitor::new().await?;

    let _state_handle = monitor.on_connection_state(|state| {
        println!("Connection: {}", state);
    });

    let _telemetry_handle = monitor.on_telemetry(|sample| match sample.role {
        CharacteristicRole::TemperatureReadNotify => {
            println!("  Temperature: {}°C ({:?})", sample.value, sample.source)
        }
        CharacteristicRole::HumidityReadNotify => {
            println!("  Humidity: {}% ({:?})", sample.value, sample.source)
        }
        CharacteristicRole::HeaterWrite => {
            println!("  Heater: {:?}", sample.heater_state())
        }
    });

    monitor.request_scan_and_connect().await?;
    monitor.wait_until_ready(Duration::from_secs(10)).await?;

    // Let notifications flow for a while, then toggle the heater once
    tokio::time::sleep(Duration::from_secs(10)).await;
    monitor.request_heater_state(true).await?;
    tokio::time::sleep(Duration::from_secs(10)).await;
    monitor.request_heater_state(false).await?;

    println!("\nSession stats: {:?}", monitor.queue_stats());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
        }
        _ = tokio::time::sleep(Duration::from_secs(60)) => {}
    }

    monitor.shutdown().await?;
    Ok(())
}
