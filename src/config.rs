//! Monitor configuration.
//!
//! Defaults match the monitor peripheral's firmware: a 10 second discovery
//! window, five second GATT operation timeout, one retry for reads and
//! subscribes.

use std::time::Duration;

use crate::ble::operation::{default_setup_sequence, OperationSpec};
use crate::error::{Error, Result};

/// Timeout retry policy for queued operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// How many times a timed-out read or subscribe is re-issued.
    pub max_retries: u32,
    /// Whether writes are retried too. Writes are not assumed idempotent.
    pub retry_writes: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            retry_writes: false,
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            retry_writes: false,
        }
    }
}

/// Configuration for a [`SensorMonitor`](crate::SensorMonitor) and its sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MonitorConfig {
    /// How long a discovery scan runs before giving up.
    pub scan_window: Duration,
    /// Default per-operation timeout.
    pub operation_timeout: Duration,
    /// Timeout retry policy.
    pub retry: RetryPolicy,
    /// How long a requested disconnect waits for the link-down signal.
    pub disconnect_timeout: Duration,
    /// Operations enqueued after every successful service discovery, in order.
    pub setup_sequence: Vec<OperationSpec>,
    /// Capacity of the telemetry change feed.
    pub telemetry_capacity: usize,
    /// Capacity of the connection event feed.
    pub connection_event_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            scan_window: Self::DEFAULT_SCAN_WINDOW,
            operation_timeout: Self::DEFAULT_OPERATION_TIMEOUT,
            retry: RetryPolicy::default(),
            disconnect_timeout: Duration::from_secs(2),
            setup_sequence: default_setup_sequence(),
            telemetry_capacity: 64,
            connection_event_capacity: 16,
        }
    }
}

impl MonitorConfig {
    /// Default discovery scan window (10 seconds).
    pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_millis(10_000);

    /// Default per-operation timeout (5 seconds).
    pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

    /// Set the discovery scan window.
    pub fn with_scan_window(mut self, window: Duration) -> Self {
        self.scan_window = window;
        self
    }

    /// Set the default per-operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the disconnect grace period.
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Replace the setup sequence.
    pub fn with_setup_sequence(mut self, sequence: Vec<OperationSpec>) -> Self {
        self.setup_sequence = sequence;
        self
    }

    /// Check the configuration for values that can never work.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("scan_window", self.scan_window),
            ("operation_timeout", self.operation_timeout),
            ("disconnect_timeout", self.disconnect_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::InvalidParameter {
                    name: name.to_string(),
                    value: format!("{:?}", value),
                });
            }
        }

        if self.telemetry_capacity == 0 {
            return Err(Error::InvalidParameter {
                name: "telemetry_capacity".to_string(),
                value: "0".to_string(),
            });
        }

        if self.connection_event_capacity == 0 {
            return Err(Error::InvalidParameter {
                name: "connection_event_capacity".to_string(),
                value: "0".to_string(),
            });
        }

        if let Some(spec) = self
            .setup_sequence
            .iter()
            .find(|spec| spec.timeout.is_some_and(|t| t.is_zero()))
        {
            return Err(Error::InvalidParameter {
                name: "setup_sequence.timeout".to_string(),
                value: format!("{} {}", spec.kind.label(), spec.role),
            });
        }

        Ok(())
    }
}
