//! Telemetry sample data structures.

use chrono::{DateTime, Utc};

use crate::ble::uuids::CharacteristicRole;
use crate::protocol::HeaterState;

/// How a sample reached the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SampleSource {
    /// Result of an explicit characteristic read.
    Read,
    /// Pushed by the peripheral after notifications were enabled.
    Notification,
    /// Echo of a successful heater write.
    Write,
}

/// A single decoded value for one characteristic role.
///
/// Samples are immutable; a newer sample for the same role supersedes the
/// older one rather than modifying it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TelemetrySample {
    /// The characteristic role this value belongs to.
    pub role: CharacteristicRole,
    /// The decoded unsigned value.
    pub value: u32,
    /// When the value was observed on this host.
    pub observed_at: DateTime<Utc>,
    /// How the value arrived.
    pub source: SampleSource,
}

impl TelemetrySample {
    /// Create a sample observed now.
    pub fn new(role: CharacteristicRole, value: u32, source: SampleSource) -> Self {
        Self {
            role,
            value,
            observed_at: Utc::now(),
            source,
        }
    }

    /// Temperature in degrees Celsius, if this is a temperature sample.
    pub fn temperature_celsius(&self) -> Option<u32> {
        (self.role == CharacteristicRole::TemperatureReadNotify).then_some(self.value)
    }

    /// Relative humidity in percent, if this is a humidity sample.
    pub fn humidity_percent(&self) -> Option<u32> {
        (self.role == CharacteristicRole::HumidityReadNotify).then_some(self.value)
    }

    /// Heater state, if this is a heater sample.
    pub fn heater_state(&self) -> Option<HeaterState> {
        (self.role == CharacteristicRole::HeaterWrite)
            .then(|| HeaterState::from_raw(self.value as u16))
    }
}

impl std::fmt::Display for TelemetrySample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.role {
            CharacteristicRole::TemperatureReadNotify => write!(f, "Temperature {}°C", self.value),
            CharacteristicRole::HumidityReadNotify => write!(f, "Humidity {}%", self.value),
            CharacteristicRole::HeaterWrite => write!(
                f,
                "Heater {:?}",
                HeaterState::from_raw(self.value as u16)
            ),
        }
    }
}
