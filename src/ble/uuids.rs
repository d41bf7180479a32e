//! BLE Service and Characteristic UUIDs.
//!
//! Contains the identifiers exposed by the datacenter monitor peripheral and
//! the role each characteristic plays.

use uuid::Uuid;

// Datacenter Monitor Service (custom 128-bit base 6b75xxxx-006c-4f1b-8e32-a20d9d19aa13)
/// Datacenter Monitor Service UUID, also used as the scan filter.
pub const MONITOR_SERVICE_UUID: Uuid = Uuid::from_u128(0x6b75_0001_006c_4f1b_8e32_a20d9d19aa13);
/// Humidity measurement characteristic UUID (Read, Notify).
pub const HUMIDITY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6b75_0002_006c_4f1b_8e32_a20d9d19aa13);
/// Heater state characteristic UUID (Write).
pub const HEATER_STATE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6b75_0003_006c_4f1b_8e32_a20d9d19aa13);
/// Temperature measurement characteristic UUID (Read, Notify).
pub const TEMPERATURE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6b75_0004_006c_4f1b_8e32_a20d9d19aa13);

// Standard BLE descriptor
/// Client Characteristic Configuration Descriptor, written to enable notifications.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// The role a characteristic plays on the monitor service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CharacteristicRole {
    /// Temperature in whole degrees Celsius; readable and notifying.
    TemperatureReadNotify,
    /// Relative humidity in whole percent; readable and notifying.
    HumidityReadNotify,
    /// Heater on/off control; write only.
    HeaterWrite,
}

impl CharacteristicRole {
    /// All roles the monitor service must expose.
    pub const ALL: [CharacteristicRole; 3] = [
        CharacteristicRole::TemperatureReadNotify,
        CharacteristicRole::HumidityReadNotify,
        CharacteristicRole::HeaterWrite,
    ];

    /// The characteristic UUID carrying this role.
    pub fn uuid(&self) -> Uuid {
        match self {
            Self::TemperatureReadNotify => TEMPERATURE_CHARACTERISTIC_UUID,
            Self::HumidityReadNotify => HUMIDITY_CHARACTERISTIC_UUID,
            Self::HeaterWrite => HEATER_STATE_CHARACTERISTIC_UUID,
        }
    }

    /// Look up the role for a characteristic UUID.
    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.uuid() == *uuid)
    }

    /// Whether values of this role arrive as telemetry (reads and notifications).
    pub fn is_telemetry(&self) -> bool {
        !matches!(self, Self::HeaterWrite)
    }
}

impl std::fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TemperatureReadNotify => write!(f, "Temperature"),
            Self::HumidityReadNotify => write!(f, "Humidity"),
            Self::HeaterWrite => write!(f, "Heater"),
        }
    }
}

/// Check if a service UUID is the monitor service.
pub fn is_monitor_service(uuid: &Uuid) -> bool {
    *uuid == MONITOR_SERVICE_UUID
}
