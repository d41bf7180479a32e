//! Wire codec for monitor characteristic payloads.
//!
//! Temperature and humidity arrive as single unsigned bytes. Heater control is
//! written as a 16-bit little-endian value.

use crate::ble::uuids::CharacteristicRole;
use crate::error::{Error, Result};

/// Width in bytes of a temperature or humidity reading on the wire.
pub const READING_WIDTH: usize = 1;

/// Largest width `decode_uint` accepts.
const MAX_UINT_WIDTH: usize = 4;

/// Decode an unsigned little-endian integer of `width` bytes from the start of `bytes`.
///
/// Extra trailing bytes are ignored. Returns [`Error::MalformedPayload`] when
/// fewer than `width` bytes are available.
///
/// # Example
///
/// ```
/// use datacenter_monitor_ble::protocol::decode_uint;
///
/// assert_eq!(decode_uint(&[0x16], 1).unwrap(), 22);
/// assert_eq!(decode_uint(&[0x34, 0x12], 2).unwrap(), 0x1234);
/// assert!(decode_uint(&[], 1).is_err());
/// ```
pub fn decode_uint(bytes: &[u8], width: usize) -> Result<u32> {
    if width == 0 || width > MAX_UINT_WIDTH {
        return Err(Error::InvalidParameter {
            name: "width".to_string(),
            value: width.to_string(),
        });
    }

    if bytes.len() < width {
        return Err(Error::MalformedPayload {
            expected: width,
            actual: bytes.len(),
        });
    }

    let mut buf = [0u8; MAX_UINT_WIDTH];
    buf[..width].copy_from_slice(&bytes[..width]);
    Ok(u32::from_le_bytes(buf))
}

/// Encode a 16-bit value as a 2-byte little-endian payload.
#[inline]
pub fn encode_uint16(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

/// Decode a telemetry reading for a characteristic role.
pub fn decode_reading(role: CharacteristicRole, bytes: &[u8]) -> Result<u32> {
    match role {
        CharacteristicRole::TemperatureReadNotify | CharacteristicRole::HumidityReadNotify => {
            decode_uint(bytes, READING_WIDTH)
        }
        CharacteristicRole::HeaterWrite => Ok(HeaterState::decode(bytes)?.to_raw() as u32),
    }
}

/// Heater on/off state written to the heater characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HeaterState {
    /// Heater off (wire value 0).
    #[default]
    Off,
    /// Heater on (wire value 1).
    On,
}

impl HeaterState {
    /// Raw wire value.
    pub fn to_raw(self) -> u16 {
        match self {
            Self::Off => 0,
            Self::On => 1,
        }
    }

    /// Any non-zero value is treated as on.
    pub fn from_raw(raw: u16) -> Self {
        if raw == 0 {
            Self::Off
        } else {
            Self::On
        }
    }

    /// Encode for a write to the heater characteristic.
    pub fn encode(self) -> [u8; 2] {
        encode_uint16(self.to_raw())
    }

    /// Decode a heater payload previously produced by [`HeaterState::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_uint(bytes, 2).map(|raw| Self::from_raw(raw as u16))
    }
}

impl From<bool> for HeaterState {
    fn from(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_single_byte() {
        assert_eq!(decode_uint(&[0x16], 1).unwrap(), 22);
        assert_eq!(decode_uint(&[0xFF], 1).unwrap(), 255);
        // Trailing bytes are ignored
        assert_eq!(decode_uint(&[0x16, 0xAA], 1).unwrap(), 22);
    }

    #[test]
    fn test_decode_truncated() {
        let err = decode_uint(&[], 1).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedPayload {
                expected: 1,
                actual: 0
            }
        ));

        assert!(matches!(
            decode_uint(&[0x01], 2),
            Err(Error::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_decode_bad_width() {
        assert!(matches!(
            decode_uint(&[0; 8], 0),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(matches!(
            decode_uint(&[0; 8], 5),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_encode_uint16_little_endian() {
        assert_eq!(encode_uint16(0), [0x00, 0x00]);
        assert_eq!(encode_uint16(0x0102), [0x02, 0x01]);
    }

    #[test]
    fn test_heater_state() {
        assert_eq!(HeaterState::Off.encode(), [0x00, 0x00]);
        assert_eq!(HeaterState::On.encode(), [0x01, 0x00]);
        assert_eq!(HeaterState::from(true), HeaterState::On);
        assert_eq!(HeaterState::from_raw(7), HeaterState::On);
        assert_eq!(HeaterState::decode(&[0x00, 0x00]).unwrap(), HeaterState::Off);
    }

    #[test]
    fn test_decode_reading_by_role() {
        assert_eq!(
            decode_reading(CharacteristicRole::HumidityReadNotify, &[0x16]).unwrap(),
            22
        );
        assert_eq!(
            decode_reading(CharacteristicRole::HeaterWrite, &[0x01, 0x00]).unwrap(),
            1
        );
        assert!(decode_reading(CharacteristicRole::TemperatureReadNotify, &[]).is_err());
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..8), width in 0usize..8) {
            let result = decode_uint(&bytes, width);
            if (1..=MAX_UINT_WIDTH).contains(&width) && bytes.len() >= width {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(result.is_err());
            }
        }

        #[test]
        fn single_byte_reading_matches_byte(byte in any::<u8>(), tail in proptest::collection::vec(any::<u8>(), 0..4)) {
            let mut payload = vec![byte];
            payload.extend(tail);
            prop_assert_eq!(
                decode_reading(CharacteristicRole::TemperatureReadNotify, &payload).unwrap(),
                byte as u32
            );
        }
    }
}
