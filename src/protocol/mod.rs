//! Protocol module for decoding and encoding characteristic payloads.
//!
//! The monitor peripheral uses fixed-width little-endian integers:
//! - Temperature and humidity: 1 byte, unsigned
//! - Heater state: 2 bytes, unsigned (0 = off)

pub mod codec;

pub use codec::{decode_reading, decode_uint, encode_uint16, HeaterState, READING_WIDTH};
