//! Data structures for monitor telemetry.

pub mod telemetry;

pub use telemetry::{SampleSource, TelemetrySample};
