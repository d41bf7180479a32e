//! Telemetry dispatcher.
//!
//! Decodes read results and notifications into [`TelemetrySample`]s, keeps
//! the latest sample per characteristic role and publishes every sample on a
//! change feed.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::ble::uuids::CharacteristicRole;
use crate::data::{SampleSource, TelemetrySample};
use crate::error::Result;
use crate::protocol::{decode_reading, HeaterState};

/// Latest-value store and change feed for decoded telemetry.
pub struct TelemetryDispatcher {
    /// Latest sample per role.
    latest: RwLock<HashMap<CharacteristicRole, TelemetrySample>>,
    /// Change feed.
    feed: broadcast::Sender<TelemetrySample>,
    /// Samples dropped because they failed to decode.
    dropped: AtomicU64,
}

impl TelemetryDispatcher {
    /// Create a dispatcher whose change feed buffers `capacity` samples per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));

        Self {
            latest: RwLock::new(HashMap::new()),
            feed,
            dropped: AtomicU64::new(0),
        }
    }

    /// Decode a completed read.
    pub fn ingest_read(&self, role: CharacteristicRole, payload: &[u8]) -> Result<TelemetrySample> {
        self.ingest(role, payload, SampleSource::Read)
    }

    /// Decode an unsolicited notification.
    pub fn ingest_notification(
        &self,
        role: CharacteristicRole,
        payload: &[u8],
    ) -> Result<TelemetrySample> {
        self.ingest(role, payload, SampleSource::Notification)
    }

    /// Record a heater state the peripheral acknowledged.
    pub fn record_heater(&self, state: HeaterState) -> TelemetrySample {
        let sample = TelemetrySample::new(
            CharacteristicRole::HeaterWrite,
            state.to_raw() as u32,
            SampleSource::Write,
        );
        self.publish(sample.clone());
        sample
    }

    /// Decode a payload and publish the sample.
    ///
    /// A payload that fails to decode is dropped: the latest value for the
    /// role is left untouched and nothing is sent on the feed.
    pub fn ingest(
        &self,
        role: CharacteristicRole,
        payload: &[u8],
        source: SampleSource,
    ) -> Result<TelemetrySample> {
        let value = match decode_reading(role, payload) {
            Ok(value) => value,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping {:?} sample for {}: {}", source, role, e);
                return Err(e);
            }
        };

        let sample = TelemetrySample::new(role, value, source);
        self.publish(sample.clone());
        Ok(sample)
    }

    fn publish(&self, sample: TelemetrySample) {
        trace!("Telemetry: {} via {:?}", sample, sample.source);
        self.latest.write().insert(sample.role, sample.clone());
        // No subscribers is fine; the latest map still holds the value.
        let _ = self.feed.send(sample);
    }

    /// Snapshot of the latest sample per role.
    pub fn latest(&self) -> HashMap<CharacteristicRole, TelemetrySample> {
        self.latest.read().clone()
    }

    /// Latest sample for one role.
    pub fn latest_for(&self, role: CharacteristicRole) -> Option<TelemetrySample> {
        self.latest.read().get(&role).cloned()
    }

    /// Subscribe to the change feed.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetrySample> {
        self.feed.subscribe()
    }

    /// Number of samples dropped because they failed to decode.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for TelemetryDispatcher {
    fn default() -> Self {
        Self::new(64)
    }
}

impl std::fmt::Debug for TelemetryDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryDispatcher")
            .field("latest", &*self.latest.read())
            .field("dropped", &self.dropped_samples())
            .finish()
    }
}
