//! Fire-and-forget telemetry counters.
//!
//! The sink is infallible by construction: a telemetry backend that
//! drops events must never affect registry correctness, so the trait
//! has no error channel at all.

use dashmap::DashMap;

/// Coordination events worth counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryEvent {
    /// A worker registered for the first time.
    WorkerRegistered,
    /// An already-known worker re-registered.
    WorkerReRegistered,
    /// A worker was evicted after staying unhealthy past the grace period.
    WorkerEvicted,
    /// A selection call returned a worker.
    SelectionHit,
    /// A selection call found no available worker of the type.
    SelectionExhausted,
    /// A worker's live claim was reconciled into the store.
    OperationReconciled,
    /// A worker was told to abandon an operation already terminal in the store.
    OperationStopped,
    /// The orphan detector started suspecting an unclaimed operation.
    OrphanSuspected,
    /// The orphan detector force-failed an operation past the timeout.
    OrphanFailed,
}

/// Sink for coordination counters.
pub trait TelemetrySink: Send + Sync {
    /// Record one occurrence of the event.
    fn record(&self, event: TelemetryEvent);
}

/// Sink that drops everything. Default wiring for production until an
/// exporter is configured.
#[derive(Debug, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record(&self, _event: TelemetryEvent) {}
}

/// Sink that counts events, for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    counts: DashMap<TelemetryEvent, u64>,
}

impl RecordingTelemetry {
    /// Create a new empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many times the event was recorded.
    #[must_use]
    pub fn count(&self, event: TelemetryEvent) -> u64 {
        self.counts.get(&event).map_or(0, |c| *c)
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn record(&self, event: TelemetryEvent) {
        *self.counts.entry(event).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_counts() {
        let sink = RecordingTelemetry::new();

        sink.record(TelemetryEvent::SelectionHit);
        sink.record(TelemetryEvent::SelectionHit);
        sink.record(TelemetryEvent::SelectionExhausted);

        assert_eq!(sink.count(TelemetryEvent::SelectionHit), 2);
        assert_eq!(sink.count(TelemetryEvent::SelectionExhausted), 1);
        assert_eq!(sink.count(TelemetryEvent::OrphanFailed), 0);
    }
}
