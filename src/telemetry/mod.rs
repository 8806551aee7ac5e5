//! Calibration telemetry collector and helpers.
//!
//! The collector multiplexes scan, walk, restoration and persistence events
//! into a bounded history plus a broadcast stream for live observers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tokio::sync::broadcast;

use crate::error::{CalibrationError, ErrorCode};

pub mod events;

pub use events::CalibrationEvent;

/// Global telemetry hub shared across the crate.
static HUB: Lazy<TelemetryCollector> = Lazy::new(TelemetryCollector::default);

/// Access the global telemetry hub.
pub fn hub() -> &'static TelemetryCollector {
    &HUB
}

/// Snapshot of collector state for CLI reporting.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TelemetrySnapshot {
    pub recent: Vec<CalibrationEvent>,
    pub total_events: u64,
    pub dropped_events: u64,
}

/// Broadcast-based collector retaining a bounded history of events.
pub struct TelemetryCollector {
    tx: broadcast::Sender<CalibrationEvent>,
    history: Mutex<VecDeque<CalibrationEvent>>,
    history_capacity: usize,
    total_events: AtomicU64,
    dropped_history: AtomicU64,
}

impl TelemetryCollector {
    pub fn new(buffer: usize, history_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            total_events: AtomicU64::new(0),
            dropped_history: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, event: CalibrationEvent) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        // A poisoned history only loses diagnostics; live subscribers still get the event.
        if let Ok(mut history) = self.history.lock() {
            if history.len() == self.history_capacity {
                history.pop_front();
                self.dropped_history.fetch_add(1, Ordering::Relaxed);
            }
            history.push_back(event.clone());
        }

        let _ = self.tx.send(event);
    }

    /// Publish a `Failed` event for a surfaced calibration error
    pub fn record_error(&self, err: &CalibrationError) {
        self.publish(CalibrationEvent::Failed {
            stage: err.stage(),
            code: err.code(),
            message: err.message(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CalibrationEvent> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let recent = self
            .history
            .lock()
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default();
        TelemetrySnapshot {
            recent,
            total_events: self.total_events.load(Ordering::Relaxed),
            dropped_events: self.dropped_history.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new(256, 128)
    }
}
