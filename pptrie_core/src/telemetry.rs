//! Minimal run‑time metrics sink.
//!
//! No exporter is bundled; the host process registers a plain callback that
//! receives name/value pairs for every counter, gauge and histogram sample.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Recorder, SharedString, Unit};
use once_cell::sync::OnceCell;
use std::sync::Arc;

/// Signature for external collectors.
pub type StatsCallback = fn(name: &str, value: f64);

static CALLBACK: OnceCell<StatsCallback> = OnceCell::new();

/// Register the collector. Only the first registration wins.
pub fn register_stats_callback(cb: StatsCallback) -> bool {
    CALLBACK.set(cb).is_ok()
}

#[inline]
fn forward(key: &Key, value: f64) {
    if let Some(cb) = CALLBACK.get() {
        cb(key.name(), value);
    }
}

/// Forwarding recorder. Uses the callback **if** it was registered.
struct CallbackRecorder;

#[derive(Clone)]
struct SinkHandle {
    key: Key,
}

impl Recorder for CallbackRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(SinkHandle { key: key.clone() }))
    }
    fn register_gauge(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(SinkHandle { key: key.clone() }))
    }
    fn register_histogram(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(SinkHandle { key: key.clone() }))
    }
}

impl metrics::CounterFn for SinkHandle {
    fn increment(&self, value: u64) {
        forward(&self.key, value as f64);
    }
    fn absolute(&self, value: u64) {
        forward(&self.key, value as f64);
    }
}

impl metrics::GaugeFn for SinkHandle {
    fn set(&self, value: f64) {
        forward(&self.key, value);
    }
    fn increment(&self, value: f64) {
        forward(&self.key, value);
    }
    fn decrement(&self, value: f64) {
        forward(&self.key, -value);
    }
}

impl metrics::HistogramFn for SinkHandle {
    fn record(&self, value: f64) {
        forward(&self.key, value);
    }
}

/// Install exactly **once**; called from `Patricia::create`. A recorder the
/// host installed earlier stays in place.
pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = metrics::set_global_recorder(CallbackRecorder);
    });
}
