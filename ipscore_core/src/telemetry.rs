//! Minimal run-time metrics sink.
//!
//! Prometheus export is intentionally left out; the host process either
//! installs its own `metrics` recorder (in which case this module is
//! unused) or registers a raw name/value callback here and calls
//! [`install`] once.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Recorder, SharedString, Unit};
use once_cell::sync::OnceCell;
use std::sync::Arc;

/// Signature for external collectors. Gauge and histogram values are
/// truncated to integers; the engine's metrics are all counts.
pub type StatsCallback = Box<dyn Fn(&str, u64) + Send + Sync>;

static CALLBACK: OnceCell<StatsCallback> = OnceCell::new();

/// Register a collector. Only the first registration wins; later calls are
/// ignored.
pub fn register_stats_callback<F>(cb: F)
where
    F: Fn(&str, u64) + Send + Sync + 'static,
{
    let _ = CALLBACK.set(Box::new(cb));
}

#[inline]
fn forward(key: &Key, value: u64) {
    if let Some(cb) = CALLBACK.get() {
        cb(key.name(), value);
    }
}

/// Forwarding recorder. Uses the callback **if** one was registered.
struct CallbackRecorder;

#[derive(Clone)]
struct CallbackCounter {
    key: Key,
}
#[derive(Clone)]
struct CallbackGauge {
    key: Key,
}
#[derive(Clone)]
struct CallbackHistogram {
    key: Key,
}

impl Recorder for CallbackRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(CallbackCounter { key: key.clone() }))
    }
    fn register_gauge(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(CallbackGauge { key: key.clone() }))
    }
    fn register_histogram(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(CallbackHistogram { key: key.clone() }))
    }
}

impl metrics::CounterFn for CallbackCounter {
    fn increment(&self, value: u64) {
        forward(&self.key, value);
    }
    fn absolute(&self, value: u64) {
        forward(&self.key, value);
    }
}

impl metrics::GaugeFn for CallbackGauge {
    fn set(&self, value: f64) {
        forward(&self.key, value as u64);
    }
    fn increment(&self, value: f64) {
        forward(&self.key, value as u64);
    }
    fn decrement(&self, value: f64) {
        forward(&self.key, value as u64);
    }
}

impl metrics::HistogramFn for CallbackHistogram {
    fn record(&self, value: f64) {
        forward(&self.key, value as u64);
    }
}

/// Install the forwarding recorder exactly once. A no-op if the host
/// already set a global recorder.
pub fn install() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = metrics::set_global_recorder(CallbackRecorder);
    });
}
