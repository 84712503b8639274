//! Minimal run-time metrics sink.
//!
//! Prometheus export is left out; the host process registers a raw callback
//! that receives name/value pairs. Labels are folded into the name as
//! `name{k=v,...}` so a plain C consumer can still tell series apart.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use once_cell::sync::OnceCell;
use std::ffi::CString;
use std::os::raw::{c_char, c_ulonglong};
use std::sync::Arc;

/// Signature for external collectors.
pub type StatsCallback = unsafe extern "C" fn(name: *const c_char, value: c_ulonglong);

static CALLBACK: OnceCell<StatsCallback> = OnceCell::new();

/// Register a callback from C/other languages. Only the first call wins.
#[no_mangle]
pub extern "C" fn hsipcache_register_stats_callback(cb: StatsCallback) {
    let _ = CALLBACK.set(cb);
}

/// Forwarding recorder. Uses the callback **if** it was registered.
struct FfiRecorder;

/// One registered series; the C name is rendered once at registration.
struct FfiMetric {
    name: CString,
}

impl FfiMetric {
    fn new(key: &Key) -> Self {
        let mut rendered = key.name().to_owned();
        let mut labels = key.labels().peekable();
        if labels.peek().is_some() {
            let parts: Vec<String> = labels.map(|l| format!("{}={}", l.key(), l.value())).collect();
            rendered = format!("{rendered}{{{}}}", parts.join(","));
        }
        let name = CString::new(rendered).unwrap_or_else(|_| c"invalid_metric_name".to_owned());
        Self { name }
    }

    fn emit(&self, value: u64) {
        if let Some(cb) = CALLBACK.get() {
            unsafe { cb(self.name.as_ptr(), value as c_ulonglong) };
        }
    }
}

impl Recorder for FfiRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(FfiMetric::new(key)))
    }
    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(FfiMetric::new(key)))
    }
    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(FfiMetric::new(key)))
    }
}

impl metrics::CounterFn for FfiMetric {
    fn increment(&self, value: u64) {
        self.emit(value);
    }
    fn absolute(&self, value: u64) {
        self.emit(value);
    }
}

impl metrics::GaugeFn for FfiMetric {
    fn increment(&self, value: f64) {
        self.emit(value as u64);
    }
    fn decrement(&self, value: f64) {
        self.emit(value as u64);
    }
    fn set(&self, value: f64) {
        self.emit(value as u64);
    }
}

impl metrics::HistogramFn for FfiMetric {
    fn record(&self, value: f64) {
        self.emit(value as u64);
    }
}

/// Install exactly **once** – called from crate root. Leaves an
/// already-installed recorder (e.g. the host's exporter) in place.
pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = metrics::set_global_recorder(FfiRecorder);
    });
}
