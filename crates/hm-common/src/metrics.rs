//! Metrics sink contract.
//!
//! The core never talks to a metrics backend directly; it emits through this
//! trait. The default sink forwards to the `metrics` crate facade so any
//! exporter installed by the host picks the values up. Sinks must be cheap,
//! thread-safe and fire-and-forget: a misbehaving backend never fails a
//! dispatch.

use std::time::Duration;

pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &str, delta: u64);
    fn duration(&self, name: &str, value: Duration);
    fn gauge(&self, name: &str, value: f64);
}

/// Forwards to the `metrics` crate macros.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuntimeMetricsSink;

impl MetricsSink for RuntimeMetricsSink {
    fn counter(&self, name: &str, delta: u64) {
        metrics::counter!(name.to_string()).increment(delta);
    }

    fn duration(&self, name: &str, value: Duration) {
        metrics::histogram!(name.to_string()).record(value.as_secs_f64());
    }

    fn gauge(&self, name: &str, value: f64) {
        metrics::gauge!(name.to_string()).set(value);
    }
}

/// Discards everything; the default for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn counter(&self, _name: &str, _delta: u64) {}
    fn duration(&self, _name: &str, _value: Duration) {}
    fn gauge(&self, _name: &str, _value: f64) {}
}
