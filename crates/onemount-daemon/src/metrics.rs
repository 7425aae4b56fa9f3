//! Prometheus-backed event sink.
//!
//! The engine reports through the `EventSink` port; this
//! implementation folds those events into a Prometheus registry the
//! daemon can expose or dump on shutdown. Status changes become a
//! per-status gauge family, errors a counter, and metric callbacks
//! land in counters keyed by name.

use std::collections::HashMap;
use std::sync::Mutex;

use prometheus::{CounterVec, IntGaugeVec, Opts, Registry};
use tracing::{debug, warn};

use onemount_core::domain::{FileStatus, ItemId};
use onemount_core::ports::EventSink;

/// Event sink recording into a Prometheus registry.
pub struct MetricsSink {
    registry: Registry,
    status_gauge: IntGaugeVec,
    errors: CounterVec,
    counters: CounterVec,
    /// Last known status per item, so gauge families stay consistent.
    statuses: Mutex<HashMap<ItemId, FileStatus>>,
}

impl MetricsSink {
    pub fn new() -> Self {
        let registry = Registry::new();
        let status_gauge = IntGaugeVec::new(
            Opts::new("onemount_files_by_status", "Files per sync status"),
            &["status"],
        )
        .expect("static metric definition");
        let errors = CounterVec::new(
            Opts::new("onemount_errors_total", "Errors surfaced by the engine"),
            &["scope"],
        )
        .expect("static metric definition");
        let counters = CounterVec::new(
            Opts::new("onemount_events_total", "Engine event counters"),
            &["event"],
        )
        .expect("static metric definition");
        registry
            .register(Box::new(status_gauge.clone()))
            .expect("fresh registry");
        registry
            .register(Box::new(errors.clone()))
            .expect("fresh registry");
        registry
            .register(Box::new(counters.clone()))
            .expect("fresh registry");
        Self {
            registry,
            status_gauge,
            errors,
            counters,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for MetricsSink {
    fn file_status_changed(&self, id: &ItemId, status: FileStatus) {
        debug!(%id, status = status.as_str(), "file status changed");
        let mut statuses = self.statuses.lock().expect("status lock");
        if let Some(previous) = statuses.insert(id.clone(), status) {
            if previous != status {
                self.status_gauge
                    .with_label_values(&[previous.as_str()])
                    .dec();
            } else {
                return;
            }
        }
        self.status_gauge.with_label_values(&[status.as_str()]).inc();
    }

    fn error(&self, id: Option<&ItemId>, message: &str) {
        let scope = if id.is_some() { "item" } else { "global" };
        warn!(id = ?id.map(|i| i.to_string()), message, "engine error");
        self.errors.with_label_values(&[scope]).inc();
    }

    fn metric(&self, name: &'static str, value: f64) {
        self.counters.with_label_values(&[name]).inc_by(value);
    }
}
