// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 The redkv Authors
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

/// A collection of Prometheus metrics for this application.
pub struct Metrics;

impl Metrics {
    /// Force initialization of all static metrics.
    /// You can call this in main() to ensure the metrics are registered.
    pub fn init() {
        // Accessing a static ref will trigger registration.
        let _ = &*REQUEST_COUNT;
        let _ = &*REQUEST_LATENCY;
        let _ = &*CONNECTED_CLIENTS;
        let _ = &*WATCHED_KEY_COUNT;
        let _ = &*DIRTY_NOTIFY_COUNT;
        let _ = &*REAPED_WATCHER_COUNT;
        let _ = &*KEYSPACE_RECORD_COUNT;
        let _ = &*COMPACTION_DROPPED_COUNT;

        // Check if a Tokio runtime is running
        let runtime_running = tokio::runtime::Handle::try_current().is_ok();

        // Only register metrics if a Tokio runtime is running
        if runtime_running {
            prometheus::default_registry()
                .register(Box::new(
                    tokio_metrics_collector::default_runtime_collector(),
                ))
                .unwrap();
        }
    }
}

/// Tracks the count of requests by command name.
pub static REQUEST_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "redkv_requests_total",
        "Total requests received, labeled by command",
        &["command"]
    )
    .expect("cannot create metric: redkv_requests_total")
});

/// Tracks the latency of requests, labeled by command name.
pub static REQUEST_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "redkv_request_latency_seconds",
        "Request latency distribution",
        &["command"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    )
    .expect("cannot create metric: redkv_request_latency_seconds")
});

pub static CONNECTED_CLIENTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("redkv_connected_clients", "Number of connected clients")
        .expect("cannot create metric: redkv_connected_clients")
});

/// Number of (db, key) pairs currently present in the watch registry.
pub static WATCHED_KEY_COUNT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("redkv_watched_key_count", "Current watched key count")
        .expect("cannot create metric: redkv_watched_key_count")
});

pub static DIRTY_NOTIFY_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "redkv_dirty_notify_total",
        "Total number of watchers marked dirty by key mutations"
    )
    .expect("cannot create metric: redkv_dirty_notify_total")
});

pub static REAPED_WATCHER_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "redkv_reaped_watcher_total",
        "Total number of dead watcher entries removed from the registry"
    )
    .expect("cannot create metric: redkv_reaped_watcher_total")
});

/// A gauge of how many raw records (meta plus member) are stored across all
/// databases. Includes logically dead records awaiting compaction.
pub static KEYSPACE_RECORD_COUNT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "redkv_keyspace_record_count",
        "Raw record count across all databases, including dead records awaiting compaction"
    )
    .expect("cannot create metric: redkv_keyspace_record_count")
});

pub static COMPACTION_DROPPED_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "redkv_compaction_dropped_total",
        "Records dropped by the compaction filters, labeled by reason",
        &["reason"]
    )
    .expect("cannot create metric: redkv_compaction_dropped_total")
});
