//! Prometheus metrics for cache observability

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_int_counter, CounterVec,
    Encoder, Gauge, GaugeVec, IntCounter, TextEncoder,
};

lazy_static! {
    /// Counter: record loads by outcome (hit/miss/evict) and backend
    pub static ref RECORD_LOADS: CounterVec = register_counter_vec!(
        "graphcache_record_loads_total",
        "Record loads by outcome and backend",
        &["outcome", "backend"]
    )
    .expect("Failed to create record_loads metric");

    /// Counter: records merged into a backend
    pub static ref RECORDS_MERGED: CounterVec = register_counter_vec!(
        "graphcache_records_merged_total",
        "Records merged by backend",
        &["backend"]
    )
    .expect("Failed to create records_merged metric");

    /// Counter: fields reported as changed by merges
    pub static ref CHANGED_FIELDS: IntCounter = register_int_counter!(
        "graphcache_changed_fields_total",
        "Fields reported as changed by record merges"
    )
    .expect("Failed to create changed_fields metric");

    /// Counter: denormalization reads that ended in a cache miss
    pub static ref READ_MISSES: IntCounter = register_int_counter!(
        "graphcache_read_misses_total",
        "Reads that ended in a cache miss"
    )
    .expect("Failed to create read_misses metric");

    /// Gauge: active optimistic updates
    pub static ref OPTIMISTIC_DEPTH: Gauge = register_gauge!(
        "graphcache_optimistic_updates",
        "Number of active optimistic updates"
    )
    .expect("Failed to create optimistic_updates metric");

    /// Gauge: records held by a persistent backend, as of its last stats query
    pub static ref STORED_RECORDS: GaugeVec = register_gauge_vec!(
        "graphcache_stored_records",
        "Records held by a persistent backend",
        &["backend"]
    )
    .expect("Failed to create stored_records metric");
}

/// Record a load hit
pub fn record_hit(backend: &str) {
    RECORD_LOADS.with_label_values(&["hit", backend]).inc();
}

/// Record a load miss
pub fn record_miss(backend: &str) {
    RECORD_LOADS.with_label_values(&["miss", backend]).inc();
}

/// Record a load that evicted the record
pub fn record_evict(backend: &str) {
    RECORD_LOADS.with_label_values(&["evict", backend]).inc();
}

/// Record a merged batch and its changed fields
pub fn record_merge(backend: &str, records: usize, changed: usize) {
    RECORDS_MERGED
        .with_label_values(&[backend])
        .inc_by(records as f64);
    CHANGED_FIELDS.inc_by(changed as u64);
}

/// Record a read that missed
pub fn record_read_miss() {
    READ_MISSES.inc();
}

/// Set the number of records a backend holds
pub fn set_stored_records(backend: &str, records: usize) {
    STORED_RECORDS
        .with_label_values(&[backend])
        .set(records as f64);
}

/// Set the number of active optimistic updates
pub fn set_optimistic_depth(depth: usize) {
    OPTIMISTIC_DEPTH.set(depth as f64);
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> crate::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| crate::CacheError::Other(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| crate::CacheError::Other(format!("Metrics are not UTF-8: {}", e)))
}
