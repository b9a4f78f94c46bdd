//! Prometheus metrics, grounded on `fritztv`'s `metrics.rs` (lazy_static
//! gauge registration + a text-encoder gather function), extended with the
//! counters this system's components need.

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_gauge_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref ACTIVE_STREAMS: IntGauge =
        register_int_gauge!("telestream_active_streams", "Currently active streaming sessions")
            .unwrap();
    pub static ref ACTIVE_TRANSCODES: IntGauge = register_int_gauge!(
        "telestream_active_transcodes",
        "Currently active transcode/remux child processes"
    )
    .unwrap();
    pub static ref TRANSCODE_CPU_USAGE: GaugeVec = register_gauge_vec!(
        "telestream_transcode_cpu_usage_percent",
        "CPU usage of the transcode child process per file",
        &["file_id"]
    )
    .unwrap();
    pub static ref CHUNK_CACHE_HITS: IntCounter =
        register_int_counter!("telestream_chunk_cache_hits_total", "Chunk cache hits").unwrap();
    pub static ref CHUNK_CACHE_MISSES: IntCounter =
        register_int_counter!("telestream_chunk_cache_misses_total", "Chunk cache misses")
            .unwrap();
    pub static ref REMOTE_READS: IntCounterVec = register_int_counter_vec!(
        "telestream_remote_reads_total",
        "Remote chunk reads issued, by outcome",
        &["outcome"]
    )
    .unwrap();
    pub static ref SYNC_PASS_DURATION: Gauge = register_gauge!(
        "telestream_sync_pass_duration_seconds",
        "Duration of the last sync/idle loop pass"
    )
    .unwrap();
    pub static ref METADATA_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "telestream_metadata_queue_depth",
        "Pending manual-refetch entries queued for the sync loop"
    )
    .unwrap();
    pub static ref WORKER_PAUSED: IntGauge = register_int_gauge!(
        "telestream_worker_paused",
        "1 when background work is paused due to active streaming sessions"
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
