//! Prometheus metrics for the ingestion pipeline and the retriever.
//!
//! No user_id / owner labels: per-user label cardinality would grow without
//! bound and take Prometheus down with it.

use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
};

lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    // ============================================================================
    // HTTP
    // ============================================================================

    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("memoryx_http_requests_total", "Total HTTP requests"),
        &["method", "endpoint", "status"]
    ).unwrap();

    pub static ref HTTP_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "memoryx_http_request_duration_seconds",
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["method", "endpoint", "status"]
    ).unwrap();

    // ============================================================================
    // Ingestion tasks
    // ============================================================================

    /// Task completions by terminal status
    pub static ref INGEST_TASKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("memoryx_ingest_tasks_total", "Ingestion tasks by terminal status"),
        &["status"]
    ).unwrap();

    pub static ref INGEST_TASK_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "memoryx_ingest_task_duration_seconds",
            "End-to-end ingestion task duration"
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    ).unwrap();

    /// Depth of the durable task queue
    pub static ref TASK_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "memoryx_task_queue_depth",
        "Pending ingestion tasks"
    ).unwrap();

    // ============================================================================
    // Reconciler
    // ============================================================================

    /// Reconciliation decisions by operation (add/update/delete/noop)
    pub static ref RECONCILE_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("memoryx_reconcile_decisions_total", "Reconciler decisions"),
        &["op", "path"]  // path: "deterministic" or "judge"
    ).unwrap();

    /// Saga compensations by failed step
    pub static ref SAGA_COMPENSATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("memoryx_saga_compensations_total", "Saga compensations"),
        &["step"]  // step: "vector" or "graph"
    ).unwrap();

    /// Drift sweep repairs
    pub static ref DRIFT_REPAIRS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("memoryx_drift_repairs_total", "Drift sweep repairs"),
        &["kind"]  // orphan_vector, missing_vector, orphan_link, missing_link
    ).unwrap();

    // ============================================================================
    // LLM / embeddings
    // ============================================================================

    pub static ref LLM_CALLS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("memoryx_llm_calls_total", "LLM and embedding calls"),
        &["kind", "result"]  // kind: extract/judge/summarize/embed
    ).unwrap();

    pub static ref LLM_CALL_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "memoryx_llm_call_duration_seconds",
            "LLM and embedding call duration"
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["kind"]
    ).unwrap();

    // ============================================================================
    // Retrieval
    // ============================================================================

    pub static ref SEARCH_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("memoryx_search_total", "Search requests"),
        &["result"]  // ok, empty, quota_exceeded, error
    ).unwrap();

    pub static ref SEARCH_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "memoryx_search_duration_seconds",
            "Search request duration"
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5])
    ).unwrap();

    /// Total vectors across all owner partitions
    pub static ref VECTOR_INDEX_SIZE: IntGauge = IntGauge::new(
        "memoryx_vector_index_size",
        "Total vectors in the similarity index"
    ).unwrap();

    /// Total graph entities across all owner partitions
    pub static ref GRAPH_ENTITY_COUNT: IntGauge = IntGauge::new(
        "memoryx_graph_entity_count",
        "Total entities in the graph store"
    ).unwrap();
}

/// Register all metrics with the global registry. Call once at startup.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let registry = &*METRICS_REGISTRY;
    registry.register(Box::new(HTTP_REQUESTS_TOTAL.clone()))?;
    registry.register(Box::new(HTTP_REQUEST_DURATION.clone()))?;
    registry.register(Box::new(INGEST_TASKS_TOTAL.clone()))?;
    registry.register(Box::new(INGEST_TASK_DURATION.clone()))?;
    registry.register(Box::new(TASK_QUEUE_DEPTH.clone()))?;
    registry.register(Box::new(RECONCILE_DECISIONS_TOTAL.clone()))?;
    registry.register(Box::new(SAGA_COMPENSATIONS_TOTAL.clone()))?;
    registry.register(Box::new(DRIFT_REPAIRS_TOTAL.clone()))?;
    registry.register(Box::new(LLM_CALLS_TOTAL.clone()))?;
    registry.register(Box::new(LLM_CALL_DURATION.clone()))?;
    registry.register(Box::new(SEARCH_TOTAL.clone()))?;
    registry.register(Box::new(SEARCH_DURATION.clone()))?;
    registry.register(Box::new(VECTOR_INDEX_SIZE.clone()))?;
    registry.register(Box::new(GRAPH_ENTITY_COUNT.clone()))?;
    Ok(())
}

/// Render the registry in Prometheus text exposition format.
pub fn gather() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let families = METRICS_REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_per_process() {
        // First registration wins; a second call reports AlreadyReg.
        let first = register_metrics();
        let second = register_metrics();
        assert!(first.is_ok() || second.is_err());
    }

    #[test]
    fn gather_renders_text() {
        let _ = register_metrics();
        SEARCH_TOTAL.with_label_values(&["ok"]).inc();
        let text = gather();
        assert!(text.contains("memoryx_search_total"));
    }
}
