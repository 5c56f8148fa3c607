use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_histogram_vec, register_int_counter_vec,
    CounterVec, Encoder, Histogram, HistogramVec, IntCounterVec, TextEncoder,
};

lazy_static! {
    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Cache Metrics (Redis)
    pub static ref CACHE_HIT_RATIO: CounterVec = register_counter_vec!(
        "cache_hit_ratio",
        "Cache hit/miss ratio",
        &["result"]
    )
    .unwrap();

    // Feedback pipeline metrics
    pub static ref FEEDBACK_GENERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "feedback_generations_total",
        "Total number of feedback generation runs",
        &["outcome"]
    )
    .unwrap();

    pub static ref FEEDBACK_GENERATION_DURATION_SECONDS: Histogram = register_histogram!(
        "feedback_generation_duration_seconds",
        "End-to-end feedback generation duration in seconds",
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 45.0, 90.0, 120.0]
    )
    .unwrap();

    pub static ref LLM_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "llm_requests_total",
        "Total number of LLM gateway requests",
        &["outcome"]
    )
    .unwrap();

    pub static ref SWEEP_TICKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "feedback_sweep_ticks_total",
        "Total number of timeout sweep ticks",
        &["status"]
    )
    .unwrap();

    pub static ref FEEDBACK_RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "feedback_retries_total",
        "Total number of feedback retry requests",
        &["kind"]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Record cache hit
pub fn record_cache_hit() {
    CACHE_HIT_RATIO.with_label_values(&["hit"]).inc();
}

/// Record cache miss
pub fn record_cache_miss() {
    CACHE_HIT_RATIO.with_label_values(&["miss"]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        // Just verify that all metrics are properly registered
        let _ = FEEDBACK_GENERATIONS_TOTAL
            .with_label_values(&["completed"])
            .get();
    }

    #[test]
    fn test_render_metrics() {
        // Increment a counter to ensure we have some data
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/test", "200"])
            .inc();

        let result = render_metrics();
        assert!(result.is_ok());
        let output = result.unwrap();
        assert!(output.contains("http_requests_total"));
    }
}
