use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::metrics::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};

/// Records request count and latency for every route.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let response = next.run(req).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, &status])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[&method, &path])
        .observe(duration);

    response
}

/// Replaces id-like path segments with a placeholder so metric label
/// cardinality stays bounded.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if is_id_like(segment) {
                "{id}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_id_like(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    let is_uuid =
        segment.len() == 36 && segment.chars().all(|c| c.is_ascii_hexdigit() || c == '-');
    let is_numeric = segment.chars().all(|c| c.is_ascii_digit());
    is_uuid || is_numeric
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path("/api/feedback/status/550e8400-e29b-41d4-a716-446655440000"),
            "/api/feedback/status/{id}"
        );
        assert_eq!(
            normalize_path("/api/submissions/alice/42/1"),
            "/api/submissions/alice/{id}/{id}"
        );
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/metrics"), "/metrics");
    }

    #[test]
    fn test_is_id_like() {
        assert!(is_id_like("550e8400-e29b-41d4-a716-446655440000"));
        assert!(is_id_like("123"));
        assert!(!is_id_like("retry-all"));
        assert!(!is_id_like(""));
    }
}
