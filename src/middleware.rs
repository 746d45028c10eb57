//! HTTP middleware: per-request metrics.

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::metrics;

/// Record request count and latency per method/endpoint/status. Path
/// parameters are collapsed so label cardinality stays bounded.
pub async fn track_metrics(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let endpoint = normalize_path(request.uri().path());

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    let elapsed = start.elapsed().as_secs_f64();
    metrics::HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &endpoint, &status])
        .inc();
    metrics::HTTP_REQUEST_DURATION
        .with_label_values(&[&method, &endpoint, &status])
        .observe(elapsed);

    response
}

/// Replace id-shaped path segments with placeholders.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.len() >= 16 && uuid::Uuid::parse_str(segment).is_ok() {
                "{id}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_segments_are_collapsed() {
        let path = format!("/v1/memories/{}", uuid::Uuid::new_v4());
        assert_eq!(normalize_path(&path), "/v1/memories/{id}");
        assert_eq!(normalize_path("/v1/memories/list"), "/v1/memories/list");
        assert_eq!(normalize_path("/health"), "/health");
    }
}
