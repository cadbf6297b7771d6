use crate::metrics::MeterRegistry;
use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::{debug, error};

/// `GET /metrics` encodes the current registry contents. Collection is
/// driven by the scheduler; a scrape request never touches the database.
pub async fn metrics(Extension(registry): Extension<Arc<MeterRegistry>>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        "content-type",
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );

    match registry.encode() {
        Ok(body) => {
            debug!("Encoded metrics registry");
            (StatusCode::OK, headers, body)
        }
        Err(e) => {
            error!("Failed to encode metrics: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                headers,
                format!("Error encoding metrics: {e}"),
            )
        }
    }
}
