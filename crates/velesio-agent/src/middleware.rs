use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

fn incoming_request_id(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && s.len() <= 128)
        .map(|s| s.to_string())
}

/// Tags each request with an id (reusing a sane caller-supplied one) and
/// writes one access log line when the response is ready.
pub async fn request_id(req: Request<Body>, next: Next) -> Response {
    let id = incoming_request_id(&req).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let mut resp = next.run(req).await;

    let status = resp.status().as_u16();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    if resp.status().is_server_error() {
        tracing::warn!(request_id = %id, %method, path = %path, status, elapsed_ms, "request failed");
    } else {
        tracing::info!(request_id = %id, %method, path = %path, status, elapsed_ms, "request");
    }

    if let Ok(v) = HeaderValue::from_str(&id) {
        resp.headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), v);
    }
    resp
}
