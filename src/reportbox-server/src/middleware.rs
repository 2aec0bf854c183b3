//! HTTP middleware components.
//!
//! Both middlewares act on the response head only. A streamed archive keeps
//! flowing after they return, so timings and timeouts cover time to first
//! byte, never the transfer.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::{HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// Request ID header name.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Time-to-first-byte header name.
pub const REQUEST_TIMING_HEADER: &str = "X-Response-Time";

/// Request ID attached as an extension.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Tag the request with an id, run it inside a span carrying that id and log
/// one line once the response head is ready.
///
/// A caller-supplied `X-Request-Id` is kept.
pub async fn request_context_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let start = Instant::now();
    let mut response = next.run(request).instrument(span.clone()).await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{elapsed_ms:.2}ms")) {
        headers.insert(REQUEST_TIMING_HEADER, value);
    }

    let status = response.status();
    span.in_scope(|| {
        if status.is_server_error() {
            warn!(status = status.as_u16(), elapsed_ms, "Request failed");
        } else {
            info!(status = status.as_u16(), elapsed_ms, "Request completed");
        }
    });

    response
}

/// Answer 504 when no response head is ready within `request_timeout`.
pub async fn timeout_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let limit = state.config.request_timeout_duration();

    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => AppError::Timeout(limit).into_response(),
    }
}

/// CORS configuration.
///
/// Exposes the archive headers so browser clients can name the download and
/// look up its outcome.
pub fn cors_layer(origins: &[String]) -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    let max_age = std::time::Duration::from_secs(86400);
    let expose = [
        header::CONTENT_DISPOSITION,
        header::HeaderName::from_static("x-export-id"),
    ];

    if origins.is_empty() {
        CorsLayer::permissive().max_age(max_age).expose_headers(expose)
    } else {
        let origins: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(expose)
            .max_age(max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::{Router, body::Body, http::StatusCode, routing::get};
    use tower::ServiceExt;

    use crate::config::ServerConfig;
    use crate::error::ERROR_CODE_HEADER;

    #[tokio::test]
    async fn test_request_id_kept_or_generated() {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn(request_context_middleware));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(REQUEST_ID_HEADER, "abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "abc");

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let generated = response.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(Uuid::parse_str(generated).is_ok());
        let timing = response.headers()[REQUEST_TIMING_HEADER].to_str().unwrap();
        assert!(timing.ends_with("ms"));
    }

    #[tokio::test]
    async fn test_slow_handler_times_out() {
        let state = Arc::new(
            AppState::with_parts(
                ServerConfig {
                    request_timeout: 0,
                    ..ServerConfig::default()
                },
                Arc::new(reportbox_storage::JsonRecordStore::in_memory()),
                Arc::new(reportbox_storage::LocalBlobStore::new("/nonexistent")),
            ),
        );
        let app = Router::new()
            .route(
                "/",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            )
            .layer(axum::middleware::from_fn_with_state(state, timeout_middleware));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.headers()[ERROR_CODE_HEADER], "timeout");
    }
}
