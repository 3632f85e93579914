//! HTTP proxy logic
//!
//! Receives inbound requests, strips hop-by-hop headers, and forwards them to
//! the upstream through the session dispatcher, which attaches the session's
//! bearer token and renews it on expiry. Upstream replies (including error
//! statuses) are returned verbatim.

use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::http::header::{AUTHORIZATION, HOST};
use axum::response::Response;
use session_gateway::{ApiResponse, Dispatcher, RequestSpec};
use tracing::{error, instrument, warn};

use crate::error::{Error, error_response};
use crate::metrics::{self, ServiceMetrics};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Largest request body the proxy will buffer.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: ServiceMetrics,
}

/// Proxy an inbound request to upstream under the current session.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    let _in_flight = state.metrics.begin_request();
    let started = Instant::now();
    let method = request.method().clone();

    let response = forward(state, request, &request_id).await;

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn forward(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: &str,
) -> Response {
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut outbound = RequestSpec::new(request.method().clone(), path);
    for (name, value) in request.headers() {
        // The dispatcher owns Authorization; reqwest sets Host for the upstream.
        if !is_hop_by_hop(name.as_str()) && name != AUTHORIZATION && name != HOST {
            outbound.headers.append(name.clone(), value.clone());
        }
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.metrics.record_error();
            error!(error = %e, "failed to read request body");
            return Error::InvalidRequest(format!("invalid request body: {e}"))
                .into_response_with_id(request_id);
        }
    };
    if !body.is_empty() {
        outbound = outbound.body(body);
    }

    match state.dispatcher.send(outbound).await {
        Ok(upstream) => passthrough(upstream, request_id),
        Err(e) => {
            if let Some(error_type) = upstream_error_type(&e) {
                state.metrics.record_error();
                metrics::record_upstream_error(error_type);
                warn!(error = %e, error_type, "upstream request failed");
            }
            match e.into_upstream() {
                Ok(upstream) => passthrough(upstream, request_id),
                Err(e) => Error::Gateway(e).into_response_with_id(request_id),
            }
        }
    }
}

/// Label for `proxy_upstream_errors_total`, or `None` for replies the
/// upstream produced deliberately (passed through, not counted).
fn upstream_error_type(error: &session_gateway::Error) -> Option<&'static str> {
    use session_gateway::Error as E;
    match error {
        E::Timeout(_) => Some("timeout"),
        E::Transport(_) => Some("connection"),
        E::Renewal(_) => Some("renewal"),
        E::InvalidResponse(_) => Some("invalid_response"),
        E::Upstream(_) | E::Unauthorized(_) | E::ExpiredAfterRenewal(_) | E::InvalidRequest(_) => None,
    }
}

/// Rebuild the upstream reply as the proxy's response.
fn passthrough(upstream: ApiResponse, request_id: &str) -> Response {
    let mut response = Response::builder().status(upstream.status);
    for (name, value) in &upstream.headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response
        .body(axum::body::Body::from(upstream.body))
        .unwrap_or_else(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                &format!("response build error: {e}"),
                request_id,
            )
        })
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
