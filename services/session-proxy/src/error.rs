//! Request-level error types
//!
//! Every failure the service produces itself is a JSON body of the form
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.
//! Upstream replies carried inside a gateway error are not rendered here:
//! the proxy passes those through verbatim.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use session_provider::RenewalError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("sign-in failed: {0}")]
    SignIn(#[from] session_auth::Error),

    #[error(transparent)]
    Gateway(#[from] session_gateway::Error),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::SignIn(session_auth::Error::InvalidCredentials(_)) => StatusCode::UNAUTHORIZED,
            Error::SignIn(_) => StatusCode::BAD_GATEWAY,
            Error::Gateway(e) => gateway_status(e),
        }
    }

    /// Value of the `type` field in the JSON error body.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::SignIn(session_auth::Error::InvalidCredentials(_)) => "invalid_credentials",
            Error::SignIn(_) => "sign_in_failed",
            Error::Gateway(e) => gateway_type(e),
        }
    }

    pub fn into_response_with_id(self, request_id: &str) -> Response {
        error_response(self.status(), self.error_type(), &self.to_string(), request_id)
    }
}

fn gateway_status(error: &session_gateway::Error) -> StatusCode {
    use session_gateway::Error as E;
    match error {
        E::Upstream(r) | E::Unauthorized(r) | E::ExpiredAfterRenewal(r) => r.status,
        E::Renewal(RenewalError::NoCredential | RenewalError::Rejected { .. }) => StatusCode::UNAUTHORIZED,
        E::Renewal(RenewalError::TimedOut) | E::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        E::Renewal(_) | E::Transport(_) | E::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
        E::InvalidRequest(_) => StatusCode::BAD_REQUEST,
    }
}

fn gateway_type(error: &session_gateway::Error) -> &'static str {
    use session_gateway::Error as E;
    match error {
        E::Upstream(_) => "upstream_error",
        E::Unauthorized(_) => "unauthorized",
        E::ExpiredAfterRenewal(_) => "session_expired",
        E::Renewal(RenewalError::NoCredential) => "not_signed_in",
        E::Renewal(_) => "renewal_failed",
        E::Timeout(_) => "upstream_timeout",
        E::Transport(_) | E::InvalidResponse(_) => "proxy_error",
        E::InvalidRequest(_) => "invalid_request",
    }
}

/// JSON error body with the request id attached.
pub fn error_response(status: StatusCode, error_type: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
