//! Error types for dispatched requests

use session_provider::RenewalError;

use crate::dispatcher::ApiResponse;

/// Why a dispatched request did not produce a 2xx response.
///
/// Variants carrying an `ApiResponse` hold the upstream's reply unchanged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any non-2xx, non-401 response, passed through untouched.
    #[error("upstream returned {}", .0.status)]
    Upstream(ApiResponse),

    /// 401 without the expired code. The invalidation hook has already run.
    #[error("credential rejected by upstream ({})", .0.status)]
    Unauthorized(ApiResponse),

    /// The single retry after a renewal came back expired again.
    #[error("credential still expired after renewal")]
    ExpiredAfterRenewal(ApiResponse),

    #[error("credential renewal failed: {0}")]
    Renewal(#[from] RenewalError),

    #[error("upstream request timed out: {0}")]
    Timeout(String),

    #[error("upstream request failed: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response body: {0}")]
    InvalidResponse(String),
}

impl Error {
    /// The upstream response behind this error, if there was one.
    pub fn response(&self) -> Option<&ApiResponse> {
        match self {
            Error::Upstream(r) | Error::Unauthorized(r) | Error::ExpiredAfterRenewal(r) => Some(r),
            _ => None,
        }
    }

    /// Take the upstream response out, or hand the error back if it has none.
    pub fn into_upstream(self) -> std::result::Result<ApiResponse, Self> {
        match self {
            Error::Upstream(r) | Error::Unauthorized(r) | Error::ExpiredAfterRenewal(r) => Ok(r),
            other => Err(other),
        }
    }
}

/// Result alias for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;
