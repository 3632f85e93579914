//! Authenticated request dispatch
//!
//! Every request goes out with the store's current access token. The reply
//! is classified once:
//! - 2xx: returned as-is
//! - 401 with the expired code: renew (or join the renewal in flight), then
//!   send the same request exactly once more with the new token
//! - any other 401: run the invalidation hook, fail without retrying
//! - anything else: handed back untouched as `Error::Upstream`
//!
//! The `Authorization` header is always the dispatcher's. A caller-supplied
//! one is discarded, and the header is rebuilt from the credential used for
//! each attempt so the retry never carries the rejected token.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use session_provider::{Credential, RenewalError};
use tracing::{debug, instrument, warn};

use crate::classify::{ResponseClass, TOKEN_EXPIRED_CODE, classify};
use crate::coordinator::RefreshCoordinator;
use crate::error::{Error, Result};
use crate::store::CredentialStore;

/// A request to dispatch, relative to the upstream base URL.
///
/// Kept whole so the retry after a renewal can resend it unchanged.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    /// Path plus optional query, e.g. `/users?page=2`
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| Error::InvalidRequest(format!("serializing JSON body: {e}")))?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(body));
        Ok(self)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }
}

/// A fully read upstream response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| Error::InvalidResponse(e.to_string()))
    }

    /// Application error code from a JSON error body.
    pub fn error_code(&self) -> Option<String> {
        crate::classify::error_code(&self.body)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub base_url: String,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Error code that marks a 401 as a renewable expiry
    pub expired_code: String,
}

impl DispatcherConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
            expired_code: TOKEN_EXPIRED_CODE.to_string(),
        }
    }
}

pub struct Dispatcher {
    client: reqwest::Client,
    config: DispatcherConfig,
    coordinator: Arc<RefreshCoordinator>,
}

impl Dispatcher {
    pub fn new(
        client: reqwest::Client,
        config: DispatcherConfig,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            client,
            config,
            coordinator,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        self.coordinator.store()
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Send `request` with the current credential, renewing once on expiry.
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn send(&self, request: RequestSpec) -> Result<ApiResponse> {
        let credential = self.store().current();
        let response = self.transmit(&request, credential.as_deref()).await?;

        match classify(response.status.as_u16(), &response.body, &self.config.expired_code) {
            ResponseClass::Success => Ok(response),
            ResponseClass::Unrelated => Err(Error::Upstream(response)),
            ResponseClass::Unrecoverable => {
                self.coordinator.invalidate_session("unauthorized");
                Err(Error::Unauthorized(response))
            }
            ResponseClass::Expired => {
                let Some(sent) = credential else {
                    return Err(Error::Renewal(RenewalError::NoCredential));
                };
                debug!("access token expired, renewing");
                let renewed = self
                    .coordinator
                    .refresh_after_rejection(&sent.access_token)
                    .await?;
                self.retry(&request, &renewed).await
            }
        }
    }

    /// The single resend after a renewal. Never renews again.
    async fn retry(&self, request: &RequestSpec, credential: &Credential) -> Result<ApiResponse> {
        let response = self.transmit(request, Some(credential)).await?;

        match classify(response.status.as_u16(), &response.body, &self.config.expired_code) {
            ResponseClass::Success => Ok(response),
            ResponseClass::Unrelated => Err(Error::Upstream(response)),
            ResponseClass::Unrecoverable => {
                self.coordinator.invalidate_session("unauthorized");
                Err(Error::Unauthorized(response))
            }
            ResponseClass::Expired => {
                warn!("renewed credential rejected as expired, giving up");
                Err(Error::ExpiredAfterRenewal(response))
            }
        }
    }

    async fn transmit(&self, request: &RequestSpec, credential: Option<&Credential>) -> Result<ApiResponse> {
        let mut headers = request.headers.clone();
        headers.remove(AUTHORIZATION);
        if let Some(credential) = credential {
            let mut value = HeaderValue::from_str(&credential.bearer()).map_err(|e| {
                Error::InvalidRequest(format!("access token is not a valid header value: {e}"))
            })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.path))
            .headers(headers)
            .timeout(self.config.timeout);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(e.to_string())
            } else {
                Error::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("reading upstream response: {e}")))?;

        debug!(status = status.as_u16(), "upstream responded");
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url, path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use crate::test_support::{Harness, ScriptedRenewer};
    use axum::extract::State;
    use axum::http::HeaderMap as AxumHeaders;
    use axum::response::IntoResponse;
    use axum::routing::{any, get};
    use session_provider::RenewalFailurePolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Upstream that accepts only the tokens listed in `valid`.
    #[derive(Clone)]
    struct Upstream {
        valid: Arc<Vec<&'static str>>,
        hits: Arc<AtomicUsize>,
        seen: Arc<std::sync::Mutex<Vec<String>>>,
    }

    fn expired() -> axum::response::Response {
        (
            axum::http::StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({
                "error": true,
                "code": "token.expired",
                "message": "Token expired."
            })),
        )
            .into_response()
    }

    async fn check(State(up): State<Upstream>, headers: AxumHeaders) -> axum::response::Response {
        up.hits.fetch_add(1, Ordering::SeqCst);
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        up.seen.lock().unwrap().push(auth.clone());

        match auth.strip_prefix("Bearer ") {
            Some(token) if up.valid.iter().any(|v| *v == token) => {
                axum::Json(serde_json::json!({"email": "alice@example.com"})).into_response()
            }
            Some("at_revoked") => (
                axum::http::StatusCode::UNAUTHORIZED,
                axum::Json(serde_json::json!({
                    "error": true,
                    "code": "token.invalid",
                    "message": "Invalid token."
                })),
            )
                .into_response(),
            Some(_) => expired(),
            None => (axum::http::StatusCode::UNAUTHORIZED, "no token").into_response(),
        }
    }

    async fn start_upstream(valid: Vec<&'static str>) -> (String, Upstream) {
        let up = Upstream {
            valid: Arc::new(valid),
            hits: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(std::sync::Mutex::new(Vec::new())),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new()
            .route("/me", get(check))
            .route(
                "/boom",
                any(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            )
            .route(
                "/echo",
                any(|body: axum::body::Bytes| async move { body }),
            )
            .with_state(up.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), up)
    }

    fn dispatcher(base: &str, h: &Harness) -> Dispatcher {
        Dispatcher::new(
            reqwest::Client::new(),
            DispatcherConfig::new(base),
            h.coordinator.clone(),
        )
    }

    #[tokio::test]
    async fn valid_token_passes_through() {
        let (base, up) = start_upstream(vec!["at_0"]).await;
        let h = Harness::new(ScriptedRenewer::new());
        let d = dispatcher(&base, &h);

        let response = d.send(RequestSpec::get("/me")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["email"], "alice@example.com");
        assert_eq!(h.renewer.calls(), 0);
        assert_eq!(up.seen.lock().unwrap().as_slice(), ["Bearer at_0"]);
    }

    #[tokio::test]
    async fn expired_token_renews_and_retries_once() {
        let (base, up) = start_upstream(vec!["at_1"]).await;
        let h = Harness::new(ScriptedRenewer::new());
        let d = dispatcher(&base, &h);

        let response = d.send(RequestSpec::get("/me")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(h.renewer.calls(), 1);
        assert_eq!(h.renewer.seen(), vec!["rt_0"]);
        assert_eq!(up.hits.load(Ordering::SeqCst), 2);
        assert_eq!(
            up.seen.lock().unwrap().as_slice(),
            ["Bearer at_0", "Bearer at_1"]
        );
        assert_eq!(d.store().current().unwrap().access_token, "at_1");

        // The next request goes straight out with the new token.
        d.send(RequestSpec::get("/me")).await.unwrap();
        assert_eq!(h.renewer.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_expired_requests_share_one_renewal() {
        let (base, up) = start_upstream(vec!["at_1"]).await;
        let h = Harness::new(ScriptedRenewer::gated());
        let d = Arc::new(dispatcher(&base, &h));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let d = d.clone();
                tokio::spawn(async move { d.send(RequestSpec::get("/me")).await })
            })
            .collect();

        // All six saw the expired token before the renewal was let through.
        while up.hits.load(Ordering::SeqCst) < 6 || h.coordinator.stats().waiters_enqueued < 5 {
            tokio::task::yield_now().await;
        }
        h.renewer.release();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().status, StatusCode::OK);
        }
        assert_eq!(h.renewer.calls(), 1);
        assert_eq!(up.hits.load(Ordering::SeqCst), 12);
        let stats = h.coordinator.stats();
        assert_eq!(stats.waiters_resolved, stats.waiters_enqueued);
    }

    #[tokio::test]
    async fn straggler_after_renewal_does_not_renew_again() {
        let (base, _up) = start_upstream(vec!["at_1"]).await;
        let h = Harness::new(ScriptedRenewer::new());
        let d = dispatcher(&base, &h);

        d.send(RequestSpec::get("/me")).await.unwrap();

        // Rejected token at_0 is stale; the store already holds at_1.
        let credential = h.coordinator.refresh_after_rejection("at_0").await.unwrap();
        assert_eq!(credential.access_token, "at_1");
        assert_eq!(h.renewer.calls(), 1);
    }

    #[tokio::test]
    async fn invalid_token_runs_hook_without_renewal() {
        let (base, up) = start_upstream(vec!["at_1"]).await;
        let h = Harness::new(ScriptedRenewer::new());
        h.coordinator
            .store()
            .replace(Credential::new("at_revoked", "rt_revoked"))
            .await;
        let d = dispatcher(&base, &h);

        let err = d.send(RequestSpec::get("/me")).await.unwrap_err();
        match err {
            Error::Unauthorized(response) => {
                assert_eq!(response.status, StatusCode::UNAUTHORIZED);
                assert_eq!(response.error_code().as_deref(), Some("token.invalid"));
            }
            other => panic!("expected Unauthorized, got {other:?}"),
        }
        assert_eq!(h.hook.count(), 1);
        assert_eq!(h.renewer.calls(), 0);
        assert_eq!(up.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn still_expired_after_renewal_is_not_retried_again() {
        // Nothing is ever accepted, every token reads as expired.
        let (base, up) = start_upstream(vec![]).await;
        let h = Harness::new(ScriptedRenewer::new());
        let d = dispatcher(&base, &h);

        let err = d.send(RequestSpec::get("/me")).await.unwrap_err();
        assert!(matches!(err, Error::ExpiredAfterRenewal(_)), "got: {err:?}");
        assert_eq!(h.renewer.calls(), 1);
        assert_eq!(up.hits.load(Ordering::SeqCst), 2);
        assert_eq!(h.hook.count(), 0);
    }

    #[tokio::test]
    async fn server_errors_pass_through_untouched() {
        let (base, _up) = start_upstream(vec!["at_0"]).await;
        let h = Harness::new(ScriptedRenewer::new());
        let d = dispatcher(&base, &h);

        let err = d.send(RequestSpec::post("/boom")).await.unwrap_err();
        let response = err.into_upstream().unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.body, Bytes::from_static(b"boom"));
        assert_eq!(h.renewer.calls(), 0);
        assert_eq!(h.hook.count(), 0);
    }

    #[tokio::test]
    async fn renewal_failure_fails_request_without_retry() {
        let (base, up) = start_upstream(vec!["at_1"]).await;
        let h = Harness::with_policy(
            ScriptedRenewer::new().then(Err(RenewalError::Rejected {
                status: 401,
                message: "Invalid refresh token.".into(),
            })),
            RenewalFailurePolicy::SignOutOnRejection,
        );
        let d = dispatcher(&base, &h);

        let err = d.send(RequestSpec::get("/me")).await.unwrap_err();
        assert!(
            matches!(err, Error::Renewal(RenewalError::Rejected { status: 401, .. })),
            "got: {err:?}"
        );
        assert_eq!(up.hits.load(Ordering::SeqCst), 1);
        assert_eq!(h.hook.count(), 1);
    }

    #[tokio::test]
    async fn caller_authorization_header_is_replaced() {
        let (base, up) = start_upstream(vec!["at_0"]).await;
        let h = Harness::new(ScriptedRenewer::new());
        let d = dispatcher(&base, &h);

        let request = RequestSpec::get("/me").header(
            AUTHORIZATION,
            HeaderValue::from_static("Bearer forged"),
        );
        d.send(request).await.unwrap();
        assert_eq!(up.seen.lock().unwrap().as_slice(), ["Bearer at_0"]);
    }

    #[tokio::test]
    async fn signed_out_requests_go_out_without_authorization() {
        let (base, up) = start_upstream(vec!["at_0"]).await;
        let h = Harness::new(ScriptedRenewer::new());
        h.coordinator.store().forget();
        let d = dispatcher(&base, &h);

        let err = d.send(RequestSpec::get("/me")).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)), "got: {err:?}");
        assert_eq!(up.seen.lock().unwrap().as_slice(), [""]);
    }

    #[tokio::test]
    async fn json_body_is_sent() {
        let (base, _up) = start_upstream(vec!["at_0"]).await;
        let h = Harness::new(ScriptedRenewer::new());
        let d = dispatcher(&base, &h);

        let request = RequestSpec::post("/echo")
            .json(&serde_json::json!({"name": "widget"}))
            .unwrap();
        let response = d.send(request).await.unwrap();
        let echoed: serde_json::Value = response.json().unwrap();
        assert_eq!(echoed["name"], "widget");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let h = Harness::new(ScriptedRenewer::new());
        let d = dispatcher(&format!("http://{addr}"), &h);
        let err = d.send(RequestSpec::get("/me")).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn custom_expired_code_is_honored() {
        let (base, _up) = start_upstream(vec!["at_1"]).await;
        let h = Harness::with_config(ScriptedRenewer::new(), CoordinatorConfig::default());
        let mut config = DispatcherConfig::new(&base);
        config.expired_code = "jwt.stale".into();
        let d = Dispatcher::new(reqwest::Client::new(), config, h.coordinator.clone());

        // token.expired is no longer the renewable code.
        let err = d.send(RequestSpec::get("/me")).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)), "got: {err:?}");
        assert_eq!(h.renewer.calls(), 0);
        assert_eq!(h.hook.count(), 1);
    }
}
