//! Session Proxy
//!
//! Single-binary Rust service that:
//! 1. Holds one signed-in session against an upstream API
//! 2. Listens for incoming requests
//! 3. Forwards them with the session's bearer token
//! 4. Renews the token once when the upstream reports it expired, sharing the
//!    renewal across every request that hit the expiry at the same time

mod config;
mod error;
mod metrics;
mod proxy;
mod session;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use session_auth::{AuthClient, CredentialFile};
use session_gateway::{CredentialStore, Dispatcher, DispatcherConfig, RefreshCoordinator};
use session_provider::{CredentialPersistence, MemoryPersistence};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::metrics::ServiceMetrics;
use crate::proxy::ProxyState;
use crate::session::{ProfileCache, Session, SignOut};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    session: Arc<Session>,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let session_routes = session::build_session_router(state.session.clone());
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .with_state(state)
        .merge(session_routes)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

/// Wire store, renewer, coordinator and dispatcher from configuration.
async fn build_session(config: &Config, client: reqwest::Client) -> Arc<Session> {
    let persistence: Arc<dyn CredentialPersistence> = match &config.auth.credential_file {
        Some(path) => Arc::new(
            CredentialFile::new(path.clone()).with_max_age(config.auth.credential_max_age()),
        ),
        None => {
            warn!("no credential_file configured, the session will not survive a restart");
            Arc::new(MemoryPersistence::new())
        }
    };
    let store = Arc::new(CredentialStore::load(persistence).await);

    let auth = AuthClient::new(client.clone(), config.proxy.upstream_url.as_str())
        .with_paths(&config.auth.sign_in_path, &config.auth.refresh_path);
    let profile = ProfileCache::default();
    let coordinator = Arc::new(RefreshCoordinator::new(
        store.clone(),
        Arc::new(auth.clone()),
        Arc::new(SignOut::new(store, profile.clone())),
        config.auth.coordinator(),
    ));

    let mut dispatcher_config = DispatcherConfig::new(config.proxy.upstream_url.as_str());
    dispatcher_config.timeout = config.proxy.timeout();
    dispatcher_config.expired_code = config.auth.expired_code.clone();
    let dispatcher = Arc::new(Dispatcher::new(client, dispatcher_config, coordinator));

    Arc::new(Session::new(
        auth,
        dispatcher,
        profile,
        config.auth.profile_path.as_str(),
    ))
}

/// Headless sign-in when `[auth.sign_in]` is configured and nothing was restored.
async fn startup_sign_in(config: &Config, session: &Session) -> Result<()> {
    let Some(sign_in) = &config.auth.sign_in else {
        return Ok(());
    };
    if session.dispatcher().store().is_authenticated() {
        info!("using restored credential, skipping startup sign-in");
        return Ok(());
    }
    let Some(password) = &sign_in.password else {
        anyhow::bail!("auth.sign_in configured without a password");
    };

    session
        .sign_in(&sign_in.email, password.expose())
        .await
        .with_context(|| format!("startup sign-in failed for {}", sign_in.email))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting session-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        policy = ?config.auth.renewal_failure_policy,
        persistent = config.auth.credential_file.is_some(),
        "configuration loaded"
    );

    let session = build_session(&config, reqwest::Client::new()).await;
    startup_sign_in(&config, &session).await?;

    let metrics = ServiceMetrics::new();
    let app_state = AppState {
        proxy: ProxyState {
            dispatcher: session.dispatcher().clone(),
            metrics: metrics.clone(),
        },
        session,
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Clone in_flight counter for drain observability after shutdown
    let in_flight = metrics.in_flight.clone();
    let drain_timeout = config.proxy.drain_timeout();

    // The drain timeout starts when the shutdown signal fires: notify the
    // server to drain, then race the drain against the timeout.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(drain_timeout, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = drain_timeout.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: status, session state, renewal counters, uptime, requests served.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = &state.proxy.metrics;
    let coordinator = state.session.dispatcher().coordinator();
    let authenticated = coordinator.store().is_authenticated();

    let body = serde_json::json!({
        "status": "healthy",
        "session": if authenticated { "authenticated" } else { "signed_out" },
        "refreshing": coordinator.is_refreshing(),
        "uptime_seconds": metrics.started_at.elapsed().as_secs(),
        "requests_served": metrics.requests_total.load(Ordering::Relaxed),
        "errors_total": metrics.errors_total.load(Ordering::Relaxed),
        "in_flight": metrics.in_flight.load(Ordering::Relaxed),
        "renewals": coordinator.stats(),
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that proxies every non-reserved request to upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
