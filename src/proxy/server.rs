//! HTTP server setup and configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
    Router,
};
use reqwest::Client;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use super::{auth, handlers, logs, stats};
use crate::catalog::{Catalog, ReloadController, Snapshot};
use crate::config::{ApiKey, Config};
use crate::storage::LogStore;

/// Largest accepted request body. Image inputs make completions large.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub store: LogStore,
    pub http_client: Client,
    pub reloader: Arc<ReloadController>,
    pub auth_token: Option<ApiKey>,
}

/// HTTP client for upstream calls.
///
/// Timeouts are applied per request, so the client itself has none.
pub fn build_http_client() -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
}

/// Create the axum router with all endpoints.
///
/// Everything except `/health` sits behind the bearer token gate.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        // OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/models", get(handlers::list_models))
        .route("/v1/model/info", get(handlers::model_info))
        // Analytics
        .route("/stats", get(stats::stats))
        .route("/stats/daily", get(stats::daily))
        .route("/stats/hourly", get(stats::hourly))
        .route("/stats/date-range", get(stats::date_range))
        .route("/requests", get(logs::requests))
        .route("/requests/:id/details", get(logs::request_details))
        .route("/errors", delete(logs::delete_errors))
        // Administration
        .route("/admin/reload", post(handlers::admin_reload))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server until Ctrl-C or SIGTERM.
///
/// On Unix, SIGHUP reloads the configuration file.
pub async fn run_server(config: Config, config_path: PathBuf) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();
    let db_path = config.database().path;

    let store = LogStore::open(&db_path)
        .await
        .with_context(|| format!("Failed to open request log at '{}'", db_path))?;
    tracing::info!(path = %db_path, "Request log ready");

    let snapshot = Snapshot::from_config(&config, 1)?;
    tracing::info!(
        models = snapshot.registry.models_count(),
        providers = snapshot.registry.providers_count(),
        priced = snapshot.pricing.len(),
        "Configuration loaded"
    );
    let catalog = Arc::new(Catalog::new(snapshot));
    let reloader = Arc::new(ReloadController::new(config_path, Arc::clone(&catalog)));

    let state = AppState {
        catalog,
        store: store.clone(),
        http_client: build_http_client()?,
        reloader: Arc::clone(&reloader),
        auth_token: config.server.auth_token.clone(),
    };
    if state.auth_token.is_none() {
        tracing::warn!("No auth token configured - every endpoint is open");
    }

    let app = match config.server.max_concurrent_requests {
        Some(limit) => create_router(state).layer(ConcurrencyLimitLayer::new(limit)),
        None => create_router(state),
    };

    spawn_reload_on_hangup(reloader);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    tracing::info!(address = %listen_addr, "Starting tollgate gateway");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    store.close().await;
    tracing::info!("Gateway stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(unix)]
fn spawn_reload_on_hangup(reloader: Arc<ReloadController>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::warn!(error = %e, "SIGHUP reload unavailable");
            return;
        }
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            tracing::info!(path = %reloader.path().display(), "Received SIGHUP, reloading");
            // Outcome is logged by the controller
            let _ = reloader.reload().await;
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_reloader: Arc<ReloadController>) {}
