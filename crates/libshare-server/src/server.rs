use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::{extract::DefaultBodyLimit, middleware, routing::get, Router};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{auth::require_shared_user, handlers::health, AppState};

pub struct ServerOptions {
    pub host: String,
    /// Overrides the persisted port when set.
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
}

/// Routes for remote installations, limited by the persisted connection and
/// upload settings as they stand when the router is built.
pub fn router(state: AppState) -> Router {
    let cfg = state.config.get_config();
    let body_limit = usize::try_from(cfg.max_upload_size).unwrap_or(usize::MAX);

    Router::new()
        .route("/api/health", get(health))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_shared_user,
        ))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.max_connections.max(1)))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(opts: ServerOptions) -> Result<()> {
    let data_dir = crate::dirs::data_dir(opts.data_dir.as_deref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let state = AppState::open(&data_dir);
    let cfg = state.config.get_config();

    if !cfg.is_enabled {
        anyhow::bail!("sharing is disabled; enable it with `libshare config set --enabled true`");
    }

    if cfg.require_https {
        match (&cfg.ssl_cert_path, &cfg.ssl_key_path) {
            (Some(cert), Some(key)) => info!(
                cert = %cert.display(),
                key = %key.display(),
                "https required; TLS is terminated by the fronting server"
            ),
            _ => anyhow::bail!("requireHttps is set but sslCertPath/sslKeyPath are missing"),
        }
    }

    if let Some(lib) = &cfg.publish_library_path {
        info!(path = %lib.display(), "publishing library");
    }

    let port = opts.port.unwrap_or(cfg.port);
    let addr: SocketAddr = format!("{}:{}", opts.host, port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, users = state.users.list_users().len(), "library sharing listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}
