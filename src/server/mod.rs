//! HTTP surface over the resolver and the transcode proxy.

pub mod error;
pub mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{http::Method, routing::get, Router};
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::capability::CapabilityContext;
use crate::config::Config;
use crate::provider::{ModuleCache, StreamResolver};
use crate::sandbox::SandboxExecutor;
use crate::transcode::TranscodeProxy;

pub use error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<StreamResolver>,
    pub transcoder: Arc<TranscodeProxy>,
}

impl AppState {
    pub fn new(resolver: Arc<StreamResolver>, transcoder: Arc<TranscodeProxy>) -> Self {
        Self { resolver, transcoder }
    }

    /// Wire every component from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let capabilities = Arc::new(
            CapabilityContext::new(&config.capabilities).context("failed to build capability context")?,
        );
        let sandbox = Arc::new(SandboxExecutor::new(capabilities, config.sandbox.clone()));
        let modules = Arc::new(ModuleCache::from_config(&config.modules).context("failed to build module cache")?);

        Ok(Self::new(
            Arc::new(StreamResolver::new(modules, sandbox)),
            Arc::new(TranscodeProxy::new(&config.transcode)),
        ))
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/stream", get(routes::stream))
        .route("/api/info", get(routes::info))
        .route("/api/episodes", get(routes::episodes))
        .route("/api/home", get(routes::home))
        .route("/api/test-provider", get(routes::test_provider))
        .route("/api/transcode", get(routes::transcode))
        .route("/api/transcode/test", get(routes::transcode_test))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until Ctrl+C or SIGTERM.
pub async fn serve(state: AppState, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %listener.local_addr()?, "Listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
