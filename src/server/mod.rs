//! HTTP surface: upload a workbook, fetch the latest conversion, prune old files.

pub mod error;
pub mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::storage::StorageAreas;

pub use error::ApiError;

/// State shared by every handler
#[derive(Debug, Clone)]
pub struct AppState {
    pub areas: StorageAreas,
    pub source_extension: String,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        Self {
            areas: StorageAreas::new(config),
            source_extension: config.source_extension.clone(),
        }
    }
}

pub fn router(config: &Config) -> Router {
    let state = Arc::new(AppState::new(config));

    Router::new()
        .route("/upload", post(handlers::upload_file))
        .route("/data", get(handlers::get_latest_json))
        .route("/delete", delete(handlers::delete_old_files))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then let in-flight requests finish
pub async fn serve<F>(listener: TcpListener, config: &Config, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Listening");
    }

    axum::serve(listener, router(config))
        .with_graceful_shutdown(shutdown)
        .await
}
