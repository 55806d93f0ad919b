pub mod config;
pub mod excel;
pub mod logging;
pub mod server;
pub mod storage;

use std::future::Future;
use thiserror::Error;
use tokio::net::TcpListener;

use config::{Config, ConfigError};
use excel::{FolderWatcher, WatchError};
use storage::{StorageAreas, StorageError};

/// Startup and serving failures
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Run the service on an already bound listener until `shutdown` resolves.
///
/// Creates the storage areas, starts the folder watcher, serves HTTP and,
/// once the server has drained, stops the watcher and waits for it.
pub async fn serve<F>(listener: TcpListener, config: Config, shutdown: F) -> Result<(), AppError>
where
    F: Future<Output = ()> + Send + 'static,
{
    config.validate()?;
    StorageAreas::new(&config).ensure()?;

    let watcher = FolderWatcher::start(&config)?;
    let result = server::serve(listener, &config, shutdown).await;
    watcher.shutdown().await;

    result.map_err(AppError::Serve)
}

/// Bind the configured address and serve until Ctrl-C or SIGTERM
pub async fn run(config: Config) -> Result<(), AppError> {
    let addr = config.socket_addr()?;
    let listener = TcpListener::bind(addr).await.map_err(|source| AppError::Bind {
        addr: config.bind_addr.clone(),
        source,
    })?;

    serve(listener, config, shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
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
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
