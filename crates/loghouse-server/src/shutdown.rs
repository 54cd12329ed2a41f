//! Graceful Shutdown
//!
//! One future that completes on SIGINT (Ctrl+C) or, on Unix, SIGTERM.
//! `axum::serve(...).with_graceful_shutdown(shutdown_signal())` then
//! finishes in-flight requests before returning, and the node persists
//! its state afterwards.

use tracing::info;

/// Resolves when the process is asked to stop.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
