//! Process lifecycle: signal wiring.
//!
//! Both binaries stop through the same `CancellationToken` plumbing used
//! for per-connection and per-request cancellation; this module only
//! translates OS signals into that world.

use tracing::info;

/// Resolve when the process receives SIGINT or SIGTERM.
pub async fn signal_received() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
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
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
