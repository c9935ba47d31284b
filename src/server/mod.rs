//! Server plane: HTTP front-end, dispatcher, pending table and
//! control-channel manager.

pub mod binding;
pub mod control;
pub mod dispatch;
pub mod http;
pub mod pending;

use std::future::IntoFuture;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::BridgeConfig;
use binding::BrowserBinding;
use control::ControlServer;
use dispatch::RequestIdAllocator;
use pending::PendingTable;

/// Shared state injected into HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub table: Arc<PendingTable>,
    pub binding: Arc<BrowserBinding>,
    pub ids: Arc<RequestIdAllocator>,
}

/// The assembled server plane.
pub struct Bridge {
    state: AppState,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let state = AppState {
            config: Arc::new(config),
            table: Arc::new(PendingTable::new()),
            binding: Arc::new(BrowserBinding::new()),
            ids: Arc::new(RequestIdAllocator::default()),
        };
        Self { state }
    }

    /// Serve both listeners until `shutdown` is cancelled. The listeners
    /// are passed in already bound so callers control the ports; tests
    /// bind port 0.
    pub async fn run(
        self,
        http_listener: TcpListener,
        control_listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let control = ControlServer::new(
            Arc::clone(&self.state.config),
            Arc::clone(&self.state.table),
            Arc::clone(&self.state.binding),
        );
        let control_shutdown = shutdown.clone();
        info!(
            address = %control_listener.local_addr()?,
            "control channel listening"
        );
        tokio::spawn(async move {
            control.run(control_listener, control_shutdown).await;
        });

        let router = http::build_router(self.state.clone());

        info!(address = %http_listener.local_addr()?, "HTTP front-end listening");
        tokio::select! {
            served = axum::serve(http_listener, router).into_future() => served?,
            _ = shutdown.cancelled() => info!("shutdown signal received, stopping front-end"),
        }
        Ok(())
    }
}
