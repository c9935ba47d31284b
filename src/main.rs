//! Server plane binary.
//!
//! Binds the local HTTP front-end and the control-channel listener, then
//! serves until SIGINT or SIGTERM.

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use browser_bridge::config::{validate_bridge_config, BridgeConfig};
use browser_bridge::lifecycle;
use browser_bridge::Bridge;

#[derive(Parser, Debug)]
#[command(name = "bridge", about = "Split-plane HTTP proxy bridge, server plane")]
struct Cli {
    /// Bind address for the local HTTP front-end.
    #[arg(long, default_value = "127.0.0.1:8889")]
    http_bind: String,

    /// Bind address for the control-channel WebSocket listener.
    #[arg(long, default_value = "127.0.0.1:9998")]
    control_bind: String,

    /// Idle window in seconds before the first response event (120-600).
    #[arg(long, default_value_t = 600)]
    initial_idle_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "browser_bridge=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = BridgeConfig::default();
    config.http.bind_address = cli.http_bind;
    config.control.bind_address = cli.control_bind;
    config.timeouts.initial_idle_secs = cli.initial_idle_secs;

    if let Err(errors) = validate_bridge_config(&config) {
        for error in &errors {
            tracing::error!(%error, "invalid configuration");
        }
        return Err("configuration rejected".into());
    }

    tracing::info!(
        http = %config.http.bind_address,
        control = %config.control.bind_address,
        initial_idle_secs = config.timeouts.initial_idle_secs,
        "bridge starting"
    );

    let http_listener = TcpListener::bind(&config.http.bind_address).await?;
    let control_listener = TcpListener::bind(&config.control.bind_address).await?;

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        lifecycle::signal_received().await;
        signal_shutdown.cancel();
    });

    Bridge::new(config)
        .run(http_listener, control_listener, shutdown)
        .await?;

    tracing::info!("bridge stopped");
    Ok(())
}
