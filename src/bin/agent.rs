//! Browser plane binary.
//!
//! Connects to the server plane's control channel and executes upstream
//! calls from within the logged-in session context until SIGINT or
//! SIGTERM.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use browser_bridge::agent::AgentRuntime;
use browser_bridge::config::AgentConfig;
use browser_bridge::lifecycle;

#[derive(Parser, Debug)]
#[command(
    name = "bridge-agent",
    about = "Split-plane HTTP proxy bridge, browser plane"
)]
struct Cli {
    /// Control-channel URL of the server plane.
    #[arg(long, default_value = "ws://127.0.0.1:9998")]
    control_url: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "browser_bridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AgentConfig {
        control_url: cli.control_url,
        ..AgentConfig::default()
    };

    tracing::info!(
        control = %config.control_url,
        upstream = %config.upstream_base,
        "agent starting"
    );

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        lifecycle::signal_received().await;
        signal_shutdown.cancel();
    });

    AgentRuntime::new(config).run(shutdown).await;
    tracing::info!("agent stopped");
}
