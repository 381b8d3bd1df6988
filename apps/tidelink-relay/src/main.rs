use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tidelink_relay::{build_router, RelayState};

#[derive(Parser, Debug)]
#[command(name = "tidelink-relay")]
#[command(about = "Signaling relay for tidelink peers")]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "TIDELINK_RELAY_PORT", default_value_t = 9092)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO when RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let addr = format!("{}:{}", cli.bind, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!("tidelink relay listening on {}", addr);
    axum::serve(listener, build_router(RelayState::new()))
        .await
        .context("relay server stopped")?;
    Ok(())
}
