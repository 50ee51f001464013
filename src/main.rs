//! Voice relay server binary.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_relay::{Config, OllamaBackend, Relay, RelayServer};

#[derive(Debug, Parser)]
#[command(
    name = "voice-relay",
    about = "WebSocket relay for spoken language-model replies",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long, default_value = "config/relay.toml")]
    config: PathBuf,

    /// Host to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(Some(args.config.as_path()))?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    info!(
        llm = %config.llm.base_url,
        model = %config.llm.model,
        voice_id = %config.tts.voice.voice_id,
        "Starting voice relay"
    );

    let backend = Arc::new(OllamaBackend::new(&config.llm.base_url));
    let relay = Arc::new(Relay::new(backend, config.relay_settings()));
    let server = RelayServer::bind(config.bind_addr(), relay).await?;

    info!("Relay ready. Press Ctrl+C to stop.");
    server.run_until(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
