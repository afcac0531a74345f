//! Media Server Application
//!
//! Listens for sACN control frames and plays media accordingly.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pi_mediaserver::config::AppConfig;
#[cfg(unix)]
use pi_mediaserver::server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    // Optional config path as the only argument
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);

    // RUST_LOG overrides the configured level
    let config = AppConfig::load(config_path.as_deref());

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Pi Mediaserver v{}", env!("CARGO_PKG_VERSION"));

    #[cfg(not(unix))]
    {
        let _ = config;
        anyhow::bail!("the media server requires a Unix host")
    }

    #[cfg(unix)]
    {
        let server = Server::new(config);
        server.start()?;

        shutdown_signal().await?;
        tracing::info!("Shutting down...");

        // Teardown joins threads; keep it off the async workers
        tokio::task::spawn_blocking(move || server.stop()).await?;
        Ok(())
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
