use anyhow::Result;
use mitmtap::{Config, ProxyServer};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .json()
        .init();

    info!("Starting {} {}", mitmtap::NAME, mitmtap::VERSION);

    // Load configuration
    let config = Config::from_env()?;
    info!(
        root_dir = %config.certificates.root_dir.display(),
        cache_dir = %config.certificates.cache_dir.display(),
        issuer = ?config.issuer,
        "Configuration loaded"
    );

    let server = ProxyServer::from_config(&config)?;

    // Bind TCP listener
    let bind_addr = config.bind_addr();
    let listener = TcpListener::bind(&bind_addr).await?;

    server.run(listener).await
}
