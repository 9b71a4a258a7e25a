use tokio::net::TcpListener;
use tracing::info;

use parley_gateway::{Gateway, GatewayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley_gateway=info,parley_server=info".into()),
        )
        .init();

    // Config
    let config = GatewayConfig::from_env()?;

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("Parley server listening on {}", config.listen_addr);

    let gateway = Gateway::new(config);
    tokio::select! {
        _ = gateway.run(listener) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
