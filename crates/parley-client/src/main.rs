use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use parley_client::{ClientConfig, ClientSession, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley_client=info,parley_transfer=info".into()),
        )
        .init();

    let config = ClientConfig::from_env()?;
    let stream = TcpStream::connect(&config.server_addr).await?;
    info!("Connected to {}", config.server_addr);

    // Stdin feeds commands; the session outlives it so piped input works.
    let (tx, rx) = mpsc::channel::<Command>(64);
    let file_enabled = config.file_transfer;
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match Command::parse(&line, file_enabled) {
                    Some(command) => {
                        if tx.send(command).await.is_err() {
                            break;
                        }
                    }
                    None => warn!("Unrecognised input {:?}", line),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin error: {}", e);
                    break;
                }
            }
        }
    });

    ClientSession::new(config).run(stream, rx).await
}
