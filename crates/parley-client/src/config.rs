use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use parley_transfer::{LossSimulator, TransferSettings};

use crate::filter::DEFAULT_BANNED_WORDS;

/// Peer client settings, read from `PARLEY_*` environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    /// File commands are only recognised when this is on.
    pub file_transfer: bool,
    pub send_dir: PathBuf,
    pub recv_dir: PathBuf,
    pub transfer: TransferSettings,
    pub banned_words: Vec<String>,
    /// Diagnostic loss injection on outbound files.
    pub simulate_loss: Option<LossSimulator>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:5555".into(),
            file_transfer: false,
            send_dir: PathBuf::from("assets/to_send"),
            recv_dir: PathBuf::from("assets/received"),
            transfer: TransferSettings::default(),
            banned_words: DEFAULT_BANNED_WORDS.iter().map(|w| w.to_string()).collect(),
            simulate_loss: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let transfer = TransferSettings {
            max_payload: env_or("PARLEY_MAX_PAYLOAD", defaults.transfer.max_payload)?,
            file_chunk: env_or("PARLEY_FILE_CHUNK", defaults.transfer.file_chunk)?,
            retry_ceiling: env_or("PARLEY_RETRY_CEILING", defaults.transfer.retry_ceiling)?,
            retry_timeout: Duration::from_millis(env_or(
                "PARLEY_RETRY_TIMEOUT_MS",
                defaults.transfer.retry_timeout.as_millis() as u64,
            )?),
            max_file_chunks: env_or("PARLEY_MAX_FILE_CHUNKS", defaults.transfer.max_file_chunks)?,
        };
        if transfer.max_payload == 0 || transfer.file_chunk == 0 {
            anyhow::bail!("PARLEY_MAX_PAYLOAD and PARLEY_FILE_CHUNK must be at least 1");
        }

        let banned_words = match std::env::var("PARLEY_BANNED_WORDS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|w| !w.is_empty())
                .map(String::from)
                .collect(),
            Err(_) => defaults.banned_words,
        };

        let simulate_loss = match std::env::var("PARLEY_SIMULATE_LOSS") {
            Ok(raw) if !raw.trim().is_empty() => Some(
                raw.parse::<LossSimulator>()
                    .map_err(|e| anyhow::anyhow!("PARLEY_SIMULATE_LOSS: {}", e))?,
            ),
            _ => None,
        };

        Ok(Self {
            server_addr: std::env::var("PARLEY_SERVER").unwrap_or(defaults.server_addr),
            file_transfer: env_flag("PARLEY_FILE_TRANSFER")?,
            send_dir: std::env::var("PARLEY_SEND_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.send_dir),
            recv_dir: std::env::var("PARLEY_RECV_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.recv_dir),
            transfer,
            banned_words,
            simulate_loss,
        })
    }
}

/// Parse `name` if set, otherwise use `default`.
fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has invalid value {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

fn env_flag(name: &str) -> anyhow::Result<bool> {
    match std::env::var(name) {
        Ok(raw) => parse_flag(&raw).with_context(|| format!("{} has invalid value {:?}", name, raw)),
        Err(_) => Ok(false),
    }
}

fn parse_flag(raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {:?}", other),
    }
}
