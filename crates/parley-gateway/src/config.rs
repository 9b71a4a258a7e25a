use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;

use parley_types::codec::DEFAULT_MAX_LINE;

/// Relay server settings, read from `PARLEY_*` environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    /// Outbound frames buffered per connection before senders wait.
    pub queue_capacity: usize,
    /// How long a routed frame may wait for room in a full queue.
    pub send_timeout: Duration,
    pub max_line: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5555)),
            queue_capacity: 256,
            send_timeout: Duration::from_millis(2000),
            max_line: DEFAULT_MAX_LINE,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let host = std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env_or("PARLEY_PORT", defaults.listen_addr.port())?;
        let listen_addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        let queue_capacity: usize = env_or("PARLEY_QUEUE_CAPACITY", defaults.queue_capacity)?;
        if queue_capacity == 0 {
            anyhow::bail!("PARLEY_QUEUE_CAPACITY must be at least 1");
        }

        Ok(Self {
            listen_addr,
            queue_capacity,
            send_timeout: Duration::from_millis(env_or(
                "PARLEY_SEND_TIMEOUT_MS",
                defaults.send_timeout.as_millis() as u64,
            )?),
            max_line: env_or("PARLEY_MAX_LINE", defaults.max_line)?,
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
