//! TCP accept loop and per-connection read/write tasks.
//!
//! Each connection gets a bounded outbound queue drained by its own writer
//! task, so a slow peer only ever backs up its own queue.

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use parley_types::{ClientId, Frame, FrameCodec, ProtocolError};

use crate::config::GatewayConfig;
use crate::registry::{Outbox, Registry};
use crate::router::Router;

/// Relay server state shared by all connections.
#[derive(Clone)]
pub struct Gateway {
    registry: Registry,
    router: Router,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let registry = Registry::new();
        let router = Router::new(registry.clone());
        Self {
            registry,
            router,
            config,
        }
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    let gateway = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = gateway.handle_connection(stream).await {
                            warn!("Connection from {} ended with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        socket2::SockRef::from(&stream).set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let mut frames_in = FramedRead::new(reader, FrameCodec::new(self.config.max_line));
        let mut frames_out = FramedWrite::new(writer, FrameCodec::new(self.config.max_line));

        let (tx, mut rx) = mpsc::channel::<Frame>(self.config.queue_capacity);
        let client_id = self
            .registry
            .register(Outbox::new(tx, self.config.send_timeout))
            .await;

        // Writer task: drains the outbound queue onto the socket.
        let mut write_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = frames_out.send(frame).await {
                    debug!("write to client {} failed: {}", client_id, e);
                    break;
                }
            }
        });

        let router = self.router.clone();
        let mut read_task = tokio::spawn(async move {
            read_loop(&mut frames_in, &router, client_id).await
        });

        let result = tokio::select! {
            _ = &mut write_task => {
                read_task.abort();
                Ok(())
            }
            joined = &mut read_task => {
                write_task.abort();
                joined.unwrap_or(Ok(()))
            }
        };

        self.registry.unregister(client_id).await;
        result
    }
}

/// Read frames and route them until the peer hangs up.
///
/// Malformed frames and routing failures are logged and the frame dropped;
/// only transport errors end the loop.
async fn read_loop(
    frames_in: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, FrameCodec>,
    router: &Router,
    client_id: ClientId,
) -> anyhow::Result<()> {
    while let Some(item) = frames_in.next().await {
        match item? {
            Ok(frame) => match router.route(client_id, frame).await {
                Ok(()) => {}
                Err(ProtocolError::UnknownTarget(target)) => {
                    debug!("dropped frame from {} to unknown target {}", client_id, target);
                }
                Err(e) => debug!("dropped frame from {}: {}", client_id, e),
            },
            Err(e) => {
                warn!("Malformed frame from client {}: {}", client_id, e);
            }
        }
    }
    Ok(())
}
