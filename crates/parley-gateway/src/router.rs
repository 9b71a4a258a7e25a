use tracing::{debug, info, trace, warn};

use parley_types::{ClientId, Frame, FrameType, ProtocolError, SYSTEM_ID, Status};

use crate::registry::{Readiness, Registry};

/// Forwards addressed frames between connected clients.
///
/// Pure forwarding: no reassembly, no retries. Those belong to the peers.
#[derive(Clone)]
pub struct Router {
    registry: Registry,
}

impl Router {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Route a frame read from `sender`'s connection.
    ///
    /// `src` is rewritten to the sender's id; everything else is forwarded
    /// verbatim. On `UnknownTarget` the sender gets an ALERT and the frame is
    /// dropped.
    pub async fn route(&self, sender: ClientId, mut frame: Frame) -> Result<(), ProtocolError> {
        if frame.src != sender {
            warn!(
                "frame {} from client {} claims src {}, rewriting",
                frame.id, sender, frame.src
            );
            frame.src = sender;
        }

        let Some((sender_outbox, readiness)) = self.registry.lookup(sender).await else {
            // Sender already unregistered; nothing to notify.
            return Ok(());
        };

        if readiness == Readiness::Waiting {
            debug!("client {} sent {} while waiting, re-sending WAIT", sender, frame.kind);
            sender_outbox.deliver(Frame::wait(sender)).await;
            return Err(ProtocolError::CapabilityDenied);
        }

        let target = frame.dst;
        let destination = if target == SYSTEM_ID {
            None
        } else {
            self.registry.lookup(target).await
        };
        let Some((outbox, _)) = destination else {
            warn!("client {} addressed unknown target {}, dropping {}", sender, target, frame.id);
            sender_outbox
                .deliver(Frame::alert(sender, format!("Unknown target {}", target)))
                .await;
            return Err(ProtocolError::UnknownTarget(target));
        };

        log_forward(&frame);
        outbox.deliver(frame).await;
        Ok(())
    }
}

fn log_forward(frame: &Frame) {
    match (frame.kind, frame.status) {
        (FrameType::Chat, _) => info!(
            "[CHAT] Forwarding from {} to {}: {}",
            frame.src,
            frame.dst,
            frame.payload_str()
        ),
        (FrameType::File, Status::Chunk) => trace!(
            "[FILE] Forwarding chunk {} from {} to {}",
            frame.id, frame.src, frame.dst
        ),
        (FrameType::File, _) | (FrameType::Ack, _) => info!(
            "[FILE] Forwarding {} from {} to {}: {}",
            frame.status,
            frame.src,
            frame.dst,
            frame.payload_str()
        ),
        _ => debug!(
            "Forwarding {}|{} from {} to {}",
            frame.kind, frame.status, frame.src, frame.dst
        ),
    }
}
