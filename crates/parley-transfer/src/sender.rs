//! Outbound file transfer state machine.
//!
//! ```text
//! ANNOUNCE ──start()──► SENDING ──► AWAITING_ACK ──on_ack()──► COMPLETE
//!                                        │
//!                                        └──fail()──► FAILED
//! ```
//!
//! `start` emits INCOMING, every chunk in order, then DONE. While awaiting
//! the ACK, retry requests resend exactly the requested chunk.

use std::str::FromStr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use parley_types::{ClientId, Frame, FrameType, Status, new_frame_id};

use crate::logging::{NullLogger, TransferEvent, TransferLog, TransferLogger};
use crate::protocol::{chunk_id, chunks_for, done_payload, incoming_payload};

/// Sender states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Announce,
    Sending,
    AwaitingAck,
    Complete,
    Failed,
}

/// Drops the first `times` transmissions of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossSimulator {
    pub chunk: u32,
    pub times: u32,
    dropped: u32,
}

impl LossSimulator {
    pub fn new(chunk: u32, times: u32) -> Self {
        Self {
            chunk,
            times,
            dropped: 0,
        }
    }

    /// Whether this transmission of `seq` should be lost.
    pub fn drops(&mut self, seq: u32) -> bool {
        if seq != self.chunk || self.dropped >= self.times {
            return false;
        }
        self.dropped += 1;
        true
    }
}

/// Parses `<chunk>:<times>`.
impl FromStr for LossSimulator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (chunk, times) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <chunk>:<times>, got {:?}", s))?;
        let chunk = chunk
            .trim()
            .parse()
            .map_err(|e| format!("bad chunk {:?}: {}", chunk, e))?;
        let times = times
            .trim()
            .parse()
            .map_err(|e| format!("bad times {:?}: {}", times, e))?;
        Ok(Self::new(chunk, times))
    }
}

/// One outbound file, chunked and hashed up front.
pub struct OutboundFile {
    transfer_id: String,
    src: ClientId,
    dst: ClientId,
    filename: String,
    chunks: Vec<Bytes>,
    sha256: String,
    state: SendState,
    loss: Option<LossSimulator>,
    logger: Arc<dyn TransferLogger>,
}

impl OutboundFile {
    pub fn new(src: ClientId, dst: ClientId, filename: &str, data: &[u8], chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let chunks = data
            .chunks(chunk_size)
            .map(Bytes::copy_from_slice)
            .collect::<Vec<_>>();
        debug_assert_eq!(chunks.len() as u32, chunks_for(data.len(), chunk_size));

        Self {
            transfer_id: new_frame_id(),
            src,
            dst,
            filename: filename.to_string(),
            chunks,
            sha256: hex::encode(Sha256::digest(data)),
            state: SendState::Announce,
            loss: None,
            logger: Arc::new(NullLogger),
        }
    }

    pub fn with_loss(mut self, loss: Option<LossSimulator>) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn target(&self) -> ClientId {
        self.dst
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, SendState::Complete | SendState::Failed)
    }

    /// Announce, send every chunk, then DONE. Chunks lost to simulation are
    /// left out of the returned frames.
    pub fn start(&mut self) -> Vec<Frame> {
        if self.state != SendState::Announce {
            return Vec::new();
        }
        self.log(TransferEvent::Preparing {
            filename: self.filename.clone(),
            target: self.dst,
            chunks: self.total_chunks(),
        });

        let mut frames = Vec::with_capacity(self.chunks.len() + 2);
        frames.push(self.frame(
            self.transfer_id.clone(),
            FrameType::File,
            incoming_payload(&self.filename, self.total_chunks()),
            Status::Incoming,
        ));

        self.state = SendState::Sending;
        for seq in 0..self.total_chunks() {
            if let Some(frame) = self.transmit(seq) {
                frames.push(frame);
            }
        }
        frames.push(self.done_frame());

        self.state = SendState::AwaitingAck;
        frames
    }

    /// Answer a retry request. `seq == total` asks for DONE again.
    pub fn on_retry(&mut self, seq: u32) -> Option<Frame> {
        if self.state != SendState::AwaitingAck {
            return None;
        }
        if seq == self.total_chunks() {
            return Some(self.done_frame());
        }
        if seq > self.total_chunks() {
            return None;
        }
        let frame = self.transmit(seq)?;
        self.log(TransferEvent::Resent { seq });
        Some(frame)
    }

    /// Returns true if this ACK completed the transfer.
    pub fn on_ack(&mut self) -> bool {
        if self.state != SendState::AwaitingAck {
            return false;
        }
        self.state = SendState::Complete;
        self.log(TransferEvent::Acknowledged {
            filename: self.filename.clone(),
        });
        true
    }

    pub fn fail(&mut self, reason: &str) {
        if self.is_finished() {
            return;
        }
        self.state = SendState::Failed;
        self.log(TransferEvent::Failed {
            filename: self.filename.clone(),
            reason: reason.to_string(),
        });
    }

    fn transmit(&mut self, seq: u32) -> Option<Frame> {
        if let Some(loss) = self.loss.as_mut() {
            if loss.drops(seq) {
                self.log(TransferEvent::ChunkDropped { seq });
                return None;
            }
        }
        let payload = STANDARD.encode(&self.chunks[seq as usize]);
        Some(self.frame(
            chunk_id(&self.transfer_id, seq),
            FrameType::File,
            payload,
            Status::Chunk,
        ))
    }

    fn done_frame(&self) -> Frame {
        self.frame(
            self.transfer_id.clone(),
            FrameType::File,
            done_payload(&self.filename, &self.sha256),
            Status::Done,
        )
    }

    fn frame(&self, id: String, kind: FrameType, payload: String, status: Status) -> Frame {
        Frame::new(id, kind, self.src, self.dst, payload, status)
    }

    fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: "sender",
            transfer_id: self.transfer_id.clone(),
            event,
        });
    }
}
