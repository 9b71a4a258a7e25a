//! Inbound file reassembly.
//!
//! ```text
//! INCOMING ──► collecting chunks ──► all chunks + DONE ──► verify SHA-256 ──► ACK
//!                  ▲        │
//!                  └─RETRY──┘  (per chunk, up to the retry ceiling)
//! ```
//!
//! The receiver owns the gap bookkeeping only. Deadlines live with the
//! session that drives it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use parley_types::{ClientId, Frame, FrameType, ProtocolError, Status};

use crate::bitfield::ChunkBitfield;
use crate::logging::{NullLogger, TransferEvent, TransferLog, TransferLogger};
use crate::protocol::{chunk_id, parse_incoming};

/// Highest progress reported while any chunk is outstanding.
const MAX_PARTIAL_PERCENT: f64 = 99.99;

/// Result of feeding one CHUNK frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// New chunk stored. `gaps` are the sequence numbers it newly skipped
    /// over, in order.
    Accepted { percent: f64, gaps: Vec<u32> },
    /// Already had it.
    Duplicate,
    /// Sequence out of range or payload not base64.
    Rejected,
}

pub struct InboundFile {
    transfer_id: String,
    local: ClientId,
    peer: ClientId,
    filename: String,
    chunks: BTreeMap<u32, Bytes>,
    received: ChunkBitfield,
    digest: Option<String>,
    attempts: HashMap<u32, u32>,
    logger: Arc<dyn TransferLogger>,
}

impl InboundFile {
    /// Accept an INCOMING frame addressed to `local`. Returns `None` if the
    /// payload is not `<filename>:<totalChunks>` or announces more than
    /// `max_chunks` chunks.
    pub fn from_announcement(local: ClientId, frame: &Frame, max_chunks: u32) -> Option<Self> {
        let (filename, total) = parse_incoming(&frame.payload_str())?;
        if total > max_chunks {
            return None;
        }
        Some(Self {
            transfer_id: frame.id.clone(),
            local,
            peer: frame.src,
            filename,
            chunks: BTreeMap::new(),
            received: ChunkBitfield::new(total),
            digest: None,
            attempts: HashMap::new(),
            logger: Arc::new(NullLogger),
        })
    }

    pub fn with_logger(self, logger: Arc<dyn TransferLogger>) -> Self {
        let file = Self { logger, ..self };
        file.log(TransferEvent::Incoming {
            filename: file.filename.clone(),
            chunks: file.total_chunks(),
        });
        file
    }

    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn peer(&self) -> ClientId {
        self.peer
    }

    pub fn total_chunks(&self) -> u32 {
        self.received.total()
    }

    pub fn done_received(&self) -> bool {
        self.digest.is_some()
    }

    pub fn on_chunk(&mut self, seq: u32, payload: &[u8]) -> ChunkOutcome {
        if seq >= self.total_chunks() {
            return ChunkOutcome::Rejected;
        }
        if self.received.get(seq) {
            return ChunkOutcome::Duplicate;
        }
        let Ok(bytes) = STANDARD.decode(payload) else {
            return ChunkOutcome::Rejected;
        };
        let skipped_from = self.received.highest_seen().map_or(0, |h| h + 1);
        self.chunks.insert(seq, Bytes::from(bytes));
        self.received.set(seq);
        let gaps = self.received.missing_in(skipped_from..seq);

        let percent = self.percent();
        self.log(TransferEvent::Progress {
            filename: self.filename.clone(),
            percent,
        });
        ChunkOutcome::Accepted { percent, gaps }
    }

    /// Record the sender's digest. Returns false for a repeated DONE.
    pub fn on_done(&mut self, digest: String) -> bool {
        if self.digest.is_some() {
            return false;
        }
        self.digest = Some(digest);
        if self.total_chunks() == 0 {
            self.log(TransferEvent::Progress {
                filename: self.filename.clone(),
                percent: 100.0,
            });
        }
        true
    }

    /// Whether `seq` is still outstanding. `seq == total` stands for DONE.
    pub fn is_missing(&self, seq: u32) -> bool {
        match seq.cmp(&self.total_chunks()) {
            std::cmp::Ordering::Less => !self.received.get(seq),
            std::cmp::Ordering::Equal => self.digest.is_none(),
            std::cmp::Ordering::Greater => false,
        }
    }

    pub fn missing(&self) -> Vec<u32> {
        self.received.missing()
    }

    pub fn attempts(&self, seq: u32) -> u32 {
        self.attempts.get(&seq).copied().unwrap_or(0)
    }

    /// Build a RETRY for `seq`, or give up once `ceiling` requests have
    /// already gone unanswered.
    pub fn request_retry(&mut self, seq: u32, ceiling: u32) -> Result<Frame, ProtocolError> {
        let attempts = self.attempts.entry(seq).or_insert(0);
        if *attempts >= ceiling {
            return Err(ProtocolError::ChunkTimeout {
                filename: self.filename.clone(),
                seq,
                attempts: *attempts,
            });
        }
        *attempts += 1;
        let attempt = *attempts;

        self.log(TransferEvent::RetryRequested { seq, attempt });
        Ok(Frame::new(
            chunk_id(&self.transfer_id, seq),
            FrameType::File,
            self.local,
            self.peer,
            self.filename.clone(),
            Status::Retry,
        ))
    }

    /// Every chunk is in and DONE has arrived.
    pub fn is_ready(&self) -> bool {
        self.received.is_complete() && self.digest.is_some()
    }

    /// Concatenate the chunks and check them against the DONE digest.
    pub fn assemble(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut data = Vec::new();
        for chunk in self.chunks.values() {
            data.extend_from_slice(chunk);
        }
        let actual = hex::encode(Sha256::digest(&data));
        match &self.digest {
            Some(expected) if *expected == actual => Ok(data),
            _ => Err(ProtocolError::IntegrityMismatch {
                filename: self.filename.clone(),
            }),
        }
    }

    pub fn ack(&self) -> Frame {
        Frame::new(
            self.transfer_id.clone(),
            FrameType::Ack,
            self.local,
            self.peer,
            self.filename.clone(),
            Status::Ack,
        )
    }

    /// Share of chunks received. Stays below 100 until the last chunk is
    /// in, even where two-decimal rounding would say otherwise.
    pub fn percent(&self) -> f64 {
        let total = self.total_chunks();
        if total == 0 {
            return if self.digest.is_some() { 100.0 } else { 0.0 };
        }
        let received = self.received.received();
        let percent = received as f64 * 100.0 / total as f64;
        if received < total {
            percent.min(MAX_PARTIAL_PERCENT)
        } else {
            percent
        }
    }

    pub fn mark_saved(&self) {
        self.log(TransferEvent::Saved {
            filename: self.filename.clone(),
        });
    }

    pub fn fail(&self, reason: &str) {
        self.log(TransferEvent::Failed {
            filename: self.filename.clone(),
            reason: reason.to_string(),
        });
    }

    fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: "receiver",
            transfer_id: self.transfer_id.clone(),
            event,
        });
    }
}
