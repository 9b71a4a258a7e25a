//! Chat chunking and reassembly.
//!
//! Chat is best-effort: chunks are never acknowledged or retried. The
//! receiver buffers chunks by sequence number and releases the message once
//! every sequence from 0 to `count - 1` is present, whatever the arrival order.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use parley_types::{ClientId, Frame, FrameType, Status, new_frame_id};

use crate::protocol::{CHAT_REASSEMBLY_TTL, chat_chunk_id, parse_chat_chunk_id};

/// Split `text` into chat frames of at most `max_payload` bytes sharing one
/// transfer id. Splits land on UTF-8 boundaries when the text is valid UTF-8.
pub fn split_chat(src: ClientId, dst: ClientId, text: &[u8], max_payload: usize) -> Vec<Frame> {
    let transfer = new_frame_id();
    let pieces = split_points(text, max_payload.max(1));
    let count = pieces.len() as u32;

    pieces
        .into_iter()
        .enumerate()
        .map(|(seq, piece)| {
            Frame::new(
                chat_chunk_id(&transfer, seq as u32, count),
                FrameType::Chat,
                src,
                dst,
                Bytes::copy_from_slice(piece),
                Status::Ready,
            )
        })
        .collect()
}

fn split_points(text: &[u8], max_payload: usize) -> Vec<&[u8]> {
    if text.is_empty() {
        return vec![text];
    }
    let utf8 = std::str::from_utf8(text).is_ok();
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + max_payload).min(text.len());
        if utf8 {
            // Back off continuation bytes (10xxxxxx).
            while end < text.len() && end > start && text[end] & 0xC0 == 0x80 {
                end -= 1;
            }
            if end == start {
                end = (start + max_payload).min(text.len());
            }
        }
        pieces.push(&text[start..end]);
        start = end;
    }
    pieces
}

struct PendingChat {
    count: u32,
    parts: BTreeMap<u32, Bytes>,
    first_seen: Instant,
    template: Frame,
}

/// Receiver-side buffer turning chunk frames back into whole messages.
pub struct ChatReassembler {
    pending: HashMap<(ClientId, String), PendingChat>,
    ttl: Duration,
}

impl ChatReassembler {
    pub fn new() -> Self {
        Self::with_ttl(CHAT_REASSEMBLY_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            ttl,
        }
    }

    /// Feed one chat frame. Returns the whole message, with the transfer id as
    /// its frame id, once its last missing chunk arrives. Frames whose id is
    /// not a chunk id are passed through unchanged.
    pub fn accept(&mut self, frame: Frame) -> Option<Frame> {
        self.prune();

        let Some((transfer, seq, count)) = parse_chat_chunk_id(&frame.id) else {
            return Some(frame);
        };
        let transfer = transfer.to_string();

        if count == 1 {
            return Some(Frame { id: transfer, ..frame });
        }

        let key = (frame.src, transfer.clone());
        let entry = self.pending.entry(key.clone()).or_insert_with(|| PendingChat {
            count,
            parts: BTreeMap::new(),
            first_seen: Instant::now(),
            template: frame.clone(),
        });
        if entry.count != count {
            // Conflicting chunk counts for one transfer; keep the first.
            return None;
        }
        entry.parts.insert(seq, frame.payload);

        if entry.parts.len() < count as usize {
            return None;
        }

        let done = self.pending.remove(&key)?;
        let mut payload = BytesMut::new();
        for part in done.parts.values() {
            payload.extend_from_slice(part);
        }
        Some(Frame {
            id: transfer,
            payload: payload.freeze(),
            ..done.template
        })
    }

    /// Drop buffers from `peer`, e.g. after it disconnects.
    pub fn forget_peer(&mut self, peer: ClientId) {
        self.pending.retain(|(src, _), _| *src != peer);
    }

    /// Messages still waiting for chunks.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn prune(&mut self) {
        let ttl = self.ttl;
        self.pending.retain(|_, chat| chat.first_seen.elapsed() < ttl);
    }
}

impl Default for ChatReassembler {
    fn default() -> Self {
        Self::new()
    }
}
