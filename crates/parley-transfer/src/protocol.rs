//! Frame id and payload conventions for chat and file transfers.
//!
//! ```text
//! chat chunk      id  <transfer>_<seq>_<count>
//! file INCOMING   id  <transfer>        payload <filename>:<totalChunks>
//! file CHUNK      id  <transfer>_<seq>  payload base64(bytes)
//! file DONE       id  <transfer>        payload <filename>:<sha256 hex>
//! file RETRY      id  <transfer>_<seq>  payload <filename>   (seq == total: resend DONE)
//! ack ACK         id  <transfer>        payload <filename>
//! ```
//!
//! Transfer ids never contain `_`, so the sequence suffix is unambiguous.

use std::time::Duration;

/// Chat bytes carried by one frame.
pub const DEFAULT_MAX_PAYLOAD: usize = 512;

/// Raw file bytes per CHUNK frame (before base64).
pub const DEFAULT_FILE_CHUNK: usize = 1024;

/// Retry requests allowed per chunk before the receiver gives up.
pub const DEFAULT_RETRY_CEILING: u32 = 10;

/// Wait before a missing chunk is requested again.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_millis(500);

/// Largest announced file a receiver will track, in chunks.
pub const DEFAULT_MAX_FILE_CHUNKS: u32 = 1 << 20;

/// Extra ACK patience per announced chunk, on top of the retry budget.
pub const ACK_ALLOWANCE_PER_CHUNK: Duration = Duration::from_millis(1);

/// Incomplete chat reassembly buffers are discarded after this long.
pub const CHAT_REASSEMBLY_TTL: Duration = Duration::from_secs(30);

/// Tunables shared by the chat and file paths.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub max_payload: usize,
    pub file_chunk: usize,
    pub retry_ceiling: u32,
    pub retry_timeout: Duration,
    pub max_file_chunks: u32,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            file_chunk: DEFAULT_FILE_CHUNK,
            retry_ceiling: DEFAULT_RETRY_CEILING,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            max_file_chunks: DEFAULT_MAX_FILE_CHUNKS,
        }
    }
}

impl TransferSettings {
    /// How long a sender waits for the ACK of a `total_chunks` file once
    /// everything is flushed. Outlasts the receiver's full retry budget and
    /// grows with the number of chunks it still has to work through.
    pub fn ack_timeout(&self, total_chunks: u32) -> Duration {
        self.retry_timeout * (self.retry_ceiling + 2) + ACK_ALLOWANCE_PER_CHUNK * total_chunks
    }
}

pub fn chunk_id(transfer: &str, seq: u32) -> String {
    format!("{}_{}", transfer, seq)
}

/// Split `<transfer>_<seq>`.
pub fn parse_chunk_id(id: &str) -> Option<(&str, u32)> {
    let (transfer, seq) = id.rsplit_once('_')?;
    if transfer.is_empty() || transfer.contains('_') {
        return None;
    }
    Some((transfer, seq.parse().ok()?))
}

pub fn chat_chunk_id(transfer: &str, seq: u32, count: u32) -> String {
    format!("{}_{}_{}", transfer, seq, count)
}

/// Split `<transfer>_<seq>_<count>`, rejecting `seq >= count`.
pub fn parse_chat_chunk_id(id: &str) -> Option<(&str, u32, u32)> {
    let mut parts = id.split('_');
    let transfer = parts.next().filter(|t| !t.is_empty())?;
    let seq: u32 = parts.next()?.parse().ok()?;
    let count: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || seq >= count {
        return None;
    }
    Some((transfer, seq, count))
}

pub fn incoming_payload(filename: &str, total_chunks: u32) -> String {
    format!("{}:{}", filename, total_chunks)
}

pub fn parse_incoming(payload: &str) -> Option<(String, u32)> {
    let (filename, total) = payload.rsplit_once(':')?;
    if filename.is_empty() {
        return None;
    }
    Some((filename.to_string(), total.parse().ok()?))
}

pub fn done_payload(filename: &str, sha256_hex: &str) -> String {
    format!("{}:{}", filename, sha256_hex)
}

pub fn parse_done(payload: &str) -> Option<(String, String)> {
    let (filename, digest) = payload.rsplit_once(':')?;
    if filename.is_empty() || digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some((filename.to_string(), digest.to_ascii_lowercase()))
}

/// Number of chunks a file of `len` bytes occupies. Empty files have none.
pub fn chunks_for(len: usize, chunk_size: usize) -> u32 {
    len.div_ceil(chunk_size.max(1)) as u32
}
