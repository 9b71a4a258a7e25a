//! Parley transfer engine: chat chunking and reliable file delivery over the
//! relay.
//!
//! Provides:
//! - Chat splitting and out-of-order reassembly
//! - File announce / chunk / done sequencing with SHA-256 integrity
//! - Per-chunk bitfield tracking on the receiver
//! - Retry requests bounded by a per-chunk ceiling
//! - Keyed retransmission deadlines on a `DelayQueue`

pub mod bitfield;
pub mod chat;
pub mod logging;
pub mod protocol;
pub mod receiver;
pub mod retry;
pub mod sender;

// Re-export key types for convenience.
pub use bitfield::ChunkBitfield;
pub use chat::{ChatReassembler, split_chat};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use protocol::{
    ACK_ALLOWANCE_PER_CHUNK, CHAT_REASSEMBLY_TTL, DEFAULT_FILE_CHUNK, DEFAULT_MAX_FILE_CHUNKS,
    DEFAULT_MAX_PAYLOAD, DEFAULT_RETRY_CEILING, DEFAULT_RETRY_TIMEOUT, TransferSettings, chunk_id, parse_chat_chunk_id, parse_chunk_id,
    parse_done, parse_incoming,
};
pub use receiver::{ChunkOutcome, InboundFile};
pub use retry::{RetryScheduler, TimerKey};
pub use sender::{LossSimulator, OutboundFile, SendState};
