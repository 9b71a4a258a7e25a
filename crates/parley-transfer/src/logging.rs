//! Transfer logging trait for structured lifecycle events.
//!
//! Senders and receivers report through a `TransferLogger` so the proof-point
//! lines stay identical whichever sink is installed.

use std::fmt;

/// Structured log entry for a transfer operation.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub transfer_id: String,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Sender: outbound chat split into frames
    ChatSent { chunks: usize },
    /// Sender: file read and about to be announced
    Preparing {
        filename: String,
        target: u32,
        chunks: u32,
    },
    /// Sender: chunk deliberately not transmitted (loss simulation)
    ChunkDropped { seq: u32 },
    /// Sender: chunk retransmitted after a retry request
    Resent { seq: u32 },
    /// Sender: receiver confirmed the file
    Acknowledged { filename: String },
    /// Receiver: announcement accepted
    Incoming { filename: String, chunks: u32 },
    /// Receiver: retransmission requested
    RetryRequested { seq: u32, attempt: u32 },
    /// Receiver: new chunk accepted
    Progress { filename: String, percent: f64 },
    /// Receiver: file reassembled and written
    Saved { filename: String },
    /// Either side gave up on the transfer
    Failed { filename: String, reason: String },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChatSent { chunks } => write!(f, "Chat message sent in {} chunk(s)", chunks),
            Self::Preparing {
                filename,
                target,
                chunks,
            } => write!(
                f,
                "[FILE] Preparing to send '{}' to {} in {} chunk(s)",
                filename, target, chunks
            ),
            Self::ChunkDropped { seq } => write!(f, "[FILE] Simulated loss of chunk #{}", seq),
            Self::Resent { seq } => write!(f, "[FILE] Resent chunk #{}", seq),
            Self::Acknowledged { filename } => write!(f, "[FILE] '{}' acknowledged", filename),
            Self::Incoming { filename, chunks } => {
                write!(f, "[FILE] Incoming '{}' ({} chunk(s))", filename, chunks)
            }
            Self::RetryRequested { seq, attempt } => write!(
                f,
                "Requested retry for missing chunk #{} (attempt {})",
                seq, attempt
            ),
            Self::Progress { filename, percent } => {
                write!(f, "Receiving '{}': {:.2}%", filename, percent)
            }
            Self::Saved { filename } => write!(f, "File '{}' saved", filename),
            Self::Failed { filename, reason } => {
                write!(f, "[FILE] Transfer of '{}' failed: {}", filename, reason)
            }
        }
    }
}

/// Trait for transfer logging. Implementations can write to tracing, forward
/// to an observer, or discard entries.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        match &entry.event {
            TransferEvent::ChunkDropped { .. } | TransferEvent::Resent { .. } => {
                tracing::debug!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::Failed { .. } => {
                tracing::warn!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::info!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
