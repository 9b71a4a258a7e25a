use crate::frame::ClientId;

/// Reasons a line fails to parse as a frame. Every variant is a `MalformedFrame`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("expected 6 fields, got {0}")]
    FieldCount(usize),
    #[error("empty frame id")]
    EmptyId,
    #[error("{field} is not a client id: {value:?}")]
    BadAddress { field: &'static str, value: String },
    #[error("unknown frame type {0:?}")]
    UnknownType(String),
    #[error("unknown status {0:?}")]
    UnknownStatus(String),
    #[error("invalid escape sequence at byte {0}")]
    BadEscape(usize),
    #[error("{0} is not valid UTF-8")]
    NotUtf8(&'static str),
}

/// Transport-level failure of the line codec. Tears the connection down.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol-level error taxonomy shared by the gateway and clients.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),
    #[error("unknown target {0}")]
    UnknownTarget(ClientId),
    #[error("chunk #{seq} of '{filename}' still missing after {attempts} retries")]
    ChunkTimeout {
        filename: String,
        seq: u32,
        attempts: u32,
    },
    #[error("interaction blocked until START")]
    CapabilityDenied,
    #[error("content blocked: {0}")]
    ContentBlocked(String),
    #[error("'{filename}' failed integrity check")]
    IntegrityMismatch { filename: String },
}
