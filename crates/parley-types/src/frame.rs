use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use uuid::Uuid;

use crate::codec;
use crate::error::FrameError;

/// Server-assigned identity of a connected peer. `0` is reserved for the server.
pub type ClientId = u32;

/// Address used by the server for system-originated frames.
pub const SYSTEM_ID: ClientId = 0;

/// Payload of the WAIT frame sent while fewer than two peers are connected.
pub const WAIT_REASON: &str = "Waiting for another client...";

/// Payload of the START frame sent once the peer minimum is reached.
pub const START_MESSAGE: &str = "You may begin";

/// Payload of the ALERT a sender receives when its chat is blocked locally.
pub const CONTENT_ALERT: &str = "Inappropriate language detected";

/// Peer-kind tag closing every LIST payload.
pub const LIST_TAG: &str = "Client";

/// Frame category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    System,
    Chat,
    File,
    Ack,
    Alert,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Chat => "chat",
            Self::File => "file",
            Self::Ack => "ack",
            Self::Alert => "alert",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameType {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "chat" => Ok(Self::Chat),
            "file" => Ok(Self::File),
            "ack" => Ok(Self::Ack),
            "alert" => Ok(Self::Alert),
            other => Err(FrameError::UnknownType(other.to_string())),
        }
    }
}

/// Frame status word, the last field on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ready,
    Start,
    Wait,
    List,
    Alert,
    Ack,
    Incoming,
    Chunk,
    Done,
    /// Carries the newly assigned client id.
    IdAssign,
    /// Receiver asks the sender to retransmit one chunk.
    Retry,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Start => "START",
            Self::Wait => "WAIT",
            Self::List => "LIST",
            Self::Alert => "ALERT",
            Self::Ack => "ACK",
            Self::Incoming => "INCOMING",
            Self::Chunk => "CHUNK",
            Self::Done => "DONE",
            Self::IdAssign => "ID_ASSIGN",
            Self::Retry => "RETRY",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READY" => Ok(Self::Ready),
            "START" => Ok(Self::Start),
            "WAIT" => Ok(Self::Wait),
            "LIST" => Ok(Self::List),
            "ALERT" => Ok(Self::Alert),
            "ACK" => Ok(Self::Ack),
            "INCOMING" => Ok(Self::Incoming),
            "CHUNK" => Ok(Self::Chunk),
            "DONE" => Ok(Self::Done),
            "ID_ASSIGN" => Ok(Self::IdAssign),
            "RETRY" => Ok(Self::Retry),
            other => Err(FrameError::UnknownStatus(other.to_string())),
        }
    }
}

/// One addressed, typed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: String,
    pub kind: FrameType,
    pub src: ClientId,
    pub dst: ClientId,
    pub payload: Bytes,
    pub status: Status,
}

impl Frame {
    pub fn new(
        id: impl Into<String>,
        kind: FrameType,
        src: ClientId,
        dst: ClientId,
        payload: impl Into<Bytes>,
        status: Status,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            src,
            dst,
            payload: payload.into(),
            status,
        }
    }

    /// A server-originated frame with a fresh id.
    pub fn system(dst: ClientId, status: Status, payload: impl Into<Bytes>) -> Self {
        Self::new(new_frame_id(), FrameType::System, SYSTEM_ID, dst, payload, status)
    }

    pub fn id_assign(dst: ClientId) -> Self {
        Self::system(dst, Status::IdAssign, dst.to_string())
    }

    pub fn wait(dst: ClientId) -> Self {
        Self::system(dst, Status::Wait, WAIT_REASON)
    }

    pub fn start(dst: ClientId) -> Self {
        Self::system(dst, Status::Start, START_MESSAGE)
    }

    /// LIST frame enumerating `peers` in the order given.
    pub fn list(dst: ClientId, peers: &[ClientId]) -> Self {
        let mut payload = String::new();
        for id in peers {
            payload.push_str(&id.to_string());
            payload.push(',');
        }
        payload.push_str(LIST_TAG);
        Self::system(dst, Status::List, payload)
    }

    pub fn alert(dst: ClientId, reason: impl Into<String>) -> Self {
        Self::system(dst, Status::Alert, reason.into())
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Peer ids carried by a LIST payload. Non-numeric tokens are skipped.
    pub fn list_peers(&self) -> Vec<ClientId> {
        self.payload_str()
            .split(',')
            .filter_map(|token| token.trim().parse().ok())
            .collect()
    }
}

/// Renders the wire form without the trailing newline.
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&codec::encode(self)))
    }
}

/// Fresh 12-hex-char frame or transfer id.
pub fn new_frame_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}
