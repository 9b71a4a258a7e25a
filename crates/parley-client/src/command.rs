//! Line-oriented command surface.

use parley_types::ClientId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Bare number: select the destination peer.
    Target(ClientId),
    /// `chat <text>`; the whole line is the payload.
    Chat(String),
    /// Send a file from the send directory.
    File(String),
    Ping,
}

impl Command {
    /// Parse one input line. Unrecognised lines yield `None`; anything else
    /// names a file when file transfer is enabled.
    pub fn parse(line: &str, file_enabled: bool) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed == "ping" {
            return Some(Self::Ping);
        }
        if line.starts_with("chat ") {
            return Some(Self::Chat(line.to_string()));
        }
        if trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return trimmed.parse().ok().map(Self::Target);
        }
        if file_enabled {
            return Some(Self::File(trimmed.to_string()));
        }
        None
    }

    /// Chat and file commands need START.
    pub fn is_gated(&self) -> bool {
        matches!(self, Self::Chat(_) | Self::File(_))
    }
}
