//! Local banned-word check applied to outbound chat before it is chunked.

use parley_types::ProtocolError;
use parley_types::frame::CONTENT_ALERT;

pub const DEFAULT_BANNED_WORDS: &[&str] = &["fuck", "shit", "bitch", "bastard", "asshole"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    Blocked { reason: String },
}

/// Case-insensitive substring matcher over a fixed word list.
#[derive(Debug, Clone)]
pub struct ContentFilter {
    words: Vec<String>,
}

impl ContentFilter {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            words: words
                .into_iter()
                .map(|w| w.as_ref().trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
        }
    }

    pub fn inspect(&self, text: &str) -> Verdict {
        let lowered = text.to_lowercase();
        if self.words.iter().any(|w| lowered.contains(w.as_str())) {
            Verdict::Blocked {
                reason: CONTENT_ALERT.to_string(),
            }
        } else {
            Verdict::Clean
        }
    }

    pub fn check(&self, text: &str) -> Result<(), ProtocolError> {
        match self.inspect(text) {
            Verdict::Clean => Ok(()),
            Verdict::Blocked { reason } => Err(ProtocolError::ContentBlocked(reason)),
        }
    }
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self::new(DEFAULT_BANNED_WORDS)
    }
}
