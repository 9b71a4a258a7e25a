//! Pipe-delimited line format.
//!
//! ```text
//! <frameId>|<type>|<src>|<dst>|<payload>|<status>\n
//! ```
//!
//! `id` and `payload` are escaped so they can carry the delimiter, newlines
//! and arbitrary bytes: `\` -> `\\`, `|` -> `\|`, LF -> `\n`, CR -> `\r`.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{CodecError, FrameError};
use crate::frame::{ClientId, Frame, FrameType, Status};

pub const DELIMITER: u8 = b'|';
pub const TERMINATOR: u8 = b'\n';
const ESCAPE: u8 = b'\\';
const FIELD_COUNT: usize = 6;

/// Default upper bound on one encoded line.
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

/// Encode a frame without the line terminator.
pub fn encode(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(frame.id.len() + frame.payload.len() + 32);
    write_frame(frame, &mut buf);
    buf.freeze()
}

fn write_frame(frame: &Frame, buf: &mut BytesMut) {
    escape_into(frame.id.as_bytes(), buf);
    buf.put_u8(DELIMITER);
    buf.put_slice(frame.kind.as_str().as_bytes());
    buf.put_u8(DELIMITER);
    buf.put_slice(frame.src.to_string().as_bytes());
    buf.put_u8(DELIMITER);
    buf.put_slice(frame.dst.to_string().as_bytes());
    buf.put_u8(DELIMITER);
    escape_into(&frame.payload, buf);
    buf.put_u8(DELIMITER);
    buf.put_slice(frame.status.as_str().as_bytes());
}

fn escape_into(raw: &[u8], buf: &mut BytesMut) {
    for &b in raw {
        match b {
            ESCAPE => buf.put_slice(b"\\\\"),
            DELIMITER => buf.put_slice(b"\\|"),
            TERMINATOR => buf.put_slice(b"\\n"),
            b'\r' => buf.put_slice(b"\\r"),
            other => buf.put_u8(other),
        }
    }
}

/// Parse one line (terminator optional) into a frame.
pub fn decode(line: &[u8]) -> Result<Frame, FrameError> {
    let line = line.strip_suffix(&[TERMINATOR]).unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    let fields = split_fields(line)?;
    if fields.len() != FIELD_COUNT {
        return Err(FrameError::FieldCount(fields.len()));
    }
    let mut fields = fields.into_iter();
    // Length checked above.
    let mut next = || fields.next().unwrap_or_default();

    let id = String::from_utf8(next()).map_err(|_| FrameError::NotUtf8("id"))?;
    if id.is_empty() {
        return Err(FrameError::EmptyId);
    }
    let kind = text_field(next(), "type")?.parse::<FrameType>()?;
    let src = address(next(), "src")?;
    let dst = address(next(), "dst")?;
    let payload = Bytes::from(next());
    let status = text_field(next(), "status")?.parse::<Status>()?;

    Ok(Frame {
        id,
        kind,
        src,
        dst,
        payload,
        status,
    })
}

/// Split on unescaped delimiters, unescaping each field.
fn split_fields(line: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
    let mut fields = Vec::with_capacity(FIELD_COUNT);
    let mut current = Vec::new();
    let mut i = 0;
    while i < line.len() {
        match line[i] {
            ESCAPE => {
                let decoded = match line.get(i + 1) {
                    Some(&ESCAPE) => ESCAPE,
                    Some(&DELIMITER) => DELIMITER,
                    Some(b'n') => TERMINATOR,
                    Some(b'r') => b'\r',
                    _ => return Err(FrameError::BadEscape(i)),
                };
                current.push(decoded);
                i += 2;
            }
            DELIMITER => {
                fields.push(std::mem::take(&mut current));
                i += 1;
            }
            other => {
                current.push(other);
                i += 1;
            }
        }
    }
    fields.push(current);
    Ok(fields)
}

fn text_field(raw: Vec<u8>, field: &'static str) -> Result<String, FrameError> {
    String::from_utf8(raw).map_err(|_| FrameError::NotUtf8(field))
}

fn address(raw: Vec<u8>, field: &'static str) -> Result<ClientId, FrameError> {
    let text = String::from_utf8_lossy(&raw);
    // `u32::from_str` accepts a leading '+', which is not a valid address.
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FrameError::BadAddress {
            field,
            value: text.into_owned(),
        });
    }
    text.parse().map_err(|_| FrameError::BadAddress {
        field,
        value: text.into_owned(),
    })
}

/// Newline-delimited frame codec for `tokio_util::codec::Framed`.
///
/// A line that fails to parse is yielded as `Some(Err(..))` so the stream
/// keeps going; only I/O failures and over-long lines end it.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_line: usize,
    /// Bytes already scanned for a terminator.
    scanned: usize,
}

impl FrameCodec {
    pub fn new(max_line: usize) -> Self {
        Self {
            max_line,
            scanned: 0,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE)
    }
}

impl Decoder for FrameCodec {
    type Item = Result<Frame, FrameError>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let start = self.scanned.min(src.len());
            let Some(offset) = src[start..].iter().position(|b| *b == TERMINATOR) else {
                if src.len() > self.max_line {
                    return Err(CodecError::LineTooLong { max: self.max_line });
                }
                self.scanned = src.len();
                return Ok(None);
            };

            if start + offset > self.max_line {
                return Err(CodecError::LineTooLong { max: self.max_line });
            }
            let line = src.split_to(start + offset + 1);
            self.scanned = 0;
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            return Ok(Some(decode(&line)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        self.scanned = 0;
        if src.iter().all(|b| b.is_ascii_whitespace()) {
            src.clear();
            return Ok(None);
        }
        let line = src.split();
        Ok(Some(decode(&line)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(&frame, dst);
        dst.put_u8(TERMINATOR);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(payload: &'static [u8]) -> Frame {
        Frame::new("a1b2c3_0_1", FrameType::Chat, 4, 9, Bytes::from_static(payload), Status::Ready)
    }

    #[test]
    fn encodes_fixed_field_order() {
        let frame = Frame::new("f1", FrameType::File, 2, 3, "notes.txt:4", Status::Incoming);
        assert_eq!(&encode(&frame)[..], b"f1|file|2|3|notes.txt:4|INCOMING");
    }

    #[test]
    fn payload_with_delimiters_survives() {
        let frame = chat(b"a|b\\c\nd\re|");
        let wire = encode(&frame);
        assert!(!wire.contains(&TERMINATOR));
        assert_eq!(decode(&wire).unwrap(), frame);
    }

    #[test]
    fn binary_payload_survives() {
        let bytes: Vec<u8> = (0..=255u8).collect();
        let frame = Frame::new("bin", FrameType::File, 1, 2, bytes, Status::Chunk);
        assert_eq!(decode(&encode(&frame)).unwrap(), frame);
    }

    #[test]
    fn empty_payload_survives() {
        let frame = chat(b"");
        assert_eq!(decode(&encode(&frame)).unwrap(), frame);
    }

    #[test]
    fn accepts_trailing_newline_and_crlf() {
        let frame = decode(b"x|system|0|5|You may begin|START\r\n").unwrap();
        assert_eq!(frame.status, Status::Start);
        assert_eq!(frame.dst, 5);
        assert_eq!(frame.payload_str(), "You may begin");
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert_eq!(decode(b"x|chat|1|2|hi"), Err(FrameError::FieldCount(5)));
        assert_eq!(decode(b"x|chat|1|2|h|i|READY"), Err(FrameError::FieldCount(7)));
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(matches!(
            decode(b"x|chat|-1|2|hi|READY"),
            Err(FrameError::BadAddress { field: "src", .. })
        ));
        assert!(matches!(
            decode(b"x|chat|1|two|hi|READY"),
            Err(FrameError::BadAddress { field: "dst", .. })
        ));
        assert!(matches!(
            decode(b"x|chat|+1|2|hi|READY"),
            Err(FrameError::BadAddress { field: "src", .. })
        ));
    }

    #[test]
    fn rejects_unknown_type_status_and_escape() {
        assert!(matches!(decode(b"x|voice|1|2|hi|READY"), Err(FrameError::UnknownType(_))));
        assert!(matches!(decode(b"x|chat|1|2|hi|LATER"), Err(FrameError::UnknownStatus(_))));
        assert_eq!(decode(b"x|chat|1|2|h\\qi|READY"), Err(FrameError::BadEscape(12)));
        assert_eq!(decode(b"|chat|1|2|hi|READY"), Err(FrameError::EmptyId));
    }

    #[test]
    fn codec_yields_malformed_lines_without_failing() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"garbage\n\nok|chat|1|2|hi|READY\npart"[..]);

        assert!(matches!(codec.decode(&mut buf), Ok(Some(Err(FrameError::FieldCount(1))))));
        let frame = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(frame.payload_str(), "hi");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"|system|0|1|x|WAIT\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(frame.id, "part");
        assert_eq!(frame.status, Status::Wait);
    }

    #[test]
    fn codec_enforces_line_limit() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::from(&[b'a'; 32][..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::LineTooLong { max: 16 })));
    }

    #[test]
    fn codec_limits_lines_that_arrive_whole() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::from(&b"x|chat|1|2|exactly|READY
"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::LineTooLong { max: 16 })));

        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::from(&b"x|chat|1|2|hi|OK
"[..]);
        assert!(matches!(codec.decode(&mut buf), Ok(Some(Err(FrameError::UnknownStatus(_))))));
    }

    #[test]
    fn codec_encoder_terminates_lines() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(chat(b"one"), &mut buf).unwrap();
        codec.encode(chat(b"two"), &mut buf).unwrap();
        assert_eq!(buf.iter().filter(|b| **b == TERMINATOR).count(), 2);

        let first = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(first.payload_str(), "one");
        assert_eq!(second.payload_str(), "two");
    }

    #[test]
    fn decode_eof_flushes_unterminated_line() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"z|ack|2|1|a.txt|ACK"[..]);
        let frame = codec.decode_eof(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(frame.status, Status::Ack);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }
}
