//! Wire codec for the middle/judge protocol.
//!
//! Every message on a session connection is one frame:
//! a single ASCII tag byte (command from us, status from the peer),
//! a 7-character decimal length field whose digits are written in
//! **reverse** order and zero-padded to width 7, then exactly `length`
//! bytes of UTF-8 body. A 5-byte body produces the length field
//! `"5000000"`, not `"0000005"`.

use bytes::BytesMut;

/// Tag byte plus the 7-character length field.
pub const HEADER_LEN: usize = 8;

/// Largest body the 7-digit length field can carry.
pub const MAX_BODY_LEN: usize = 9_999_999;

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command byte (client to server) or status byte (server to client).
    pub tag: u8,
    /// UTF-8 payload; empty bodies are common.
    pub body: String,
}

/// Framing errors.
///
/// `BadLength` is fatal for the connection that produced it: the stream
/// offset is unrecoverable, so the connection must be torn down and
/// reconnected rather than resynchronized by guesswork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Length field did not contain a parseable digit sequence.
    BadLength(String),
    /// Body exceeds what the 7-digit length field can describe.
    BodyTooLarge(usize),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::BadLength(field) => {
                write!(f, "Malformed frame length field: {:?}", field)
            }
            FrameError::BodyTooLarge(len) => {
                write!(f, "Frame body too large: {} bytes", len)
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Encode one frame.
///
/// The body is the UTF-8 encoding of `data`; an empty string frames as a
/// header-only message.
pub fn encode(tag: u8, data: &str) -> Result<Vec<u8>, FrameError> {
    let body = data.as_bytes();
    if body.len() > MAX_BODY_LEN {
        return Err(FrameError::BodyTooLarge(body.len()));
    }

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(tag);
    let field: Vec<u8> = format!("{:07}", body.len()).bytes().rev().collect();
    out.extend_from_slice(&field);
    out.extend_from_slice(body);
    Ok(out)
}

/// Decode the next frame out of `buf`, if one is fully buffered.
///
/// Returns `Ok(None)` without consuming anything when the buffer holds
/// less than a complete frame; callers read more bytes and retry. On
/// success the frame's `HEADER_LEN + length` bytes are consumed. Call in
/// a loop: concatenated frames may arrive in one read.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let tag = buf[0];
    let length = parse_length(&buf[1..HEADER_LEN])?;
    if buf.len() < HEADER_LEN + length {
        return Ok(None);
    }

    let raw = buf.split_to(HEADER_LEN + length);
    let body = String::from_utf8_lossy(&raw[HEADER_LEN..]).into_owned();
    Ok(Some(Frame { tag, body }))
}

/// Parse the reversed length field.
///
/// Trailing non-digit bytes are stripped (tolerance for peers that pad
/// the field), the remainder is reversed and parsed as decimal. Anything
/// still non-numeric after stripping is a fatal framing error.
fn parse_length(field: &[u8]) -> Result<usize, FrameError> {
    let mut digits = field;
    while let Some((last, rest)) = digits.split_last() {
        if last.is_ascii_digit() {
            break;
        }
        digits = rest;
    }

    let reversed: String = digits.iter().rev().map(|&b| b as char).collect();
    reversed
        .parse::<usize>()
        .map_err(|_| FrameError::BadLength(String::from_utf8_lossy(field).into_owned()))
}
