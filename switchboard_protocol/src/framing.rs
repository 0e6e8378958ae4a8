// Pluggable framing contract and the default length-delimited policy.
//
// A `FramePolicy` answers three questions about the bytes buffered on a
// session, in order:
// 1. `check_type`: can the leading bytes start a frame of this shape at all?
//    `false` means the header is garbled; the caller discards the buffered
//    span to resynchronize.
// 2. `check_length`: has the whole frame (header + declared payload)
//    arrived? Only asked once `check_type` passed.
// 3. `parse`: split off the leading complete frame, reporting exactly how
//    many bytes it occupied on the wire.
// `encode` wraps an outgoing payload so replies use the same shape.
//
// `LengthPrefixed` is the default: a 4-byte big-endian length, then the
// payload. A prefix declaring more than `max_len` bytes cannot be a valid
// header. Fewer than four buffered bytes are never judged garbled, so a header
// that trickles in one byte at a time survives until it is complete.
//
// `LengthPrefixed::write_to` / `read_from` speak the same format over any
// blocking `Write` / `Read`, applying the same `max_len` check as the buffer
// path. `write_message` / `read_message` are those helpers with the default
// limit and are what plain peers (tests, scripts) use.

use std::io::{self, Read, Write};

use crate::message::message_id;

/// Maximum allowed payload size (16 MB). Protects against unbounded allocation
/// from malformed length prefixes.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the `LengthPrefixed` header.
pub const HEADER_LEN: usize = 4;

/// One frame split off the front of a receive buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedFrame {
    /// Bytes the frame occupied on the wire, header included.
    pub consumed: usize,
    /// The frame body.
    pub payload: Vec<u8>,
    /// Application-level identifier extracted from the body, if any.
    pub identifier: Option<String>,
}

/// Classify / length-check / parse contract for one wire format.
pub trait FramePolicy: Send + Sync {
    /// Whether the leading bytes of `buf` can start a frame of this shape.
    fn check_type(&self, buf: &[u8]) -> bool;

    /// Whether `buf` holds at least one complete frame.
    fn check_length(&self, buf: &[u8]) -> bool;

    /// Parse the leading frame of `buf`. Only called after `check_type` and
    /// `check_length` both returned `true`.
    fn parse(&self, buf: &[u8]) -> ParsedFrame;

    /// Wrap `payload` into a complete frame.
    fn encode(&self, payload: &[u8]) -> Vec<u8>;
}

/// 4-byte big-endian length prefix followed by a JSON payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LengthPrefixed {
    max_len: u32,
}

impl LengthPrefixed {
    pub fn new() -> Self {
        Self {
            max_len: MAX_MESSAGE_SIZE,
        }
    }

    /// A policy that treats any declared length above `max_len` as garbled.
    pub fn with_max_len(max_len: u32) -> Self {
        Self { max_len }
    }

    pub fn max_len(&self) -> u32 {
        self.max_len
    }

    fn declared_len(buf: &[u8]) -> Option<usize> {
        let header: [u8; HEADER_LEN] = buf.get(..HEADER_LEN)?.try_into().ok()?;
        Some(u32::from_be_bytes(header) as usize)
    }
}

impl Default for LengthPrefixed {
    fn default() -> Self {
        Self::new()
    }
}

impl FramePolicy for LengthPrefixed {
    fn check_type(&self, buf: &[u8]) -> bool {
        match Self::declared_len(buf) {
            Some(len) => len <= self.max_len as usize,
            None => true,
        }
    }

    fn check_length(&self, buf: &[u8]) -> bool {
        Self::declared_len(buf).is_some_and(|len| buf.len() >= HEADER_LEN + len)
    }

    fn parse(&self, buf: &[u8]) -> ParsedFrame {
        let len = Self::declared_len(buf).unwrap_or(0);
        let end = (HEADER_LEN + len).min(buf.len());
        let payload = buf[HEADER_LEN.min(end)..end].to_vec();
        let identifier = message_id(&payload);
        ParsedFrame {
            consumed: end,
            payload,
            identifier,
        }
    }

    fn encode(&self, payload: &[u8]) -> Vec<u8> {
        #[expect(clippy::cast_possible_truncation)]
        let len_bytes = (payload.len() as u32).to_be_bytes();
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&len_bytes);
        frame.extend_from_slice(payload);
        frame
    }
}

impl LengthPrefixed {
    /// Frame `msg` and write it to `writer`. Payloads above `max_len` are
    /// refused with `InvalidInput` before anything is written.
    pub fn write_to<W: Write>(&self, writer: &mut W, msg: &[u8]) -> io::Result<()> {
        if msg.len() > self.max_len as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload of {} bytes exceeds {}", msg.len(), self.max_len),
            ));
        }
        writer.write_all(&self.encode(msg))?;
        writer.flush()
    }

    /// Read one frame from `reader` and return its payload.
    ///
    /// A header this policy would call garbled yields `InvalidData`; a stream
    /// that ends before the frame is complete yields `UnexpectedEof`.
    pub fn read_from<R: Read>(&self, reader: &mut R) -> io::Result<Vec<u8>> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header)?;
        if !self.check_type(&header) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "declared length {} exceeds {}",
                    u32::from_be_bytes(header),
                    self.max_len
                ),
            ));
        }
        let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
        reader.read_exact(&mut payload)?;
        Ok(payload)
    }
}

/// Write one frame with the default `LengthPrefixed` policy.
pub fn write_message<W: Write>(writer: &mut W, msg: &[u8]) -> io::Result<()> {
    LengthPrefixed::new().write_to(writer, msg)
}

/// Read one frame with the default `LengthPrefixed` policy.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    LengthPrefixed::new().read_from(reader)
}
