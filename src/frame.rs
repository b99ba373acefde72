//! Framing for the websocket control channel.
//!
//! This layer knows nothing about what a frame carries: it turns a growable byte
//! buffer into discrete [`Frame`]s, and builds the headers for outbound frames.
//! Headers take one of three length classes: a 7-bit length inline, a 16-bit
//! extended length, or a 64-bit extended length, optionally followed by a
//! 4-byte mask key.

use byteorder::{BigEndian, ByteOrder};
use std::{error::Error as StdError, fmt};

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const OPCODE_BITS: u8 = 0x0f;
const LENGTH_BITS: u8 = 0x7f;

/// Length byte indicating a 2-byte extended length follows.
const LENGTH_16: u8 = 126;
/// Length byte indicating an 8-byte extended length follows.
const LENGTH_64: u8 = 127;

/// Largest payload this codec will accept from a peer.
pub const MAX_PAYLOAD_LEN: usize = 64 << 20;

/// Frame type, as stored in the low nibble of the first header byte.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum OpCode {
    /// A later fragment of a fragmented message.
    Continuation = 0x0,
    /// UTF-8 text (JSON payloads).
    Text = 0x1,
    /// Binary data (ETF payloads).
    Binary = 0x2,
    /// Connection close, optionally with a close code.
    Close = 0x8,
    /// Keepalive request.
    Ping = 0x9,
    /// Keepalive response.
    Pong = 0xa,
}

impl OpCode {
    /// Converts the low nibble of a header byte into an opcode.
    #[must_use]
    pub fn from_u8(val: u8) -> Option<Self> {
        use OpCode::*;
        Some(match val {
            0x0 => Continuation,
            0x1 => Text,
            0x2 => Binary,
            0x8 => Close,
            0x9 => Ping,
            0xa => Pong,
            _ => return None,
        })
    }

    /// Returns whether this frame type is a control frame.
    #[must_use]
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// A single unit of the websocket protocol.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    /// Whether this is the final fragment of a message.
    pub fin: bool,
    /// Type of this frame.
    pub opcode: OpCode,
    /// Unmasked payload bytes.
    pub payload: Vec<u8>,
    /// Close code, set only on close frames which carry one.
    pub close_code: Option<u16>,
}

impl Frame {
    /// Returns the human-readable reason attached to a close frame, if any.
    #[must_use]
    pub fn close_reason(&self) -> Option<&str> {
        if self.opcode == OpCode::Close && self.payload.len() > 2 {
            std::str::from_utf8(&self.payload[2..]).ok()
        } else {
            None
        }
    }
}

/// Builds the header for a frame with the given payload length.
///
/// If `mask_key` is set, the mask bit is raised and the key appended; callers
/// are responsible for masking the payload itself (see [`apply_mask`]).
#[must_use]
pub fn encode_header(payload_len: usize, opcode: OpCode, mask_key: Option<[u8; 4]>) -> Vec<u8> {
    let mut header = Vec::with_capacity(14);
    header.push(FIN_BIT | opcode as u8);

    let mask = if mask_key.is_some() { MASK_BIT } else { 0 };

    if payload_len < LENGTH_16 as usize {
        header.push(mask | payload_len as u8);
    } else if payload_len <= u16::MAX as usize {
        header.push(mask | LENGTH_16);
        let mut len = [0u8; 2];
        BigEndian::write_u16(&mut len, payload_len as u16);
        header.extend_from_slice(&len);
    } else {
        header.push(mask | LENGTH_64);
        let mut len = [0u8; 8];
        BigEndian::write_u64(&mut len, payload_len as u64);
        header.extend_from_slice(&len);
    }

    if let Some(key) = mask_key {
        header.extend_from_slice(&key);
    }

    header
}

/// Builds a complete frame, masking the payload if a key is given.
#[must_use]
pub fn encode_frame(opcode: OpCode, payload: &[u8], mask_key: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = encode_header(payload.len(), opcode, mask_key);
    let body_start = out.len();
    out.extend_from_slice(payload);

    if let Some(key) = mask_key {
        apply_mask(&mut out[body_start..], key);
    }

    out
}

/// Builds a close frame carrying `code`.
#[must_use]
pub fn encode_close(code: u16, mask_key: Option<[u8; 4]>) -> Vec<u8> {
    let mut body = [0u8; 2];
    BigEndian::write_u16(&mut body, code);
    encode_frame(OpCode::Close, &body, mask_key)
}

/// XORs `buf` with a repeating 4-byte mask key. Applying twice is the identity.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Attempts to remove one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet hold a full header and payload, in
/// which case no bytes are consumed. Several frames may be queued in one
/// buffer: callers should loop until `Ok(None)`.
///
/// A frame with a reserved opcode is consumed and reported as
/// [`Error::UnknownOpCode`], so the stream stays aligned.
pub fn try_parse_frame(buf: &mut Vec<u8>) -> Result<Option<Frame>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & FIN_BIT != 0;
    let raw_opcode = buf[0] & OPCODE_BITS;
    let masked = buf[1] & MASK_BIT != 0;

    let (len, mut offset) = match buf[1] & LENGTH_BITS {
        LENGTH_16 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(BigEndian::read_u16(&buf[2..4])), 4)
        },
        LENGTH_64 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            (BigEndian::read_u64(&buf[2..10]), 10)
        },
        short => (u64::from(short), 2),
    };

    if len > MAX_PAYLOAD_LEN as u64 {
        return Err(Error::PayloadTooLarge(len));
    }
    let len = len as usize;

    let mask_key = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[offset..offset + 4]);
        offset += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < offset + len {
        return Ok(None);
    }

    let mut payload = buf[offset..offset + len].to_vec();
    buf.drain(..offset + len);

    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    let opcode = OpCode::from_u8(raw_opcode).ok_or(Error::UnknownOpCode(raw_opcode))?;

    let close_code = if opcode == OpCode::Close && payload.len() >= 2 {
        Some(BigEndian::read_u16(&payload[..2]))
    } else {
        None
    };

    Ok(Some(Frame {
        fin,
        opcode,
        payload,
        close_code,
    }))
}

/// Errors encountered while parsing frames.
#[derive(Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// A frame used a reserved opcode. The frame has been skipped.
    UnknownOpCode(u8),
    /// A frame declared a payload larger than [`MAX_PAYLOAD_LEN`].
    ///
    /// The stream cannot be realigned after this.
    PayloadTooLarge(u64),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnknownOpCode(op) => write!(f, "frame used reserved opcode {:#x}", op),
            Error::PayloadTooLarge(len) => write!(f, "frame payload of {} bytes is too large", len),
        }
    }
}

impl StdError for Error {}

/// Convenience type for frame parsing.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn header_and_payload_round_trip_across_length_classes() {
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            for op in [OpCode::Text, OpCode::Binary] {
                let payload = payload_of(len);
                let mut buf = encode_header(len, op, Some([0; 4]));
                buf.extend_from_slice(&payload);

                let frame = try_parse_frame(&mut buf).unwrap().expect("complete frame");
                assert_eq!(frame.opcode, op);
                assert_eq!(frame.payload, payload, "length {}", len);
                assert!(frame.fin);
                assert!(buf.is_empty());
            }
        }
    }

    #[test]
    fn header_length_classes() {
        assert_eq!(encode_header(125, OpCode::Text, None).len(), 2);
        assert_eq!(encode_header(126, OpCode::Text, None).len(), 4);
        assert_eq!(encode_header(65535, OpCode::Text, None).len(), 4);
        assert_eq!(encode_header(65536, OpCode::Text, None).len(), 10);
        assert_eq!(encode_header(0, OpCode::Text, Some([1, 2, 3, 4])).len(), 6);
    }

    #[test]
    fn masked_frames_are_unmasked_on_parse() {
        let payload = b"{\"op\":1,\"d\":null}".to_vec();
        let mut buf = encode_frame(OpCode::Text, &payload, Some([0xde, 0xad, 0xbe, 0xef]));
        assert_ne!(&buf[6..], &payload[..]);

        let frame = try_parse_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn partial_frame_consumes_nothing() {
        let payload = payload_of(300);
        let full = encode_frame(OpCode::Binary, &payload, None);
        let (head, tail) = full.split_at(10);

        let mut buf = head.to_vec();
        assert_eq!(try_parse_frame(&mut buf), Ok(None));
        assert_eq!(buf, head);

        buf.extend_from_slice(tail);
        let frame = try_parse_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn truncated_extended_length_needs_more_data() {
        let mut buf = vec![0x81, LENGTH_64, 0, 0];
        assert_eq!(try_parse_frame(&mut buf), Ok(None));
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn queued_frames_parse_in_order() {
        let mut buf = encode_frame(OpCode::Text, b"first", None);
        buf.extend(encode_frame(OpCode::Ping, b"p", None));
        buf.extend(encode_frame(OpCode::Text, b"second", None));

        let mut seen = vec![];
        while let Some(frame) = try_parse_frame(&mut buf).unwrap() {
            seen.push((frame.opcode, frame.payload));
        }

        assert_eq!(
            seen,
            vec![
                (OpCode::Text, b"first".to_vec()),
                (OpCode::Ping, b"p".to_vec()),
                (OpCode::Text, b"second".to_vec()),
            ]
        );
    }

    #[test]
    fn close_frames_carry_code() {
        let mut buf = encode_close(4009, None);
        let frame = try_parse_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
        assert_eq!(frame.close_code, Some(4009));
    }

    #[test]
    fn reserved_opcode_is_skipped() {
        let mut buf = vec![0x83, 0x01, 0xff];
        buf.extend(encode_frame(OpCode::Text, b"ok", None));

        assert_eq!(try_parse_frame(&mut buf), Err(Error::UnknownOpCode(0x3)));
        let frame = try_parse_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, b"ok");
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = vec![0x82, LENGTH_64];
        buf.extend_from_slice(&u64::MAX.to_be_bytes());
        assert_eq!(
            try_parse_frame(&mut buf),
            Err(Error::PayloadTooLarge(u64::MAX))
        );
    }
}
