//! TLV frames carried inside a KCP stream: DIAL/PUSH/EOF/KEEPALIVE messages with a
//! 4-byte `msg | len` header and a variable-length payload for PUSH.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

pub const HEADER_SIZE: usize = 4; // msg:u16-be | len:u16-be

pub const MSG_DIAL: u16 = 0x0000;
pub const MSG_PUSH: u16 = 0x0001;
pub const MSG_EOF: u16 = 0x0002;
pub const MSG_KEEPALIVE: u16 = 0x0003;

/// A decoded TLV frame. `len` in the wire format includes the 4-byte header, so a
/// zero-payload control message carries `len == HEADER_SIZE`.
#[derive(Debug, Eq, PartialEq)]
pub enum Frame<'a> {
    Dial,
    Push(&'a [u8]),
    Eof,
    Keepalive,
}

impl<'a> Frame<'a> {
    fn msg(&self) -> u16 {
        match self {
            Frame::Dial => MSG_DIAL,
            Frame::Push(_) => MSG_PUSH,
            Frame::Eof => MSG_EOF,
            Frame::Keepalive => MSG_KEEPALIVE,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Frame::Push(p) => p,
            _ => &[],
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload().len()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let payload = self.payload();
        let len = (HEADER_SIZE + payload.len()) as u16;
        w.write_u16::<BigEndian>(self.msg())?;
        w.write_u16::<BigEndian>(len)?;
        w.write_all(payload)
    }
}

/// Error raised for a malformed or unrecognized TLV. Any of these MUST reset the owning
/// session -- never merely drop the frame, since KCP's stream framing would be left
/// desynchronized.
#[derive(Debug)]
pub enum TlvError {
    Truncated,
    BadLength { declared: u16, header: usize },
    UnknownMessage(u16),
    TooLarge { declared: usize, max: usize },
}

impl std::fmt::Display for TlvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlvError::Truncated => write!(f, "truncated tlv header"),
            TlvError::BadLength { declared, header } => {
                write!(f, "declared len {} smaller than header {}", declared, header)
            }
            TlvError::UnknownMessage(m) => write!(f, "unknown tlv message code 0x{:04x}", m),
            TlvError::TooLarge { declared, max } => {
                write!(f, "tlv payload {} exceeds session buffer {}", declared, max)
            }
        }
    }
}

/// Attempts to parse one frame from the head of `buf`. Returns `Ok(None)` when fewer than
/// a full frame's worth of bytes are buffered yet (the caller should wait for more KCP
/// `recv` output), `Ok(Some((frame, consumed)))` on success, or `Err` on a protocol
/// violation that must reset the session. `max_payload` is `SESSION_BUF_SIZE`, the per-
/// direction buffer a session keeps for reassembling TLVs out of KCP's stream output.
pub fn parse<'a>(
    buf: &'a [u8],
    max_payload: usize,
) -> Result<Option<(Frame<'a>, usize)>, TlvError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let mut header = &buf[..HEADER_SIZE];
    let msg = header.read_u16::<BigEndian>().map_err(|_| TlvError::Truncated)?;
    let len = header.read_u16::<BigEndian>().map_err(|_| TlvError::Truncated)? as usize;

    if len < HEADER_SIZE {
        return Err(TlvError::BadLength {
            declared: len as u16,
            header: HEADER_SIZE,
        });
    }
    if len > max_payload {
        return Err(TlvError::TooLarge {
            declared: len,
            max: max_payload,
        });
    }
    if buf.len() < len {
        return Ok(None);
    }

    let payload = &buf[HEADER_SIZE..len];
    let frame = match msg {
        MSG_DIAL => Frame::Dial,
        MSG_PUSH => Frame::Push(payload),
        MSG_EOF => Frame::Eof,
        MSG_KEEPALIVE => Frame::Keepalive,
        other => return Err(TlvError::UnknownMessage(other)),
    };
    Ok(Some((frame, len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_push_with_payload() {
        let frame = Frame::Push(b"hello\n");
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();

        let (decoded, consumed) = parse(&buf, 16384).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        match decoded {
            Frame::Push(p) => assert_eq!(p, b"hello\n"),
            _ => panic!("expected push"),
        }
    }

    #[test]
    fn zero_payload_control_message_is_valid() {
        let frame = Frame::Keepalive;
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let (decoded, consumed) = parse(&buf, 16384).unwrap().unwrap();
        assert_eq!(consumed, HEADER_SIZE);
        assert_eq!(decoded, Frame::Keepalive);
    }

    #[test]
    fn partial_buffer_waits_for_more() {
        let frame = Frame::Push(b"abcdef");
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();
        let partial = &buf[..buf.len() - 2];
        assert!(parse(partial, 16384).unwrap().is_none());
    }

    #[test]
    fn oversized_payload_must_reset() {
        let frame = Frame::Push(&[0u8; 100]);
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();
        assert!(matches!(
            parse(&buf, 50),
            Err(TlvError::TooLarge { .. })
        ));
    }

    #[test]
    fn unknown_message_must_reset() {
        let mut buf = Vec::new();
        buf.write_u16::<BigEndian>(0x00FF).unwrap();
        buf.write_u16::<BigEndian>(HEADER_SIZE as u16).unwrap();
        assert!(matches!(
            parse(&buf, 16384),
            Err(TlvError::UnknownMessage(0x00FF))
        ));
    }
}
