//! The session-0 control protocol: PING/PONG/RESET/LISTEN/CONNECT/PUNCH/KEEPALIVE
//! messages carried as cleartext packets whose first 4 bytes are all zero, as opposed to
//! a nonzero KCP conversation id.

use crate::addr::AddrRecord;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Write};
use std::net::SocketAddr;

pub const HEADER_SIZE: usize = 4 + 2; // zero:u32=0 | what:u16-be

pub const S0_PING: u16 = 0;
pub const S0_PONG: u16 = 1;
pub const S0_RESET: u16 = 2;
pub const S0_LISTEN: u16 = 3;
pub const S0_CONNECT: u16 = 4;
pub const S0_PUNCH: u16 = 5;
pub const S0_KEEPALIVE: u16 = 6;

/// A decoded session-0 message. Lifetimes borrow straight from the opened UDP payload;
/// nothing here allocates.
#[derive(Debug)]
pub enum Message {
    Ping { tstamp: u32 },
    Pong { tstamp: u32 },
    Keepalive { tstamp: u32 },
    Reset { conv: u32 },
    Listen { addr: AddrRecord },
    Connect { addr: AddrRecord },
    Punch { a: AddrRecord, b: AddrRecord },
}

#[derive(Debug)]
pub enum Session0Error {
    Truncated,
    Unknown(u16),
}

impl std::fmt::Display for Session0Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Session0Error::Truncated => write!(f, "truncated session-0 message"),
            Session0Error::Unknown(w) => write!(f, "unknown session-0 message code {}", w),
        }
    }
}

/// Returns true if the cleartext packet's first 4 bytes are the all-zero session-0
/// discriminator.
pub fn is_session0(buf: &[u8]) -> bool {
    buf.len() >= 4 && buf[..4] == [0, 0, 0, 0]
}

pub fn parse(buf: &[u8]) -> Result<Message, Session0Error> {
    if buf.len() < HEADER_SIZE {
        return Err(Session0Error::Truncated);
    }
    let mut head = &buf[..4];
    let zero = head.read_u32::<BigEndian>().unwrap();
    debug_assert_eq!(zero, 0);
    let what = (&buf[4..6]).read_u16::<BigEndian>().map_err(|_| Session0Error::Truncated)?;
    let body = &buf[HEADER_SIZE..];

    match what {
        S0_PING | S0_PONG | S0_KEEPALIVE => {
            if body.len() < 4 {
                return Err(Session0Error::Truncated);
            }
            let tstamp = (&body[..4]).read_u32::<BigEndian>().unwrap();
            Ok(match what {
                S0_PING => Message::Ping { tstamp },
                S0_PONG => Message::Pong { tstamp },
                _ => Message::Keepalive { tstamp },
            })
        }
        S0_RESET => {
            if body.len() < 4 {
                return Err(Session0Error::Truncated);
            }
            let conv = (&body[..4]).read_u32::<BigEndian>().unwrap();
            Ok(Message::Reset { conv })
        }
        S0_LISTEN => {
            let addr = AddrRecord::read_from(&mut &body[..]).map_err(|_| Session0Error::Truncated)?;
            Ok(Message::Listen { addr })
        }
        S0_CONNECT => {
            let addr = AddrRecord::read_from(&mut &body[..]).map_err(|_| Session0Error::Truncated)?;
            Ok(Message::Connect { addr })
        }
        S0_PUNCH => {
            let mut cursor = &body[..];
            let a = AddrRecord::read_from(&mut cursor).map_err(|_| Session0Error::Truncated)?;
            let b = AddrRecord::read_from(&mut cursor).map_err(|_| Session0Error::Truncated)?;
            Ok(Message::Punch { a, b })
        }
        other => Err(Session0Error::Unknown(other)),
    }
}

fn write_header<W: Write>(w: &mut W, what: u16) -> io::Result<()> {
    w.write_u32::<BigEndian>(0)?;
    w.write_u16::<BigEndian>(what)
}

impl Message {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Message::Ping { tstamp } => {
                write_header(w, S0_PING)?;
                w.write_u32::<BigEndian>(*tstamp)
            }
            Message::Pong { tstamp } => {
                write_header(w, S0_PONG)?;
                w.write_u32::<BigEndian>(*tstamp)
            }
            Message::Keepalive { tstamp } => {
                write_header(w, S0_KEEPALIVE)?;
                w.write_u32::<BigEndian>(*tstamp)
            }
            Message::Reset { conv } => {
                write_header(w, S0_RESET)?;
                w.write_u32::<BigEndian>(*conv)
            }
            Message::Listen { addr } => {
                write_header(w, S0_LISTEN)?;
                addr.write_to(w)
            }
            Message::Connect { addr } => {
                write_header(w, S0_CONNECT)?;
                addr.write_to(w)
            }
            Message::Punch { a, b } => {
                write_header(w, S0_PUNCH)?;
                a.write_to(w)?;
                b.write_to(w)
            }
        }
    }
}

/// Rendezvous bookkeeping for the server role: a LISTEN registers a listener's public
/// address under a rendezvous token (the listener's declared address is the token, so
/// there's one slot per distinct advertised address); a subsequent CONNECT for the same
/// token triggers two PUNCH messages, one to each peer naming the other.
#[derive(Default)]
pub struct Rendezvous {
    listeners: std::collections::HashMap<SocketAddr, (SocketAddr, AddrRecord)>,
}

impl Rendezvous {
    pub fn new() -> Rendezvous {
        Rendezvous::default()
    }

    /// Registers `from` as listening with public address `addr`.
    pub fn listen(&mut self, from: SocketAddr, addr: AddrRecord) {
        self.listeners.insert(addr.0, (from, addr));
    }

    /// A CONNECT naming `target` arrived from `from`. If a matching listener is on file,
    /// returns the two (peer, punch-message) pairs to send.
    pub fn connect(
        &mut self,
        from: SocketAddr,
        from_addr: AddrRecord,
        target: AddrRecord,
    ) -> Option<[(SocketAddr, Message); 2]> {
        let (listener_peer, listener_addr) = *self.listeners.get(&target.0)?;
        Some([
            (
                listener_peer,
                Message::Punch {
                    a: listener_addr,
                    b: from_addr,
                },
            ),
            (
                from,
                Message::Punch {
                    a: from_addr,
                    b: listener_addr,
                },
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_roundtrips() {
        let msg = Message::Keepalive { tstamp: 123456 };
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        assert!(is_session0(&buf));

        match parse(&buf).unwrap() {
            Message::Keepalive { tstamp } => assert_eq!(tstamp, 123456),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn reset_roundtrips() {
        let msg = Message::Reset { conv: 42 };
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        match parse(&buf).unwrap() {
            Message::Reset { conv } => assert_eq!(conv, 42),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn punch_carries_two_addr_records() {
        let a = AddrRecord("127.0.0.1:1".parse().unwrap());
        let b = AddrRecord("127.0.0.1:2".parse().unwrap());
        let msg = Message::Punch { a, b };
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        match parse(&buf).unwrap() {
            Message::Punch { a: ra, b: rb } => {
                assert_eq!(ra, a);
                assert_eq!(rb, b);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        let mut buf = Vec::new();
        write_header(&mut buf, 0xFFFF).unwrap();
        assert!(matches!(parse(&buf), Err(Session0Error::Unknown(0xFFFF))));
    }

    #[test]
    fn rendezvous_punches_both_peers() {
        let mut rv = Rendezvous::new();
        let listener_peer: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let listener_addr = AddrRecord("203.0.113.1:9000".parse().unwrap());
        rv.listen(listener_peer, listener_addr);

        let client_peer: SocketAddr = "10.0.0.2:9001".parse().unwrap();
        let client_addr = AddrRecord("203.0.113.2:9001".parse().unwrap());

        let punches = rv.connect(client_peer, client_addr, listener_addr).unwrap();
        assert_eq!(punches[0].0, listener_peer);
        assert_eq!(punches[1].0, client_peer);
    }
}
