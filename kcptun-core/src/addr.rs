//! `SessionKey` and the session-0 address-record wire format.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const ATYP_INET: u8 = 1;
pub const ATYP_INET6: u8 = 4;

/// Lookup key for the session table: family tag, address bytes, port, conversation-id,
/// concatenated. `Hash`/`Eq` are derived so this can key a `hashbrown::HashMap` directly
/// without a custom hasher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    family: u8,
    addr: [u8; 16],
    addr_len: u8,
    port: u16,
    conv: u32,
}

impl SessionKey {
    pub fn new(peer: SocketAddr, conv: u32) -> SessionKey {
        let (family, addr, addr_len) = match peer.ip() {
            IpAddr::V4(v4) => {
                let mut buf = [0u8; 16];
                buf[..4].copy_from_slice(&v4.octets());
                (ATYP_INET, buf, 4)
            }
            IpAddr::V6(v6) => (ATYP_INET6, v6.octets(), 16),
        };
        SessionKey {
            family,
            addr,
            addr_len,
            port: peer.port(),
            conv,
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }
}

/// A `family | addr | port` address record as carried by session-0 LISTEN/CONNECT/PUNCH
/// messages. Round-trips to/from `SocketAddr` for use at the UDP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrRecord(pub SocketAddr);

impl AddrRecord {
    pub fn encoded_len(&self) -> usize {
        match self.0 {
            SocketAddr::V4(_) => 1 + 4 + 2,
            SocketAddr::V6(_) => 1 + 16 + 2,
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self.0 {
            SocketAddr::V4(v4) => {
                w.write_u8(ATYP_INET)?;
                w.write_all(&v4.ip().octets())?;
                w.write_u16::<BigEndian>(v4.port())?;
            }
            SocketAddr::V6(v6) => {
                w.write_u8(ATYP_INET6)?;
                w.write_all(&v6.ip().octets())?;
                w.write_u16::<BigEndian>(v6.port())?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<AddrRecord> {
        let family = r.read_u8()?;
        let addr = match family {
            ATYP_INET => {
                let mut octets = [0u8; 4];
                r.read_exact(&mut octets)?;
                let port = r.read_u16::<BigEndian>()?;
                SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)
            }
            ATYP_INET6 => {
                let mut octets = [0u8; 16];
                r.read_exact(&mut octets)?;
                let port = r.read_u16::<BigEndian>()?;
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown address family tag {}", other),
                ))
            }
        };
        Ok(AddrRecord(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_record_roundtrips() {
        let addr: SocketAddr = "203.0.113.5:4000".parse().unwrap();
        let rec = AddrRecord(addr);
        let mut buf = Vec::new();
        rec.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), rec.encoded_len());
        let decoded = AddrRecord::read_from(&mut &buf[..]).unwrap();
        assert_eq!(decoded.0, addr);
    }

    #[test]
    fn v6_record_roundtrips() {
        let addr: SocketAddr = "[2001:db8::1]:4000".parse().unwrap();
        let rec = AddrRecord(addr);
        let mut buf = Vec::new();
        rec.write_to(&mut buf).unwrap();
        let decoded = AddrRecord::read_from(&mut &buf[..]).unwrap();
        assert_eq!(decoded.0, addr);
    }

    #[test]
    fn session_keys_distinguish_conv_and_peer() {
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let a = SessionKey::new(peer, 1);
        let b = SessionKey::new(peer, 2);
        assert_ne!(a, b);

        let other_peer: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let c = SessionKey::new(other_peer, 1);
        assert_ne!(a, c);
    }

    #[test]
    fn unknown_family_tag_is_rejected() {
        let buf = [9u8, 0, 0, 0, 0];
        assert!(AddrRecord::read_from(&mut &buf[..]).is_err());
    }
}
