//! Peer Exchange (BEP-11)
//!
//! A PEX volley lists peers the sender connected to (`added`) and dropped
//! since its previous volley, in compact form. The same volley structure is
//! carried by both extension dialects.

use crate::bencode::{decode, encode, BencodeError, Value};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PexPeer {
    pub addr: SocketAddr,
    pub flags: PexFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PexFlags {
    pub encryption: bool,
    pub seed: bool,
    pub utp: bool,
    pub holepunch: bool,
    pub connectable: bool,
}

impl PexFlags {
    const ENCRYPTION: u8 = 0x01;
    const SEED: u8 = 0x02;
    const UTP: u8 = 0x04;
    const HOLEPUNCH: u8 = 0x08;
    const CONNECTABLE: u8 = 0x10;

    pub fn from_byte(b: u8) -> Self {
        Self {
            encryption: b & Self::ENCRYPTION != 0,
            seed: b & Self::SEED != 0,
            utp: b & Self::UTP != 0,
            holepunch: b & Self::HOLEPUNCH != 0,
            connectable: b & Self::CONNECTABLE != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        [
            (self.encryption, Self::ENCRYPTION),
            (self.seed, Self::SEED),
            (self.utp, Self::UTP),
            (self.holepunch, Self::HOLEPUNCH),
            (self.connectable, Self::CONNECTABLE),
        ]
        .iter()
        .filter(|(on, _)| *on)
        .fold(0, |acc, (_, bit)| acc | bit)
    }
}

/// One PEX volley.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<PexPeer>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&mut self, addr: SocketAddr, flags: PexFlags) {
        self.added.push(PexPeer { addr, flags });
    }

    pub fn drop_peer(&mut self, addr: SocketAddr) {
        self.dropped.push(addr);
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty()
    }

    /// Whether either list is longer than `cap`. Oversized volleys are
    /// dropped as a whole, never truncated.
    pub fn exceeds(&self, cap: usize) -> bool {
        self.added.len() > cap || self.dropped.len() > cap
    }

    /// The bencoded `ut_pex` dictionary.
    pub fn encode(&self) -> Result<Bytes, BencodeError> {
        Ok(Bytes::from(encode(&self.to_value())?))
    }

    pub fn decode(data: &[u8]) -> Result<Self, BencodeError> {
        Ok(Self::from_value(&decode(data)?))
    }

    pub(crate) fn to_value(&self) -> Value {
        let added4 = self.added.iter().filter(|p| p.addr.is_ipv4());
        let added6 = self.added.iter().filter(|p| p.addr.is_ipv6());

        let mut dict = Value::dict();
        dict.insert("added", compact(added4.clone().map(|p| &p.addr)));
        dict.insert("added.f", flags(added4));
        dict.insert("added6", compact(added6.clone().map(|p| &p.addr)));
        dict.insert("added6.f", flags(added6));
        dict.insert("dropped", compact(self.dropped.iter().filter(|a| a.is_ipv4())));
        dict.insert("dropped6", compact(self.dropped.iter().filter(|a| a.is_ipv6())));
        dict
    }

    /// Reads a volley from a dictionary; absent or malformed lists are empty.
    pub(crate) fn from_value(value: &Value) -> Self {
        let field = |key: &[u8]| {
            value
                .get(key)
                .and_then(Value::as_bytes)
                .cloned()
                .unwrap_or_default()
        };

        let mut msg = Self::new();
        for (addrs, flag_key, width) in [
            (field(b"added"), b"added.f".as_slice(), 6),
            (field(b"added6"), b"added6.f".as_slice(), 18),
        ] {
            let flags = field(flag_key);
            for (i, addr) in parse_compact(&addrs, width).into_iter().enumerate() {
                let f = flags.get(i).copied().map(PexFlags::from_byte).unwrap_or_default();
                msg.add_peer(addr, f);
            }
        }
        msg.dropped.extend(parse_compact(&field(b"dropped"), 6));
        msg.dropped.extend(parse_compact(&field(b"dropped6"), 18));
        msg
    }
}

fn compact<'a>(addrs: impl Iterator<Item = &'a SocketAddr>) -> Value {
    let mut buf = BytesMut::new();
    for addr in addrs {
        match addr.ip() {
            IpAddr::V4(ip) => buf.put_slice(&ip.octets()),
            IpAddr::V6(ip) => buf.put_slice(&ip.octets()),
        }
        buf.put_u16(addr.port());
    }
    Value::Bytes(buf.freeze())
}

fn flags<'a>(peers: impl Iterator<Item = &'a PexPeer>) -> Value {
    Value::Bytes(peers.map(|p| p.flags.to_byte()).collect::<Vec<_>>().into())
}

fn parse_compact(data: &[u8], width: usize) -> Vec<SocketAddr> {
    data.chunks_exact(width)
        .map(|chunk| {
            let (ip, port) = chunk.split_at(width - 2);
            let ip = match <[u8; 4]>::try_from(ip) {
                Ok(v4) => IpAddr::V4(Ipv4Addr::from(v4)),
                Err(_) => {
                    let mut v6 = [0u8; 16];
                    v6.copy_from_slice(ip);
                    IpAddr::V6(Ipv6Addr::from(v6))
                }
            };
            SocketAddr::new(ip, u16::from_be_bytes([port[0], port[1]]))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pex_flags() {
        let flags = PexFlags {
            encryption: true,
            utp: true,
            connectable: true,
            ..Default::default()
        };
        assert_eq!(flags.to_byte(), 0x15);
        assert_eq!(PexFlags::from_byte(0x15), flags);
    }

    #[test]
    fn test_volley_keeps_families_apart() {
        let mut msg = PexMessage::new();
        msg.add_peer(
            "192.168.1.1:6881".parse().unwrap(),
            PexFlags {
                seed: true,
                ..Default::default()
            },
        );
        msg.add_peer("[2001:db8::7]:51413".parse().unwrap(), PexFlags::default());
        msg.drop_peer("10.0.0.1:80".parse().unwrap());

        let value = msg.to_value();
        assert_eq!(value.get(b"added").and_then(Value::as_bytes).map(|b| b.len()), Some(6));
        assert_eq!(value.get(b"added6").and_then(Value::as_bytes).map(|b| b.len()), Some(18));

        let decoded = PexMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.added[0].flags.seed);
    }

    #[test]
    fn test_trailing_partial_entry_is_ignored() {
        let mut dict = Value::dict();
        dict.insert("added", &[1u8, 2, 3, 4, 0x1a, 0xe1, 9, 9][..]);
        let msg = PexMessage::from_value(&dict);
        assert_eq!(msg.added.len(), 1);
        assert_eq!(msg.added[0].addr, "1.2.3.4:6881".parse().unwrap());
    }

    #[test]
    fn test_exceeds_checks_either_list() {
        let mut msg = PexMessage::new();
        for port in 0..3 {
            msg.drop_peer(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port));
        }
        assert!(msg.exceeds(2));
        assert!(!msg.exceeds(3));
    }
}
