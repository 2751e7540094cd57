//! Vendor extended messaging (the Azureus "AZ" dialect).
//!
//! Every message is identified by a string id plus a one-byte version, and
//! payloads are bencoded dictionaries. The secondary handshake announces the
//! full table of message ids and versions the sender understands.

use super::error::PeerError;
use super::metadata::MetadataMessage;
use super::reconnect::SessionId;
use crate::bencode::{decode, encode, Value};
use crate::pex::PexMessage;
use bytes::Bytes;
use std::net::Ipv6Addr;

pub const AZ_HANDSHAKE: &str = "AZ_HANDSHAKE";
pub const AZ_HAVE: &str = "AZ_HAVE";
pub const AZ_PEER_EXCHANGE: &str = "AZ_PEER_EXCHANGE";
pub const AZ_METADATA: &str = "AZ_METADATA";
pub const AZ_REQUEST_HINT: &str = "AZ_REQUEST_HINT";
pub const AZ_BAD_PIECE: &str = "AZ_BAD_PIECE";
pub const AZ_STAT_REQUEST: &str = "AZ_STAT_REQUEST";
pub const AZ_STAT_REPLY: &str = "AZ_STAT_REPLY";

/// Handshake type announcing a plain or an encrypted transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeType {
    #[default]
    Plain = 0,
    Crypto = 1,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VendorHandshake {
    /// Identity blob; we send our peer id.
    pub identity: Bytes,
    pub session_id: Option<SessionId>,
    /// The session id the sender last saw from us, for reconnects.
    pub reconnect_session_id: Option<SessionId>,
    pub client: String,
    pub version: String,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub udp2_port: u16,
    pub ipv6: Option<Ipv6Addr>,
    pub metadata_size: Option<u32>,
    /// Message ids with the highest version the sender speaks.
    pub messages: Vec<(String, u8)>,
    pub handshake_type: HandshakeType,
}

impl VendorHandshake {
    fn to_value(&self) -> Value {
        let mut dict = Value::dict();
        dict.insert("identity", self.identity.clone());
        if let Some(id) = self.session_id {
            dict.insert("session", id.as_bytes().as_slice());
        }
        if let Some(id) = self.reconnect_session_id {
            dict.insert("reconn", id.as_bytes().as_slice());
        }
        dict.insert("client", self.client.as_str());
        dict.insert("version", self.version.as_str());
        dict.insert("tcp_port", self.tcp_port);
        dict.insert("udp_port", self.udp_port);
        dict.insert("udp2_port", self.udp2_port);
        if let Some(ip) = self.ipv6 {
            dict.insert("ipv6", ip.octets().as_slice());
        }
        if let Some(size) = self.metadata_size {
            dict.insert("mdsize", size);
        }
        let messages = self
            .messages
            .iter()
            .map(|(id, version)| {
                let mut entry = Value::dict();
                entry.insert("id", id.as_str());
                entry.insert("ver", *version);
                entry
            })
            .collect::<Vec<_>>();
        dict.insert("messages", messages);
        dict.insert("type", self.handshake_type as u8);
        dict
    }

    fn from_value(value: &Value) -> Result<Self, PeerError> {
        let text = |key: &[u8]| value.get(key).and_then(Value::as_str).unwrap_or("").to_string();
        let port = |key: &[u8]| {
            value
                .get(key)
                .and_then(Value::as_integer)
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(0)
        };
        let session = |key: &[u8]| {
            value
                .get(key)
                .and_then(Value::as_bytes)
                .and_then(|b| SessionId::from_slice(b))
        };

        let identity = value
            .get(b"identity")
            .and_then(Value::as_bytes)
            .cloned()
            .ok_or_else(|| PeerError::Extension("vendor handshake without identity".into()))?;

        let mut messages = Vec::new();
        for entry in value.get(b"messages").and_then(Value::as_list).unwrap_or(&[]) {
            let id = entry.get(b"id").and_then(Value::as_str);
            let ver = entry
                .get(b"ver")
                .and_then(Value::as_integer)
                .and_then(|v| u8::try_from(v).ok());
            match (id, ver) {
                (Some(id), Some(ver)) => messages.push((id.to_string(), ver)),
                _ => return Err(PeerError::Extension("malformed vendor message table".into())),
            }
        }

        Ok(Self {
            identity,
            session_id: session(b"session"),
            reconnect_session_id: session(b"reconn"),
            client: text(b"client"),
            version: text(b"version"),
            tcp_port: port(b"tcp_port"),
            udp_port: port(b"udp_port"),
            udp2_port: port(b"udp2_port"),
            ipv6: value
                .get(b"ipv6")
                .and_then(Value::as_bytes)
                .and_then(|b| <[u8; 16]>::try_from(b.as_ref()).ok())
                .map(Ipv6Addr::from),
            metadata_size: value.get(b"mdsize").and_then(Value::as_u32),
            messages,
            handshake_type: match value.get(b"type").and_then(Value::as_integer) {
                Some(1) => HandshakeType::Crypto,
                _ => HandshakeType::Plain,
            },
        })
    }
}

/// Out-of-band hint that a block is worth requesting soon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHint {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
    pub life_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorMessage {
    Handshake(VendorHandshake),
    /// Several haves in one message.
    Have(Vec<u32>),
    Pex { info_hash: [u8; 20], volley: PexMessage },
    Metadata(MetadataMessage),
    RequestHint(RequestHint),
    BadPiece(u32),
    StatsRequest(Value),
    StatsReply(Value),
}

impl VendorMessage {
    pub fn id(&self) -> &'static str {
        match self {
            VendorMessage::Handshake(_) => AZ_HANDSHAKE,
            VendorMessage::Have(_) => AZ_HAVE,
            VendorMessage::Pex { .. } => AZ_PEER_EXCHANGE,
            VendorMessage::Metadata(_) => AZ_METADATA,
            VendorMessage::RequestHint(_) => AZ_REQUEST_HINT,
            VendorMessage::BadPiece(_) => AZ_BAD_PIECE,
            VendorMessage::StatsRequest(_) => AZ_STAT_REQUEST,
            VendorMessage::StatsReply(_) => AZ_STAT_REPLY,
        }
    }

    pub fn encode_payload(&self) -> Result<Bytes, PeerError> {
        let value = match self {
            VendorMessage::Handshake(hs) => hs.to_value(),
            VendorMessage::Have(pieces) => {
                let mut dict = Value::dict();
                dict.insert(
                    "pieces",
                    pieces.iter().map(|&p| Value::from(p)).collect::<Vec<_>>(),
                );
                dict
            }
            VendorMessage::Pex { info_hash, volley } => {
                let mut dict = volley.to_value();
                dict.insert("infohash", info_hash.as_slice());
                dict
            }
            VendorMessage::Metadata(meta) => meta.to_value(),
            VendorMessage::RequestHint(hint) => {
                let mut dict = Value::dict();
                dict.insert("piece", hint.piece);
                dict.insert("offset", hint.offset);
                dict.insert("length", hint.length);
                dict.insert("life", hint.life_ms);
                dict
            }
            VendorMessage::BadPiece(piece) => {
                let mut dict = Value::dict();
                dict.insert("piece", *piece);
                dict
            }
            VendorMessage::StatsRequest(v) | VendorMessage::StatsReply(v) => v.clone(),
        };
        Ok(Bytes::from(encode(&value)?))
    }

    /// Decodes a payload; `Ok(None)` for ids this side does not know.
    pub fn decode_payload(id: &str, payload: &[u8]) -> Result<Option<Self>, PeerError> {
        if id == AZ_METADATA {
            return Ok(Some(VendorMessage::Metadata(MetadataMessage::from_value_bytes(
                payload,
            )?)));
        }
        let value = decode(payload)?;
        let u32_field = |key: &[u8]| {
            value
                .get(key)
                .and_then(Value::as_u32)
                .ok_or_else(|| PeerError::Extension(format!("{id} without {}", String::from_utf8_lossy(key))))
        };

        let msg = match id {
            AZ_HANDSHAKE => VendorMessage::Handshake(VendorHandshake::from_value(&value)?),
            AZ_HAVE => {
                let pieces = value
                    .get(b"pieces")
                    .and_then(Value::as_list)
                    .unwrap_or(&[])
                    .iter()
                    .map(|p| p.as_u32().ok_or_else(|| PeerError::Extension("bad AZ_HAVE piece".into())))
                    .collect::<Result<Vec<_>, _>>()?;
                VendorMessage::Have(pieces)
            }
            AZ_PEER_EXCHANGE => {
                let info_hash = value
                    .get(b"infohash")
                    .and_then(Value::as_bytes)
                    .and_then(|b| <[u8; 20]>::try_from(b.as_ref()).ok())
                    .ok_or_else(|| PeerError::Extension("PEX without infohash".into()))?;
                VendorMessage::Pex {
                    info_hash,
                    volley: PexMessage::from_value(&value),
                }
            }
            AZ_REQUEST_HINT => VendorMessage::RequestHint(RequestHint {
                piece: u32_field(b"piece")?,
                offset: u32_field(b"offset")?,
                length: u32_field(b"length")?,
                life_ms: u32_field(b"life")?,
            }),
            AZ_BAD_PIECE => VendorMessage::BadPiece(u32_field(b"piece")?),
            AZ_STAT_REQUEST => VendorMessage::StatsRequest(value),
            AZ_STAT_REPLY => VendorMessage::StatsReply(value),
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

/// Vendor message ids and versions this side speaks.
pub const LOCAL_VENDOR_MESSAGES: [(&str, u8); 8] = [
    (AZ_HANDSHAKE, 1),
    (AZ_HAVE, 1),
    (AZ_PEER_EXCHANGE, 1),
    (AZ_METADATA, 1),
    (AZ_REQUEST_HINT, 1),
    (AZ_BAD_PIECE, 1),
    (AZ_STAT_REQUEST, 1),
    (AZ_STAT_REPLY, 1),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> VendorHandshake {
        VendorHandshake {
            identity: Bytes::from_static(b"-PW0100-abcdefghijkl"),
            session_id: Some(SessionId([3; 20])),
            reconnect_session_id: None,
            client: "peerwire".into(),
            version: "0.1.0".into(),
            tcp_port: 6881,
            udp_port: 6882,
            udp2_port: 6883,
            ipv6: None,
            metadata_size: Some(1234),
            messages: vec![(AZ_HAVE.into(), 1), ("BT_PIECE".into(), 2)],
            handshake_type: HandshakeType::Crypto,
        }
    }

    #[test]
    fn test_handshake_fields_survive_encoding() {
        let msg = VendorMessage::Handshake(handshake());
        let payload = msg.encode_payload().unwrap();
        assert_eq!(
            VendorMessage::decode_payload(AZ_HANDSHAKE, &payload).unwrap(),
            Some(msg)
        );
    }

    #[test]
    fn test_handshake_requires_identity() {
        let err = VendorMessage::decode_payload(AZ_HANDSHAKE, b"d6:client1:xe").unwrap_err();
        assert!(matches!(err, PeerError::Extension(_)));
    }

    #[test]
    fn test_batched_have() {
        let msg = VendorMessage::Have(vec![1, 5, 9]);
        let payload = msg.encode_payload().unwrap();
        assert_eq!(
            VendorMessage::decode_payload(AZ_HAVE, &payload).unwrap(),
            Some(msg)
        );
    }

    #[test]
    fn test_request_hint_requires_all_fields() {
        assert!(VendorMessage::decode_payload(AZ_REQUEST_HINT, b"d5:piecei1ee").is_err());
    }

    #[test]
    fn test_unknown_id_is_skipped() {
        assert_eq!(VendorMessage::decode_payload("AZ_FUTURE", b"de").unwrap(), None);
    }
}
