//! libtorrent-style extension protocol (BEP-10).
//!
//! Extension messages are addressed by small integer ids that each side
//! picks for itself and announces in its handshake's `m` dictionary. We
//! decode with our own ids and encode with the peer's.

use super::error::PeerError;
use super::metadata::MetadataMessage;
use crate::bencode::{decode, encode, Value};
use crate::pex::PexMessage;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::Ipv6Addr;

pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

pub const UT_PEX: &str = "ut_pex";
pub const UT_METADATA: &str = "ut_metadata";
pub const UPLOAD_ONLY: &str = "upload_only";

/// Ids we announce for the extensions we understand.
pub const LOCAL_EXTENSIONS: [(&str, u8); 3] = [(UT_PEX, 1), (UT_METADATA, 2), (UPLOAD_ONLY, 3)];

fn local_name(id: u8) -> Option<&'static str> {
    LOCAL_EXTENSIONS
        .iter()
        .find(|(_, i)| *i == id)
        .map(|(n, _)| *n)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    /// Extension name to the id the sender wants to receive it under.
    pub extensions: BTreeMap<String, u8>,
    pub client: Option<String>,
    pub port: Option<u16>,
    pub crypto_requested: bool,
    pub metadata_size: Option<u32>,
    pub ipv6: Option<Ipv6Addr>,
    pub yourip: Option<Bytes>,
    pub reqq: Option<u32>,
    pub upload_only: bool,
}

impl ExtensionHandshake {
    /// Our handshake, announcing [`LOCAL_EXTENSIONS`].
    pub fn local() -> Self {
        Self {
            extensions: LOCAL_EXTENSIONS
                .iter()
                .map(|(n, id)| ((*n).to_string(), *id))
                .collect(),
            ..Self::default()
        }
    }

    pub fn supports(&self, name: &str) -> bool {
        self.extensions.contains_key(name)
    }

    pub fn encode(&self) -> Result<Bytes, PeerError> {
        let mut m = Value::dict();
        for (name, id) in &self.extensions {
            m.insert(name, *id);
        }

        let mut dict = Value::dict();
        dict.insert("m", m);
        if let Some(client) = &self.client {
            dict.insert("v", client.as_str());
        }
        if let Some(port) = self.port {
            dict.insert("p", port);
        }
        if self.crypto_requested {
            dict.insert("e", 1u8);
        }
        if let Some(size) = self.metadata_size {
            dict.insert("metadata_size", size);
        }
        if let Some(ip) = self.ipv6 {
            dict.insert("ipv6", ip.octets().as_slice());
        }
        if let Some(ip) = &self.yourip {
            dict.insert("yourip", ip.clone());
        }
        if let Some(reqq) = self.reqq {
            dict.insert("reqq", reqq);
        }
        if self.upload_only {
            dict.insert("upload_only", 1u8);
        }
        Ok(Bytes::from(encode(&dict)?))
    }

    /// Parses a handshake. An id of zero disables an extension; ids outside
    /// `1..=255` or shared by two extensions are a protocol violation.
    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        let value = decode(data)?;
        if value.as_dict().is_none() {
            return Err(PeerError::Extension("handshake is not a dict".into()));
        }

        let mut hs = Self::default();
        if let Some(m) = value.get(b"m").and_then(Value::as_dict) {
            for (key, val) in m {
                let name = String::from_utf8_lossy(key).into_owned();
                let id = val
                    .as_integer()
                    .filter(|id| (0..=255).contains(id))
                    .ok_or_else(|| PeerError::InvalidExtensionMapping(name.clone()))?;
                if id == 0 {
                    continue;
                }
                let id = id as u8;
                if hs.extensions.values().any(|&other| other == id) {
                    return Err(PeerError::InvalidExtensionMapping(format!(
                        "{name} reuses id {id}"
                    )));
                }
                hs.extensions.insert(name, id);
            }
        }

        hs.client = value.get(b"v").and_then(Value::as_str).map(String::from);
        hs.port = value
            .get(b"p")
            .and_then(Value::as_integer)
            .and_then(|p| u16::try_from(p).ok());
        hs.crypto_requested = value.get(b"e").and_then(Value::as_integer) == Some(1);
        hs.metadata_size = value.get(b"metadata_size").and_then(Value::as_u32);
        hs.ipv6 = value
            .get(b"ipv6")
            .and_then(Value::as_bytes)
            .and_then(|b| <[u8; 16]>::try_from(b.as_ref()).ok())
            .map(Ipv6Addr::from);
        hs.yourip = value.get(b"yourip").and_then(Value::as_bytes).cloned();
        hs.reqq = value.get(b"reqq").and_then(Value::as_u32);
        hs.upload_only = value
            .get(b"upload_only")
            .and_then(Value::as_integer)
            .is_some_and(|v| v != 0);
        Ok(hs)
    }
}

/// Decoded libtorrent-style extension messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionMessage {
    Handshake(ExtensionHandshake),
    Pex(PexMessage),
    Metadata(MetadataMessage),
    UploadOnly(bool),
    Unknown { id: u8, payload: Bytes },
}

impl ExtensionMessage {
    /// Extension name the message is sent under, `None` for the handshake.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            ExtensionMessage::Handshake(_) | ExtensionMessage::Unknown { .. } => None,
            ExtensionMessage::Pex(_) => Some(UT_PEX),
            ExtensionMessage::Metadata(_) => Some(UT_METADATA),
            ExtensionMessage::UploadOnly(_) => Some(UPLOAD_ONLY),
        }
    }

    /// Decodes a payload that arrived under one of our local ids.
    pub fn decode(id: u8, payload: Bytes) -> Result<Self, PeerError> {
        if id == EXTENSION_HANDSHAKE_ID {
            return Ok(ExtensionMessage::Handshake(ExtensionHandshake::decode(
                &payload,
            )?));
        }
        match local_name(id) {
            Some(UT_PEX) => Ok(ExtensionMessage::Pex(PexMessage::decode(&payload)?)),
            Some(UT_METADATA) => Ok(ExtensionMessage::Metadata(MetadataMessage::decode(
                &payload,
            )?)),
            Some(UPLOAD_ONLY) => Ok(ExtensionMessage::UploadOnly(
                payload.first().is_some_and(|&b| b != 0),
            )),
            _ => Ok(ExtensionMessage::Unknown { id, payload }),
        }
    }

    /// Encodes for the peer, using the ids from its handshake. Returns
    /// `Ok(None)` when the peer never announced the extension.
    pub fn encode(
        &self,
        remote: &BTreeMap<String, u8>,
    ) -> Result<Option<(u8, Bytes)>, PeerError> {
        let id = match self.name() {
            None => match self {
                ExtensionMessage::Handshake(_) => EXTENSION_HANDSHAKE_ID,
                ExtensionMessage::Unknown { id, .. } => *id,
                _ => return Ok(None),
            },
            Some(name) => match remote.get(name) {
                Some(id) => *id,
                None => return Ok(None),
            },
        };
        let payload = match self {
            ExtensionMessage::Handshake(hs) => hs.encode()?,
            ExtensionMessage::Pex(pex) => pex.encode()?,
            ExtensionMessage::Metadata(meta) => meta.encode()?,
            ExtensionMessage::UploadOnly(flag) => Bytes::from(vec![u8::from(*flag)]),
            ExtensionMessage::Unknown { payload, .. } => payload.clone(),
        };
        Ok(Some((id, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_fields_survive_encoding() {
        let mut hs = ExtensionHandshake::local();
        hs.client = Some("peerwire 0.1.0".into());
        hs.port = Some(51413);
        hs.crypto_requested = true;
        hs.metadata_size = Some(40_000);
        hs.ipv6 = Some("2001:db8::1".parse().unwrap());
        hs.upload_only = true;

        let decoded = ExtensionHandshake::decode(&hs.encode().unwrap()).unwrap();
        assert_eq!(decoded, hs);
    }

    #[test]
    fn test_zero_id_disables_extension() {
        let decoded = ExtensionHandshake::decode(b"d1:md6:ut_pexi0e11:ut_metadatai3eee").unwrap();
        assert!(!decoded.supports(UT_PEX));
        assert_eq!(decoded.extensions.get(UT_METADATA), Some(&3));
    }

    #[test]
    fn test_out_of_range_id_is_invalid_mapping() {
        let err = ExtensionHandshake::decode(b"d1:md6:ut_pexi300eee").unwrap_err();
        assert!(matches!(err, PeerError::InvalidExtensionMapping(_)));
    }

    #[test]
    fn test_shared_id_is_invalid_mapping() {
        let err =
            ExtensionHandshake::decode(b"d1:md11:ut_metadatai2e6:ut_pexi2eee").unwrap_err();
        assert!(matches!(err, PeerError::InvalidExtensionMapping(_)));
    }

    #[test]
    fn test_encode_skips_unannounced_extension() {
        let remote = BTreeMap::from([(UT_METADATA.to_string(), 7u8)]);
        assert_eq!(
            ExtensionMessage::UploadOnly(true).encode(&remote).unwrap(),
            None
        );
        let (id, payload) = ExtensionMessage::Metadata(MetadataMessage::reject(1))
            .encode(&remote)
            .unwrap()
            .unwrap();
        assert_eq!(id, 7);
        assert!(!payload.is_empty());
    }

    #[test]
    fn test_decode_uses_local_ids() {
        let msg = ExtensionMessage::decode(3, Bytes::from_static(&[1])).unwrap();
        assert_eq!(msg, ExtensionMessage::UploadOnly(true));

        let msg = ExtensionMessage::decode(99, Bytes::from_static(b"x")).unwrap();
        assert!(matches!(msg, ExtensionMessage::Unknown { id: 99, .. }));
    }
}
