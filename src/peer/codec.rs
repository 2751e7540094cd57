//! Wire codecs for the three extension dialects.
//!
//! Every connection starts on the classic codec and switches at most once,
//! right after the dialect is decided. The codec is a plain value handed to
//! the transport; only one is ever active.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

use super::error::PeerError;
use super::extension::ExtensionMessage;
use super::message::{Handshake, Message, MessageId};
use super::negotiate::{Dialect, MessageVersions};
use super::vendor::{VendorMessage, AZ_HANDSHAKE};

/// Largest frame accepted from a peer.
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Longest vendor message id.
const MAX_VENDOR_ID: usize = 64;

/// A message in any dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// The classic handshake, sent before any codec applies.
    Handshake(Handshake),
    Core(Message),
    Extension(ExtensionMessage),
    Vendor(VendorMessage),
}

impl PeerMessage {
    pub fn is_data(&self) -> bool {
        matches!(self, PeerMessage::Core(msg) if msg.is_data())
    }

    /// Piece payload bytes carried by the message, zero for protocol chatter.
    pub fn data_len(&self) -> usize {
        match self {
            PeerMessage::Core(Message::Piece(block)) => block.data.len(),
            _ => 0,
        }
    }
}

impl From<Message> for PeerMessage {
    fn from(msg: Message) -> Self {
        PeerMessage::Core(msg)
    }
}

impl From<ExtensionMessage> for PeerMessage {
    fn from(msg: ExtensionMessage) -> Self {
        PeerMessage::Extension(msg)
    }
}

impl From<VendorMessage> for PeerMessage {
    fn from(msg: VendorMessage) -> Self {
        PeerMessage::Vendor(msg)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WireCodec {
    /// One-byte ids, length-prefixed frames.
    #[default]
    Classic,
    /// Classic framing; extension messages ride in `Extended` frames under
    /// the ids the peer announced.
    Ltep { remote: BTreeMap<String, u8> },
    /// String-identified, versioned frames for every message.
    Vendor { versions: MessageVersions },
}

impl WireCodec {
    pub fn dialect(&self) -> Dialect {
        match self {
            WireCodec::Classic => Dialect::Classic,
            WireCodec::Ltep { .. } => Dialect::Ltep,
            WireCodec::Vendor { .. } => Dialect::Vendor,
        }
    }

    /// Frames a message. `Ok(None)` when the peer cannot receive it in this
    /// dialect, which is not an error.
    pub fn encode(&self, msg: &PeerMessage) -> Result<Option<Bytes>, PeerError> {
        match (self, msg) {
            (_, PeerMessage::Handshake(hs)) => Ok(Some(hs.encode())),
            (WireCodec::Vendor { .. }, PeerMessage::Core(core)) => Ok(Some(encode_vendor_core(core))),
            (_, PeerMessage::Core(core)) => Ok(Some(core.encode())),
            (WireCodec::Ltep { remote }, PeerMessage::Extension(ext)) => {
                Ok(ext.encode(remote)?.map(|(id, payload)| Message::Extended { id, payload }.encode()))
            }
            (WireCodec::Vendor { versions }, PeerMessage::Vendor(vendor)) => {
                let id = vendor.id();
                let version = match versions.version(id) {
                    Some(version) => version,
                    None if id == AZ_HANDSHAKE => 1,
                    None => return Ok(None),
                };
                Ok(Some(vendor_frame(id, version, &vendor.encode_payload()?)))
            }
            _ => Ok(None),
        }
    }

    /// Decodes one length-prefixed frame. `Ok(None)` for messages this side
    /// does not understand, which are skipped.
    pub fn decode(&self, frame: Bytes) -> Result<Option<PeerMessage>, PeerError> {
        match self {
            WireCodec::Classic => Ok(Some(PeerMessage::Core(Message::decode(frame)?))),
            WireCodec::Ltep { .. } => match Message::decode(frame)? {
                Message::Extended { id, payload } => Ok(Some(PeerMessage::Extension(
                    ExtensionMessage::decode(id, payload)?,
                ))),
                core => Ok(Some(PeerMessage::Core(core))),
            },
            WireCodec::Vendor { .. } => decode_vendor(frame),
        }
    }
}

fn vendor_frame(id: &str, version: u8, payload: &[u8]) -> Bytes {
    let body_len = 4 + id.len() + 1 + payload.len();
    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u32(id.len() as u32);
    buf.put_slice(id.as_bytes());
    buf.put_u8(version);
    buf.put_slice(payload);
    buf.freeze()
}

fn encode_vendor_core(msg: &Message) -> Bytes {
    let Some(id) = msg.id() else {
        return Bytes::from_static(&[0, 0, 0, 0]);
    };
    let mut payload = BytesMut::new();
    msg.encode_payload(&mut payload);
    vendor_frame(id.vendor_name(), 1, &payload)
}

fn decode_vendor(mut frame: Bytes) -> Result<Option<PeerMessage>, PeerError> {
    let short = || PeerError::InvalidMessage("vendor frame too short".into());
    if frame.remaining() < 4 {
        return Err(short());
    }
    let length = frame.get_u32() as usize;
    if length == 0 {
        return Ok(Some(PeerMessage::Core(Message::KeepAlive)));
    }
    if length > MAX_FRAME || frame.remaining() < length {
        return Err(PeerError::InvalidMessage(format!("vendor frame of {length} bytes")));
    }
    let mut body = frame.split_to(length);
    if body.remaining() < 4 {
        return Err(short());
    }
    let id_len = body.get_u32() as usize;
    if id_len > MAX_VENDOR_ID || body.remaining() < id_len + 1 {
        return Err(short());
    }
    let id = body.split_to(id_len);
    let id = std::str::from_utf8(&id)
        .map_err(|_| PeerError::InvalidMessage("vendor id is not utf-8".into()))?;
    let _version = body.get_u8();

    if let Some(core) = MessageId::from_vendor_name(id) {
        return Ok(Some(PeerMessage::Core(Message::decode_payload(core, body)?)));
    }
    Ok(VendorMessage::decode_payload(id, &body)?.map(PeerMessage::Vendor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::extension::{UPLOAD_ONLY, UT_PEX};
    use crate::peer::piece::BlockRequest;
    use crate::peer::vendor::AZ_HAVE;
    use crate::pex::PexMessage;

    #[test]
    fn test_classic_passes_core_through() {
        let codec = WireCodec::Classic;
        let msg = PeerMessage::Core(Message::Request(BlockRequest::new(1, 0, 16384)));
        let frame = codec.encode(&msg).unwrap().unwrap();
        assert_eq!(codec.decode(frame).unwrap(), Some(msg));
    }

    #[test]
    fn test_classic_cannot_send_extensions() {
        let codec = WireCodec::Classic;
        let msg = PeerMessage::Extension(ExtensionMessage::UploadOnly(true));
        assert_eq!(codec.encode(&msg).unwrap(), None);
        let msg = PeerMessage::Vendor(VendorMessage::BadPiece(3));
        assert_eq!(codec.encode(&msg).unwrap(), None);
    }

    #[test]
    fn test_ltep_uses_remote_ids() {
        let remote: BTreeMap<String, u8> = [(UPLOAD_ONLY.to_string(), 7)].into_iter().collect();
        let codec = WireCodec::Ltep { remote };

        let frame = codec
            .encode(&ExtensionMessage::UploadOnly(true).into())
            .unwrap()
            .unwrap();
        assert_eq!(&frame[4..6], &[MessageId::Extended as u8, 7]);

        let pex = ExtensionMessage::Pex(PexMessage::new());
        assert_eq!(codec.encode(&pex.into()).unwrap(), None);
        assert_eq!(codec.dialect(), Dialect::Ltep);
    }

    #[test]
    fn test_ltep_decodes_with_local_ids() {
        let codec = WireCodec::Ltep {
            remote: BTreeMap::new(),
        };
        let local: BTreeMap<String, u8> = crate::peer::extension::LOCAL_EXTENSIONS
            .iter()
            .map(|(n, id)| ((*n).to_string(), *id))
            .collect();
        let frame = WireCodec::Ltep { remote: local }
            .encode(&ExtensionMessage::Pex(PexMessage::new()).into())
            .unwrap()
            .unwrap();
        match codec.decode(frame).unwrap() {
            Some(PeerMessage::Extension(ext)) => assert_eq!(ext.name(), Some(UT_PEX)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_vendor_core_messages_use_bt_names() {
        let codec = WireCodec::Vendor {
            versions: MessageVersions::new(),
        };
        let frame = codec.encode(&Message::Have(42).into()).unwrap().unwrap();
        let name = MessageId::Have.vendor_name();
        assert_eq!(&frame[8..8 + name.len()], name.as_bytes());
        assert_eq!(
            codec.decode(frame).unwrap(),
            Some(PeerMessage::Core(Message::Have(42)))
        );

        let keep_alive = codec.encode(&Message::KeepAlive.into()).unwrap().unwrap();
        assert_eq!(
            codec.decode(keep_alive).unwrap(),
            Some(PeerMessage::Core(Message::KeepAlive))
        );
    }

    #[test]
    fn test_vendor_messages_need_negotiated_version() {
        let versions = MessageVersions::intersect([(AZ_HAVE, 1)], [(AZ_HAVE, 1)]);
        let codec = WireCodec::Vendor { versions };

        let have = VendorMessage::Have(vec![1, 2, 3]);
        let frame = codec.encode(&have.clone().into()).unwrap().unwrap();
        assert_eq!(codec.decode(frame).unwrap(), Some(PeerMessage::Vendor(have)));

        let bad_piece = VendorMessage::BadPiece(9);
        assert_eq!(codec.encode(&bad_piece.into()).unwrap(), None);
        assert_eq!(codec.dialect(), Dialect::Vendor);
    }

    #[test]
    fn test_vendor_unknown_ids_are_skipped() {
        let codec = WireCodec::Vendor {
            versions: MessageVersions::new(),
        };
        let frame = vendor_frame("XY_SOMETHING", 1, b"de");
        assert_eq!(codec.decode(frame).unwrap(), None);
    }

    #[test]
    fn test_vendor_truncated_frame() {
        let codec = WireCodec::Vendor {
            versions: MessageVersions::new(),
        };
        let frame = Bytes::from_static(&[0, 0, 0, 9, 0, 0, 0, 20, b'A']);
        assert!(codec.decode(frame).is_err());
    }
}
