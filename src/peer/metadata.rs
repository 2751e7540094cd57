//! Metadata exchange (ut_metadata, BEP-9).
//!
//! Lets a peer that only knows the info hash fetch the info dictionary in
//! 16 KiB blocks. Data messages carry the block as raw bytes after the
//! bencoded header.

use bytes::Bytes;

use super::error::PeerError;
use crate::bencode::{decode, decode_prefix, encode, Value};
use crate::constants::METADATA_BLOCK_SIZE;

const MSG_REQUEST: i64 = 0;
const MSG_DATA: i64 = 1;
const MSG_REJECT: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u32, data: Bytes },
    /// The sender does not have, or will not share, the block.
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        MetadataMessage::Request { piece }
    }

    pub fn reject(piece: u32) -> Self {
        MetadataMessage::Reject { piece }
    }

    pub fn piece(&self) -> u32 {
        match self {
            MetadataMessage::Request { piece }
            | MetadataMessage::Data { piece, .. }
            | MetadataMessage::Reject { piece } => *piece,
        }
    }

    fn header(&self) -> Value {
        let mut dict = Value::dict();
        let msg_type = match self {
            MetadataMessage::Request { .. } => MSG_REQUEST,
            MetadataMessage::Data { total_size, .. } => {
                dict.insert("total_size", *total_size);
                MSG_DATA
            }
            MetadataMessage::Reject { .. } => MSG_REJECT,
        };
        dict.insert("msg_type", msg_type);
        dict.insert("piece", self.piece());
        dict
    }

    /// Header dictionary followed by the raw block for data messages.
    pub fn encode(&self) -> Result<Bytes, PeerError> {
        let mut out = encode(&self.header())?;
        if let MetadataMessage::Data { data, .. } = self {
            out.extend_from_slice(data);
        }
        Ok(Bytes::from(out))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let (header, used) = decode_prefix(payload)?;
        Self::from_header(&header, Bytes::copy_from_slice(&payload[used..]))
    }

    /// Form used inside vendor messages, where the block is a dictionary
    /// entry instead of trailing bytes.
    pub(crate) fn to_value(&self) -> Value {
        let mut dict = self.header();
        if let MetadataMessage::Data { data, .. } = self {
            dict.insert("data", data.clone());
        }
        dict
    }

    pub(crate) fn from_value_bytes(payload: &[u8]) -> Result<Self, PeerError> {
        let value = decode(payload)?;
        let data = value.get(b"data").and_then(Value::as_bytes).cloned().unwrap_or_default();
        Self::from_header(&value, data)
    }

    fn from_header(header: &Value, data: Bytes) -> Result<Self, PeerError> {
        let field = |key: &[u8]| header.get(key).and_then(Value::as_integer);
        let piece = field(b"piece")
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| PeerError::Extension("metadata message without piece".into()))?;

        match field(b"msg_type") {
            Some(MSG_REQUEST) => Ok(MetadataMessage::Request { piece }),
            Some(MSG_REJECT) => Ok(MetadataMessage::Reject { piece }),
            Some(MSG_DATA) => {
                let total_size = field(b"total_size")
                    .and_then(|t| u32::try_from(t).ok())
                    .ok_or_else(|| PeerError::Extension("metadata data without size".into()))?;
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    data,
                })
            }
            other => Err(PeerError::Extension(format!(
                "unknown metadata msg_type {other:?}"
            ))),
        }
    }
}

/// Number of blocks a metadata dictionary of `total_size` bytes splits into.
pub fn block_count(total_size: u32) -> u32 {
    total_size.div_ceil(METADATA_BLOCK_SIZE)
}

/// Exact length block `piece` must have; only the last block may be short.
pub fn expected_block_len(piece: u32, total_size: u32) -> Option<u32> {
    let start = piece.checked_mul(METADATA_BLOCK_SIZE)?;
    if start >= total_size {
        return None;
    }
    Some((total_size - start).min(METADATA_BLOCK_SIZE))
}

/// Slices block `piece` out of the full metadata.
pub fn block(metadata: &Bytes, piece: u32) -> Option<Bytes> {
    let total = u32::try_from(metadata.len()).ok()?;
    let len = expected_block_len(piece, total)?;
    let start = (piece * METADATA_BLOCK_SIZE) as usize;
    Some(metadata.slice(start..start + len as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encoding() {
        let encoded = MetadataMessage::request(5).encode().unwrap();
        assert_eq!(&encoded[..], b"d8:msg_typei0e5:piecei5ee");
        assert_eq!(
            MetadataMessage::decode(&encoded).unwrap(),
            MetadataMessage::request(5)
        );
    }

    #[test]
    fn test_data_carries_trailing_block() {
        let msg = MetadataMessage::Data {
            piece: 2,
            total_size: 40_000,
            data: Bytes::from_static(b"\x01\x02\x03"),
        };
        let encoded = msg.encode().unwrap();
        assert!(encoded.ends_with(b"e\x01\x02\x03"));
        assert_eq!(MetadataMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_vendor_form_embeds_block() {
        let msg = MetadataMessage::Data {
            piece: 0,
            total_size: 3,
            data: Bytes::from_static(b"abc"),
        };
        let encoded = encode(&msg.to_value()).unwrap();
        assert_eq!(MetadataMessage::from_value_bytes(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_unknown_type_is_error() {
        assert!(MetadataMessage::decode(b"d8:msg_typei9e5:piecei0ee").is_err());
    }

    #[test]
    fn test_block_geometry() {
        assert_eq!(block_count(0), 0);
        assert_eq!(block_count(16_384), 1);
        assert_eq!(block_count(16_385), 2);
        assert_eq!(expected_block_len(0, 40_000), Some(16_384));
        assert_eq!(expected_block_len(2, 40_000), Some(40_000 - 32_768));
        assert_eq!(expected_block_len(3, 40_000), None);

        let metadata = Bytes::from(vec![7u8; 20_000]);
        assert_eq!(block(&metadata, 1).map(|b| b.len()), Some(20_000 - 16_384));
        assert_eq!(block(&metadata, 2), None);
    }
}
