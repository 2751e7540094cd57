use super::error::PeerError;
use super::piece::{Block, BlockRequest};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    // Fast extension (BEP-6)
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    // Extension protocol (BEP-10)
    Extended = 20,
    // Merkle hash exchange (BEP-52)
    HashRequest = 21,
    Hashes = 22,
    HashReject = 23,
}

impl MessageId {
    /// Name used when a core message travels inside the vendor dialect.
    pub fn vendor_name(self) -> &'static str {
        match self {
            MessageId::Choke => "BT_CHOKE",
            MessageId::Unchoke => "BT_UNCHOKE",
            MessageId::Interested => "BT_INTERESTED",
            MessageId::NotInterested => "BT_UNINTERESTED",
            MessageId::Have => "BT_HAVE",
            MessageId::Bitfield => "BT_BITFIELD",
            MessageId::Request => "BT_REQUEST",
            MessageId::Piece => "BT_PIECE",
            MessageId::Cancel => "BT_CANCEL",
            MessageId::Port => "BT_DHT_PORT",
            MessageId::Suggest => "BT_SUGGEST_PIECE",
            MessageId::HaveAll => "BT_HAVE_ALL",
            MessageId::HaveNone => "BT_HAVE_NONE",
            MessageId::Reject => "BT_REJECT_REQUEST",
            MessageId::AllowedFast => "BT_ALLOWED_FAST",
            MessageId::Extended => "BT_LT_EXT_MESSAGE",
            MessageId::HashRequest => "BT_HASH_REQUEST",
            MessageId::Hashes => "BT_HASHES",
            MessageId::HashReject => "BT_HASH_REJECT",
        }
    }

    pub fn from_vendor_name(name: &str) -> Option<Self> {
        ALL_IDS.iter().copied().find(|id| id.vendor_name() == name)
    }
}

const ALL_IDS: [MessageId; 19] = [
    MessageId::Choke,
    MessageId::Unchoke,
    MessageId::Interested,
    MessageId::NotInterested,
    MessageId::Have,
    MessageId::Bitfield,
    MessageId::Request,
    MessageId::Piece,
    MessageId::Cancel,
    MessageId::Port,
    MessageId::Suggest,
    MessageId::HaveAll,
    MessageId::HaveNone,
    MessageId::Reject,
    MessageId::AllowedFast,
    MessageId::Extended,
    MessageId::HashRequest,
    MessageId::Hashes,
    MessageId::HashReject,
];

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        ALL_IDS
            .iter()
            .copied()
            .find(|id| *id as u8 == value)
            .ok_or(PeerError::InvalidMessageId(value))
    }
}

/// The classic 68-byte handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], reserved: [u8; 8]) -> Self {
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn has_bit(&self, (byte, mask): (usize, u8)) -> bool {
        self.reserved[byte] & mask != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN
            || data[0] as usize != PROTOCOL.len()
            || &data[1..20] != PROTOCOL
        {
            return Err(PeerError::InvalidHandshake);
        }

        let mut hs = Self::new([0; 20], [0; 20], [0; 8]);
        hs.reserved.copy_from_slice(&data[20..28]);
        hs.info_hash.copy_from_slice(&data[28..48]);
        hs.peer_id.copy_from_slice(&data[48..68]);
        Ok(hs)
    }
}

/// A BEP-52 hash request, also the header of `hashes` and `hash reject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashRequest {
    pub pieces_root: [u8; 32],
    pub base_layer: u32,
    pub index: u32,
    pub length: u32,
    pub proof_layers: u32,
}

const HASH_REQUEST_LEN: usize = 48;

impl HashRequest {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.pieces_root);
        buf.put_u32(self.base_layer);
        buf.put_u32(self.index);
        buf.put_u32(self.length);
        buf.put_u32(self.proof_layers);
    }

    fn get(data: &mut Bytes) -> Result<Self, PeerError> {
        if data.remaining() < HASH_REQUEST_LEN {
            return Err(PeerError::InvalidMessage("hash request too short".into()));
        }
        let mut pieces_root = [0u8; 32];
        data.copy_to_slice(&mut pieces_root);
        Ok(Self {
            pieces_root,
            base_layer: data.get_u32(),
            index: data.get_u32(),
            length: data.get_u32(),
            proof_layers: data.get_u32(),
        })
    }
}

/// Core wire messages, shared by all three dialects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request(BlockRequest),
    Piece(Block),
    Cancel(BlockRequest),
    Port(u16),
    Suggest(u32),
    HaveAll,
    HaveNone,
    Reject(BlockRequest),
    AllowedFast(u32),
    /// Raw LTEP payload; interpreted by the extension codec.
    Extended { id: u8, payload: Bytes },
    HashRequest(HashRequest),
    Hashes { request: HashRequest, hashes: Vec<[u8; 32]> },
    HashReject(HashRequest),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        Some(match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have(_) => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request(_) => MessageId::Request,
            Message::Piece(_) => MessageId::Piece,
            Message::Cancel(_) => MessageId::Cancel,
            Message::Port(_) => MessageId::Port,
            Message::Suggest(_) => MessageId::Suggest,
            Message::HaveAll => MessageId::HaveAll,
            Message::HaveNone => MessageId::HaveNone,
            Message::Reject(_) => MessageId::Reject,
            Message::AllowedFast(_) => MessageId::AllowedFast,
            Message::Extended { .. } => MessageId::Extended,
            Message::HashRequest(_) => MessageId::HashRequest,
            Message::Hashes { .. } => MessageId::Hashes,
            Message::HashReject(_) => MessageId::HashReject,
        })
    }

    /// Whether the message carries piece data rather than protocol chatter.
    pub fn is_data(&self) -> bool {
        matches!(self, Message::Piece(_))
    }

    /// Writes the body that follows the id byte.
    pub fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => {}
            Message::Have(piece) | Message::Suggest(piece) | Message::AllowedFast(piece) => {
                buf.put_u32(*piece)
            }
            Message::Bitfield(bits) => buf.put_slice(bits),
            Message::Request(req) | Message::Cancel(req) | Message::Reject(req) => {
                buf.put_u32(req.piece);
                buf.put_u32(req.offset);
                buf.put_u32(req.length);
            }
            Message::Piece(block) => {
                buf.put_u32(block.piece);
                buf.put_u32(block.offset);
                buf.put_slice(&block.data);
            }
            Message::Port(port) => buf.put_u16(*port),
            Message::Extended { id, payload } => {
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
            Message::HashRequest(req) | Message::HashReject(req) => req.put(buf),
            Message::Hashes { request, hashes } => {
                request.put(buf);
                for hash in hashes {
                    buf.put_slice(hash);
                }
            }
        }
    }

    /// Length-prefixed classic framing.
    pub fn encode(&self) -> Bytes {
        let Some(id) = self.id() else {
            return Bytes::from_static(&[0, 0, 0, 0]);
        };
        let mut body = BytesMut::new();
        self.encode_payload(&mut body);

        let mut buf = BytesMut::with_capacity(5 + body.len());
        buf.put_u32(1 + body.len() as u32);
        buf.put_u8(id as u8);
        buf.put_slice(&body);
        buf.freeze()
    }

    /// Decodes one length-prefixed frame.
    pub fn decode(mut frame: Bytes) -> Result<Self, PeerError> {
        if frame.remaining() < 4 {
            return Err(PeerError::InvalidMessage("too short".into()));
        }
        let length = frame.get_u32() as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if frame.remaining() < length {
            return Err(PeerError::InvalidMessage("incomplete message".into()));
        }
        let id = MessageId::try_from(frame.get_u8())?;
        Self::decode_payload(id, frame.split_to(length - 1))
    }

    /// Decodes the body that followed the id byte.
    pub fn decode_payload(id: MessageId, mut data: Bytes) -> Result<Self, PeerError> {
        let need = |data: &Bytes, n: usize, what: &str| {
            if data.remaining() < n {
                Err(PeerError::InvalidMessage(format!("{what} too short")))
            } else {
                Ok(())
            }
        };
        let block_request = |data: &mut Bytes| {
            BlockRequest::new(data.get_u32(), data.get_u32(), data.get_u32())
        };

        Ok(match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::HaveAll => Message::HaveAll,
            MessageId::HaveNone => Message::HaveNone,
            MessageId::Have => {
                need(&data, 4, "have")?;
                Message::Have(data.get_u32())
            }
            MessageId::Suggest => {
                need(&data, 4, "suggest")?;
                Message::Suggest(data.get_u32())
            }
            MessageId::AllowedFast => {
                need(&data, 4, "allowed fast")?;
                Message::AllowedFast(data.get_u32())
            }
            MessageId::Bitfield => Message::Bitfield(data),
            MessageId::Request => {
                need(&data, 12, "request")?;
                Message::Request(block_request(&mut data))
            }
            MessageId::Cancel => {
                need(&data, 12, "cancel")?;
                Message::Cancel(block_request(&mut data))
            }
            MessageId::Reject => {
                need(&data, 12, "reject")?;
                Message::Reject(block_request(&mut data))
            }
            MessageId::Piece => {
                need(&data, 8, "piece")?;
                let piece = data.get_u32();
                let offset = data.get_u32();
                Message::Piece(Block::new(piece, offset, data))
            }
            MessageId::Port => {
                need(&data, 2, "port")?;
                Message::Port(data.get_u16())
            }
            MessageId::Extended => {
                need(&data, 1, "extended")?;
                let id = data.get_u8();
                Message::Extended { id, payload: data }
            }
            MessageId::HashRequest => Message::HashRequest(HashRequest::get(&mut data)?),
            MessageId::HashReject => Message::HashReject(HashRequest::get(&mut data)?),
            MessageId::Hashes => {
                let request = HashRequest::get(&mut data)?;
                if data.remaining() % 32 != 0 {
                    return Err(PeerError::InvalidMessage("hashes not 32-byte aligned".into()));
                }
                let mut hashes = Vec::with_capacity(data.remaining() / 32);
                while data.has_remaining() {
                    let mut hash = [0u8; 32];
                    data.copy_to_slice(&mut hash);
                    hashes.push(hash);
                }
                Message::Hashes { request, hashes }
            }
        })
    }
}
