use bytes::Bytes;

/// A block of a piece: the unit of requests, cancels and rejects.
///
/// At most one live request per distinct triple exists on a connection, so
/// the type is used directly as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }
}

/// Block payload as received from or sent to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub data: Bytes,
}

impl Block {
    pub fn new(piece: u32, offset: u32, data: Bytes) -> Self {
        Self {
            piece,
            offset,
            data,
        }
    }

    /// The request this block answers.
    pub fn request(&self) -> BlockRequest {
        BlockRequest::new(self.piece, self.offset, self.data.len() as u32)
    }
}
