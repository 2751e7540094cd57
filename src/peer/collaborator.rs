//! The two services a connection talks to: the swarm's piece layer and the
//! byte transport. Both are injected, so a connection can be driven
//! entirely from tests.

use bytes::Bytes;
use std::net::SocketAddr;

use super::bitfield::Bitfield;
use super::codec::{PeerMessage, WireCodec};
use super::error::CloseReason;
use super::message::HashRequest;
use super::piece::{Block, BlockRequest};
use super::tuning::TransportMode;
use crate::pex::PexMessage;

/// Piece selection, verification and disk access for one swarm.
///
/// Every method is called with no connection lock held, so an
/// implementation may call back into the connection, e.g. to read its choke
/// state while scoring pieces.
pub trait PieceManager: Send + Sync {
    fn piece_count(&self) -> u32;

    fn piece_length(&self, piece: u32) -> u32;

    /// Pieces that are downloaded and verified.
    fn have_pieces(&self) -> Bitfield;

    fn is_piece_done(&self, piece: u32) -> bool;

    /// Whether the selector still wants this piece.
    fn is_piece_interesting(&self, piece: u32) -> bool;

    /// Whether the selector wants anything at all.
    fn has_downloadable_piece(&self) -> bool;

    fn is_download_allowed(&self) -> bool {
        true
    }

    fn is_upload_allowed(&self) -> bool {
        true
    }

    fn is_seeding(&self) -> bool;

    fn is_superseeding(&self) -> bool {
        false
    }

    fn is_endgame(&self) -> bool;

    /// The swarm has no metadata yet and this connection fetches it.
    fn is_metadata_download(&self) -> bool {
        false
    }

    /// Final say on offering an allowed-fast set to a peer.
    fn allow_fast_offer(&self, _from: SocketAddr) -> bool {
        true
    }

    /// Whether `(piece, offset, len)` names a legal block.
    fn validate_block(&self, piece: u32, offset: u32, length: u32) -> bool;

    /// Whether the peer may read this block from us.
    fn validate_read_request(&self, request: &BlockRequest) -> bool;

    fn is_block_written(&self, piece: u32, offset: u32) -> bool;

    /// Hands a received block to the write path. `force` accepts blocks that
    /// no longer have a live request.
    fn write_block(&self, from: SocketAddr, block: Block, force: bool);

    /// Schedules a disk read; the result comes back through
    /// `PeerConnection::send_piece`.
    fn queue_read(&self, from: SocketAddr, request: BlockRequest);

    /// A request we issued will not be answered.
    fn request_cancelled(&self, request: &BlockRequest);

    fn availability_added(&self, pieces: &Bitfield);

    fn availability_removed(&self, pieces: &Bitfield);

    fn have_received(&self, piece: u32);

    /// The peer asked for more of an allowed-fast piece than it was granted.
    fn bad_fast_extension_use(&self, from: SocketAddr);

    fn bad_piece_reported(&self, from: SocketAddr, piece: u32);

    fn metadata_block_received(&self, piece: u32, data: Bytes);

    fn hashes_received(&self, from: SocketAddr, request: &HashRequest, hashes: &[[u8; 32]]);

    fn hash_rejected(&self, from: SocketAddr, request: &HashRequest);

    fn pex_received(&self, from: SocketAddr, volley: PexMessage);

    fn peer_closed(&self, from: SocketAddr, reason: &CloseReason);

    /// The info dictionary, once known.
    fn metadata(&self) -> Option<Bytes>;

    /// Hashes answering a proof request, `None` to reject it.
    fn hash_request(&self, request: &HashRequest) -> Option<Vec<[u8; 32]>>;
}

/// The byte pipe under one connection.
pub trait Transport: Send + Sync {
    fn remote_addr(&self) -> SocketAddr;

    /// Queues a message; never blocks.
    fn enqueue(&self, msg: PeerMessage);

    /// Swaps encoder and decoder for the negotiated dialect.
    fn set_codec(&self, codec: WireCodec);

    /// Lets the decoder deliver messages past the handshake.
    fn resume_decoding(&self);

    /// Protocol bytes queued but not yet written.
    fn queued_protocol_bytes(&self) -> usize;

    /// Bytes per second.
    fn send_rate(&self) -> u64;

    fn receive_rate(&self) -> u64;

    fn set_mode(&self, mode: TransportMode);

    fn close(&self, reason: &CloseReason);
}
