//! peerwire - A per-connection BitTorrent peer engine
//!
//! This library drives a single BitTorrent peer connection from the first
//! handshake byte to the final close, leaving sockets, storage and piece
//! picking to the embedding client.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`peer`] - BEP-3/6/10 peer wire protocol, vendor messaging, connection state machine
//! - [`pex`] - BEP-11 Peer Exchange
//! - [`config`] - Per-connection configuration
//! - [`constants`] - Protocol limits and defaults

pub mod bencode;
pub mod config;
pub mod constants;
pub mod peer;
pub mod pex;

pub use bencode::{decode, encode, BencodeError, Value};
pub use config::{MessagingMode, PeerConfig, VendorPreference};
pub use peer::{
    spawn_driver, Bitfield, Block, BlockRequest, CloseReason, ConnectionState, Dialect,
    ExtensionHandshake, Handshake, Message, PeerConnection, PeerContext, PeerError, PeerId,
    PeerMessage, PeerServices, PieceManager, Transport, WireCodec,
};
pub use pex::{PexFlags, PexMessage, PexPeer};
