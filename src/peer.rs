//! Peer wire protocol (BEP-3, BEP-6, BEP-10, plus the vendor messaging framework)
//!
//! This module implements one peer connection end to end: the handshake and
//! extension negotiation, choking and the fast extension, the block pipeline
//! in both directions, and the side channels carried over the extensions.
//! Storage and piece picking stay outside, behind [`PieceManager`].

mod availability;
mod bitfield;
mod codec;
mod collaborator;
mod connection;
mod driver;
mod error;
mod extension;
mod fast;
mod ledger;
mod limiter;
mod message;
mod metadata;
mod negotiate;
mod peer_id;
mod piece;
mod reconnect;
mod registry;
mod stats;
mod tuning;
mod vendor;

pub use availability::{lazy_bitfield, Availability, LazyBitfield, LocalView};
pub use bitfield::Bitfield;
pub use codec::{PeerMessage, WireCodec};
pub use collaborator::{PieceManager, Transport};
pub use connection::{ConnectionState, PeerConnection, PeerContext, PeerServices};
pub use driver::spawn_driver;
pub use error::{CloseReason, ErrorKind, PeerError};
pub use extension::{ExtensionHandshake, ExtensionMessage, UPLOAD_ONLY, UT_METADATA, UT_PEX};
pub use fast::{generate_allowed_fast_set, AllowedFastGrant, AllowedFastOffer, OfferCheck};
pub use ledger::{Issue, LedgerEntry, RequestLedger};
pub use message::{Handshake, HashRequest, Message, MessageId};
pub use metadata::MetadataMessage;
pub use negotiate::{decide_dialect, local_reserved, Capabilities, Dialect, MessageVersions};
pub use peer_id::PeerId;
pub use piece::{Block, BlockRequest};
pub use reconnect::{RateLimits, ReconnectCache, ReconnectRecord, SessionId, SessionSecret};
pub use registry::{is_lan_local, ConnectionClass, Evict, IdentityRegistry, Registration};
pub use stats::{BlockOutcome, PeerStats, SessionCounters};
pub use tuning::{tune, TransportMode, Tuning};
pub use vendor::{RequestHint, VendorHandshake, VendorMessage};
