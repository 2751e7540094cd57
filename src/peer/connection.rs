//! The per-connection state machine.
//!
//! A [`PeerConnection`] is fed decoded messages by its transport and timer
//! ticks by its driver. Handlers update state under a short lock, queue the
//! resulting sends and notifications, and run them once the lock is gone.

mod handshake;
mod side;
mod timers;
mod transfer;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::availability::Availability;
use super::bitfield::Bitfield;
use super::codec::{PeerMessage, WireCodec};
use super::collaborator::{PieceManager, Transport};
use super::error::{CloseReason, ErrorKind, PeerError};
use super::fast::{AllowedFastGrant, AllowedFastOffer};
use super::ledger::RequestLedger;
use super::limiter::MessageLimiter;
use super::message::{HashRequest, Message};
use super::negotiate::{Capabilities, Dialect, MessageVersions};
use super::peer_id::PeerId;
use super::piece::{Block, BlockRequest};
use super::reconnect::{RateLimits, ReconnectCache, ReconnectRecord, SessionId, SessionSecret};
use super::registry::{ConnectionClass, Evict, IdentityRegistry, Registration};
use super::stats::{PeerStats, SessionCounters};
use super::tuning::TransportMode;
use super::vendor::RequestHint;
use crate::bencode::Value;
use crate::config::PeerConfig;
use crate::constants::{READ_AHEAD_MIN, RECONNECT_MIN_LIFETIME};
use crate::pex::PexMessage;

/// Lifecycle of a connection. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Connecting,
    /// Incoming connection waiting for the peer to speak first.
    WaitingForHandshake,
    /// Our handshake is out; extension negotiation may still be pending.
    Handshaking,
    Transferring,
    Closing,
    Disconnected,
}

/// Process-wide services shared by every connection.
pub struct PeerServices {
    pub registry: IdentityRegistry,
    pub reconnects: ReconnectCache,
    pub counters: SessionCounters,
    pub secret: SessionSecret,
}

impl PeerServices {
    pub fn new() -> Self {
        Self {
            registry: IdentityRegistry::new(),
            reconnects: ReconnectCache::new(),
            counters: SessionCounters::new(),
            secret: SessionSecret::generate(),
        }
    }
}

impl Default for PeerServices {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a connection needs from the outside.
#[derive(Clone)]
pub struct PeerContext {
    pub info_hash: [u8; 20],
    pub local_id: PeerId,
    pub config: Arc<PeerConfig>,
    pub manager: Arc<dyn PieceManager>,
    pub transport: Arc<dyn Transport>,
    pub services: Arc<PeerServices>,
    pub class: ConnectionClass,
    /// We dialled the peer, so we speak first.
    pub outgoing: bool,
}

/// Deferred side effects, run with no connection lock held.
#[derive(Debug)]
enum Action {
    Send(PeerMessage),
    SetCodec(WireCodec),
    ResumeDecoding,
    SetMode(TransportMode),
    Cancelled(BlockRequest),
    AvailabilityAdded(Bitfield),
    AvailabilityRemoved(Bitfield),
    HaveReceived(u32),
    Write(Block, bool),
    QueueRead(BlockRequest),
    BadFastUse,
    BadPiece(u32),
    MetadataBlock(u32, Bytes),
    Hashes(HashRequest, Vec<[u8; 32]>),
    HashRejected(HashRequest),
    Pex(PexMessage),
}

struct Inner {
    state: ConnectionState,
    connected_at: Instant,
    established_at: Option<Instant>,

    remote_id: Option<PeerId>,
    client: String,
    capabilities: Option<Capabilities>,
    dialect: Dialect,
    versions: MessageVersions,
    fast: bool,
    dht: bool,
    pex_supported: bool,
    pex_received: u32,
    remote_port: Option<u16>,
    metadata_size: Option<u32>,
    registration: Option<Registration>,

    session_id: Option<SessionId>,
    peer_session_id: Option<SessionId>,
    stats: Arc<PeerStats>,
    is_reconnect: bool,
    rate_limits: RateLimits,

    am_choking: bool,
    am_interested: bool,
    peer_interested: bool,
    really_choked: bool,
    effectively_choked: bool,
    overlay: Option<Vec<i32>>,
    offer: AllowedFastOffer,
    grant: AllowedFastGrant,
    availability: Availability,
    upload_queue: Vec<BlockRequest>,
    suggested: Vec<u32>,

    last_message_received: Instant,
    last_data_received: Option<Instant>,
    last_sent: Instant,
    last_good_data: Option<Instant>,
    snubbed: bool,
    limiter: MessageLimiter,
    lazy_haves: VecDeque<(Instant, u32)>,
    transport_mode: TransportMode,
    read_ahead: usize,

    request_hint: Option<(RequestHint, Instant)>,
    remote_stats: Option<Value>,
    dht_port: Option<u16>,
    close_reason: Option<CloseReason>,

    pending: Vec<Action>,
}

impl Inner {
    fn new(piece_count: u32, now: Instant) -> Self {
        Self {
            state: ConnectionState::Connecting,
            connected_at: now,
            established_at: None,
            remote_id: None,
            client: String::new(),
            capabilities: None,
            dialect: Dialect::Classic,
            versions: MessageVersions::new(),
            fast: false,
            dht: false,
            pex_supported: false,
            pex_received: 0,
            remote_port: None,
            metadata_size: None,
            registration: None,
            session_id: None,
            peer_session_id: None,
            stats: Arc::new(PeerStats::new()),
            is_reconnect: false,
            rate_limits: RateLimits::default(),
            am_choking: true,
            am_interested: false,
            peer_interested: false,
            really_choked: true,
            effectively_choked: true,
            overlay: None,
            offer: AllowedFastOffer::new(),
            grant: AllowedFastGrant::new(),
            availability: Availability::new(piece_count as usize),
            upload_queue: Vec::new(),
            suggested: Vec::new(),
            last_message_received: now,
            last_data_received: None,
            last_sent: now,
            last_good_data: None,
            snubbed: false,
            limiter: MessageLimiter::new(),
            lazy_haves: VecDeque::new(),
            transport_mode: TransportMode::Normal,
            read_ahead: READ_AHEAD_MIN,
            request_hint: None,
            remote_stats: None,
            dht_port: None,
            close_reason: None,
            pending: Vec::new(),
        }
    }

    fn send(&mut self, msg: impl Into<PeerMessage>, now: Instant) {
        self.last_sent = now;
        self.pending.push(Action::Send(msg.into()));
    }

    fn push(&mut self, action: Action) {
        self.pending.push(action);
    }

    fn is_transferring(&self) -> bool {
        self.state == ConnectionState::Transferring
    }

    /// Takes over what an earlier connection to the same peer left behind.
    fn resume(&mut self, record: ReconnectRecord) {
        self.peer_session_id = record.peer_session_id;
        self.stats = record.stats;
        self.snubbed = record.snubbed;
        self.last_good_data = record.last_good_data;
        self.rate_limits = record.limits;
        self.is_reconnect = true;
    }

    fn advance(&mut self, next: ConnectionState) {
        if next > self.state {
            self.state = next;
        }
    }
}

/// One peer connection. Always held in an `Arc`.
pub struct PeerConnection {
    me: Weak<PeerConnection>,
    ctx: PeerContext,
    addr: SocketAddr,
    piece_count: u32,
    closing: AtomicBool,
    inner: Mutex<Inner>,
    ledger: Mutex<RequestLedger>,
}

impl PeerConnection {
    pub fn new(ctx: PeerContext, now: Instant) -> Arc<Self> {
        let addr = ctx.transport.remote_addr();
        let piece_count = ctx.manager.piece_count();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            ctx,
            addr,
            piece_count,
            closing: AtomicBool::new(false),
            inner: Mutex::new(Inner::new(piece_count, now)),
            ledger: Mutex::new(RequestLedger::new()),
        })
    }

    /// Entry point for every decoded inbound message.
    pub fn handle(&self, msg: PeerMessage) -> Result<(), PeerError> {
        self.handle_at(msg, Instant::now())
    }

    pub fn handle_at(&self, msg: PeerMessage, now: Instant) -> Result<(), PeerError> {
        if self.is_closing() {
            return Ok(());
        }
        match self.dispatch(msg, now) {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => {
                match err.kind() {
                    ErrorKind::Protocol | ErrorKind::Flood => {
                        warn!(peer = %self.addr, error = %err, "closing connection")
                    }
                    _ => info!(peer = %self.addr, error = %err, "closing connection"),
                }
                self.close_at(CloseReason::from(&err), now);
                Err(err)
            }
            Err(err) => {
                debug!(peer = %self.addr, error = %err, "message dropped");
                self.flush();
                Ok(())
            }
        }
    }

    fn dispatch(&self, msg: PeerMessage, now: Instant) -> Result<(), PeerError> {
        {
            let mut inner = self.inner.lock();
            inner.last_message_received = now;
            let early = !matches!(
                msg,
                PeerMessage::Handshake(_)
                    | PeerMessage::Extension(_)
                    | PeerMessage::Vendor(_)
                    | PeerMessage::Core(Message::KeepAlive)
            );
            if early && !inner.is_transferring() {
                return Err(PeerError::Discarded("message before handshake completed".into()));
            }
        }

        match msg {
            PeerMessage::Handshake(hs) => self.on_handshake(hs, now),
            PeerMessage::Core(core) => self.on_core(core, now),
            PeerMessage::Extension(ext) => self.on_extension(ext, now),
            PeerMessage::Vendor(vendor) => self.on_vendor(vendor, now),
        }
    }

    fn on_core(&self, msg: Message, now: Instant) -> Result<(), PeerError> {
        if fast_only(&msg) && !self.inner.lock().fast {
            return Err(PeerError::InvalidMessage(format!(
                "{msg:?} without the fast extension"
            )));
        }
        match msg {
            Message::KeepAlive => self.on_keep_alive(now),
            Message::Choke => self.on_choke(),
            Message::Unchoke => self.on_unchoke(),
            Message::Interested => self.on_interested(true),
            Message::NotInterested => self.on_interested(false),
            Message::Have(piece) => self.on_have(&[piece], now),
            Message::Bitfield(bits) => self.on_bitfield(&bits, now),
            Message::HaveAll => self.on_have_all(now),
            Message::HaveNone => self.on_have_none(now),
            Message::Request(req) => self.on_request(req, now),
            Message::Piece(block) => self.on_piece(block, now),
            Message::Cancel(req) => self.on_cancel(req),
            Message::Reject(req) => self.on_reject(req),
            Message::AllowedFast(piece) => self.on_allowed_fast(piece),
            Message::Suggest(piece) => self.on_suggest(piece),
            Message::Port(port) => {
                self.inner.lock().dht_port = Some(port);
                Ok(())
            }
            Message::Extended { id, .. } => {
                debug!(peer = %self.addr, id, "extended message outside the extension protocol");
                Ok(())
            }
            Message::HashRequest(req) => self.on_hash_request(req, now),
            Message::Hashes { request, hashes } => {
                self.inner.lock().push(Action::Hashes(request, hashes));
                self.flush();
                Ok(())
            }
            Message::HashReject(req) => {
                self.inner.lock().push(Action::HashRejected(req));
                self.flush();
                Ok(())
            }
        }
    }

    fn on_keep_alive(&self, now: Instant) -> Result<(), PeerError> {
        use super::limiter::Limited;
        use crate::constants::{KEEP_ALIVE_FLOOD_MAX, KEEP_ALIVE_FLOOD_WINDOW};

        let allowed = self.inner.lock().limiter.count(
            Limited::KeepAlive,
            KEEP_ALIVE_FLOOD_MAX,
            KEEP_ALIVE_FLOOD_WINDOW,
            now,
        );
        if allowed {
            Ok(())
        } else {
            Err(PeerError::Flood("keep-alive"))
        }
    }

    /// Runs queued actions. Nothing is sent once the connection is closing.
    fn flush(&self) {
        let actions = std::mem::take(&mut self.inner.lock().pending);
        self.run(actions);
    }

    fn flush_guard(&self, mut guard: MutexGuard<'_, Inner>) {
        let actions = std::mem::take(&mut guard.pending);
        drop(guard);
        self.run(actions);
    }

    fn run(&self, actions: Vec<Action>) {
        let transport = &self.ctx.transport;
        let manager = &self.ctx.manager;
        for action in actions {
            let closing = self.is_closing();
            match action {
                Action::Send(_) | Action::SetCodec(_) | Action::ResumeDecoding | Action::SetMode(_)
                    if closing => {}
                Action::Send(msg) => transport.enqueue(msg),
                Action::SetCodec(codec) => transport.set_codec(codec),
                Action::ResumeDecoding => transport.resume_decoding(),
                Action::SetMode(mode) => transport.set_mode(mode),
                Action::Cancelled(req) => manager.request_cancelled(&req),
                Action::AvailabilityAdded(bits) => manager.availability_added(&bits),
                Action::AvailabilityRemoved(bits) => manager.availability_removed(&bits),
                Action::HaveReceived(piece) => manager.have_received(piece),
                Action::Write(block, force) => manager.write_block(self.addr, block, force),
                Action::QueueRead(req) => manager.queue_read(self.addr, req),
                Action::BadFastUse => manager.bad_fast_extension_use(self.addr),
                Action::BadPiece(piece) => manager.bad_piece_reported(self.addr, piece),
                Action::MetadataBlock(piece, data) => manager.metadata_block_received(piece, data),
                Action::Hashes(req, hashes) => manager.hashes_received(self.addr, &req, &hashes),
                Action::HashRejected(req) => manager.hash_rejected(self.addr, &req),
                Action::Pex(volley) => manager.pex_received(self.addr, volley),
            }
        }
    }

    /// Closes the connection. Only the first call has any effect.
    pub fn close(&self, reason: CloseReason) {
        self.close_at(reason, Instant::now());
    }

    pub fn close_at(&self, reason: CloseReason, now: Instant) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let (registration, retracted, record) = {
            let mut inner = self.inner.lock();
            inner.pending.clear();
            inner.am_interested = false;
            inner.advance(ConnectionState::Closing);
            inner.close_reason = Some(reason.clone());

            inner.pex_supported = false;
            inner.upload_queue.clear();
            inner.lazy_haves.clear();
            inner.request_hint = None;
            inner.offer.clear();
            inner.grant.clear();
            inner.overlay = None;

            let lifetime = now.saturating_duration_since(inner.connected_at);
            let stats = &inner.stats;
            let worth_keeping = stats.data_received() > 0
                || stats.data_sent() > 0
                || inner.rate_limits.is_set()
                || lifetime > RECONNECT_MIN_LIFETIME;
            let record = inner.session_id.filter(|_| worth_keeping).map(|id| {
                (
                    id,
                    ReconnectRecord {
                        peer_session_id: inner.peer_session_id,
                        stats: Arc::clone(&inner.stats),
                        snubbed: inner.snubbed,
                        last_good_data: inner.last_good_data,
                        limits: inner.rate_limits,
                        stored_at: now,
                    },
                )
            });
            (inner.registration.take(), inner.availability.retract(), record)
        };

        if let Some(registration) = registration {
            self.ctx.services.registry.unregister(&registration);
        }

        let drained = self.ledger.lock().drain();
        for req in &drained {
            self.ctx.manager.request_cancelled(req);
        }

        self.ctx.transport.close(&reason);

        if let Some(have) = retracted.filter(|have| !have.is_empty()) {
            self.ctx.manager.availability_removed(&have);
        }

        self.inner.lock().advance(ConnectionState::Disconnected);
        self.ctx.manager.peer_closed(self.addr, &reason);

        if let Some((id, record)) = record {
            self.ctx.services.reconnects.insert(id, record);
        }
        info!(peer = %self.addr, reason = %reason, cancelled = drained.len(), "connection closed");
    }

    /// Whether a close has started; set once and never cleared.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Reports protocol bytes counted by the transport.
    pub fn record_protocol_bytes(&self, received: u64, sent: u64) {
        let stats = self.stats();
        stats.add_protocol_received(received);
        stats.add_protocol_sent(sent);
    }

    /// The peer's socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The peer id we present in our handshake.
    pub fn local_id(&self) -> PeerId {
        self.ctx.local_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// The extension dialect negotiated from the reserved bytes.
    pub fn dialect(&self) -> Dialect {
        self.inner.lock().dialect
    }

    /// Extension messages the peer announced, with their versions.
    pub fn message_versions(&self) -> MessageVersions {
        self.inner.lock().versions.clone()
    }

    /// Whether the peer announced the named extension message.
    pub fn supports_message(&self, kind: &str) -> bool {
        self.inner.lock().versions.supports(kind)
    }

    /// The peer's id, once its handshake is in.
    pub fn remote_id(&self) -> Option<PeerId> {
        self.inner.lock().remote_id
    }

    /// Client name and version as the peer reported it.
    pub fn client(&self) -> String {
        self.inner.lock().client.clone()
    }

    /// What the peer's reserved bytes announced, once its handshake is in.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.inner.lock().capabilities
    }

    /// Whether both sides enabled the fast extension.
    pub fn fast_extension(&self) -> bool {
        self.inner.lock().fast
    }

    /// Whether the peer takes peer exchange messages.
    pub fn pex_supported(&self) -> bool {
        self.inner.lock().pex_supported
    }

    /// Our session id, derived from the peer's address at handshake.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.lock().session_id
    }

    /// The peer's session id from its vendor handshake.
    pub fn peer_session_id(&self) -> Option<SessionId> {
        self.inner.lock().peer_session_id
    }

    /// Whether this connection resumed a recently closed one.
    pub fn is_reconnect(&self) -> bool {
        self.inner.lock().is_reconnect
    }

    /// Shared transfer counters; carried over on a reconnect.
    pub fn stats(&self) -> Arc<PeerStats> {
        Arc::clone(&self.inner.lock().stats)
    }

    /// Per-connection rate limits.
    pub fn rate_limits(&self) -> RateLimits {
        self.inner.lock().rate_limits
    }

    /// Replaces the per-connection rate limits.
    pub fn set_rate_limits(&self, limits: RateLimits) {
        self.inner.lock().rate_limits = limits;
    }

    /// Whether the peer is snubbed for not delivering requested data.
    pub fn is_snubbed(&self) -> bool {
        self.inner.lock().snubbed
    }

    /// Marks or clears the snub.
    pub fn set_snubbed(&self, snubbed: bool) {
        self.inner.lock().snubbed = snubbed;
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.lock().close_reason.clone()
    }

    /// The transport mode most recently chosen from the observed rates.
    pub fn transport_mode(&self) -> TransportMode {
        self.inner.lock().transport_mode
    }

    /// How many blocks the disk layer may read ahead for this peer.
    pub fn read_ahead(&self) -> usize {
        self.inner.lock().read_ahead
    }

    /// DHT port the peer announced.
    pub fn dht_port(&self) -> Option<u16> {
        self.inner.lock().dht_port
    }

    /// The peer's listen port, if it told us.
    pub fn remote_port(&self) -> Option<u16> {
        self.inner.lock().remote_port
    }

    /// Metadata size the peer advertised.
    pub fn metadata_size(&self) -> Option<u32> {
        self.inner.lock().metadata_size
    }

    /// The raw statistics dictionary from the last vendor stats reply.
    pub fn remote_stats(&self) -> Option<Value> {
        self.inner.lock().remote_stats.clone()
    }

    /// Pieces the peer suggested, oldest first.
    pub fn suggested_pieces(&self) -> Vec<u32> {
        self.inner.lock().suggested.clone()
    }
}

impl Evict for PeerConnection {
    fn evict(&self, reason: CloseReason) {
        self.close(reason);
    }
}

fn fast_only(msg: &Message) -> bool {
    matches!(
        msg,
        Message::HaveAll
            | Message::HaveNone
            | Message::Reject(_)
            | Message::AllowedFast(_)
            | Message::Suggest(_)
    )
}
