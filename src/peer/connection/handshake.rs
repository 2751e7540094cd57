//! Handshake validation, dialect switch and the move to transferring.

use bytes::Bytes;
use rand::Rng as _;
use std::net::IpAddr;
use std::sync::Weak;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::transfer::LocalSnapshot;
use super::{Action, ConnectionState, Inner, PeerConnection};
use crate::constants::{ALLOWED_FAST_PEER_PIECE_MAX, LAZY_FIRST_DELAY_MS, LAZY_GAP_MS};
use crate::peer::availability::lazy_bitfield;
use crate::peer::bitfield::Bitfield;
use crate::peer::codec::{PeerMessage, WireCodec};
use crate::peer::error::PeerError;
use crate::peer::extension::{ExtensionHandshake, ExtensionMessage, LOCAL_EXTENSIONS, UT_PEX};
use crate::peer::message::{Handshake, Message};
use crate::peer::negotiate::{decide_dialect, local_reserved, Capabilities, Dialect, MessageVersions};
use crate::peer::peer_id::{fully_supports_fast, PeerId};
use crate::peer::reconnect::SessionId;
use crate::peer::registry::Evict;
use crate::peer::vendor::{
    HandshakeType, VendorHandshake, VendorMessage, AZ_PEER_EXCHANGE, LOCAL_VENDOR_MESSAGES,
};

impl PeerConnection {
    /// The transport is up. Outgoing connections send their handshake now,
    /// incoming ones wait for the peer's.
    pub fn connected(&self, now: Instant) {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Connecting || self.is_closing() {
            return;
        }
        inner.connected_at = now;
        inner.last_message_received = now;
        if self.ctx.outgoing {
            let hs = self.local_handshake();
            inner.send(PeerMessage::Handshake(hs), now);
            inner.advance(ConnectionState::Handshaking);
        } else {
            inner.last_sent = now;
            inner.advance(ConnectionState::WaitingForHandshake);
        }
        self.flush_guard(inner);
    }

    fn local_handshake(&self) -> Handshake {
        Handshake::new(
            self.ctx.info_hash,
            *self.ctx.local_id.as_bytes(),
            local_reserved(&self.ctx.config),
        )
    }

    pub(super) fn on_handshake(&self, hs: Handshake, now: Instant) -> Result<(), PeerError> {
        let state = self.inner.lock().state;
        if !matches!(
            state,
            ConnectionState::WaitingForHandshake | ConnectionState::Handshaking
        ) {
            return Err(PeerError::InvalidMessage("unexpected handshake".into()));
        }

        let ctx = &self.ctx;
        if hs.info_hash != ctx.info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        if hs.peer_id == *ctx.local_id.as_bytes() {
            return Err(PeerError::SelfConnection);
        }
        let remote = PeerId(hs.peer_id);
        let client = remote.client_name();
        if ctx.services.registry.is_banned(&client) {
            return Err(PeerError::BannedClient(client));
        }

        let evict: Weak<dyn Evict> = self.me.clone();
        let registration = ctx.services.registry.register(
            ctx.info_hash,
            hs.peer_id,
            self.addr,
            ctx.class,
            &ctx.config,
            evict,
        )?;

        let caps = Capabilities::from_handshake(&hs);
        let dialect = decide_dialect(ctx.config.messaging_mode, &caps, &client);
        let metadata_download = ctx.manager.is_metadata_download();
        let session_id = SessionId::derive(&ctx.services.secret, &ctx.info_hash, self.addr.ip());
        let record = ctx.services.reconnects.take(&session_id, now);
        let secondary: Option<PeerMessage> = match dialect {
            Dialect::Classic => None,
            Dialect::Ltep => {
                Some(ExtensionMessage::Handshake(self.local_ltep_handshake(metadata_download)).into())
            }
            Dialect::Vendor => {
                let reconnect = record.as_ref().and_then(|r| r.peer_session_id);
                let hs = self.local_vendor_handshake(session_id, reconnect, metadata_download);
                Some(VendorMessage::Handshake(hs).into())
            }
        };

        let mut inner = self.inner.lock();
        if self.is_closing() {
            drop(inner);
            ctx.services.registry.unregister(&registration);
            return Ok(());
        }
        inner.registration = Some(registration);
        inner.remote_id = Some(remote);
        inner.client = client;
        inner.capabilities = Some(caps);
        inner.fast = ctx.config.fast_extension && caps.fast;
        inner.dht = ctx.config.dht_port.is_some() && caps.dht;
        inner.dialect = dialect;
        inner.session_id = Some(session_id);

        if let Some(record) = record {
            info!(peer = %self.addr, session = ?session_id, "resuming previous session");
            inner.resume(record);
        }

        if inner.state == ConnectionState::WaitingForHandshake {
            let hs = self.local_handshake();
            inner.send(PeerMessage::Handshake(hs), now);
        }
        inner.advance(ConnectionState::Handshaking);
        info!(peer = %self.addr, client = %inner.client, ?dialect, fast = inner.fast, "handshake accepted");

        let establish = match dialect {
            Dialect::Classic => true,
            Dialect::Ltep => {
                inner.push(Action::SetCodec(WireCodec::Ltep {
                    remote: Default::default(),
                }));
                !metadata_download
            }
            Dialect::Vendor => {
                inner.push(Action::SetCodec(WireCodec::Vendor {
                    versions: MessageVersions::new(),
                }));
                true
            }
        };
        if let Some(msg) = secondary {
            inner.send(msg, now);
        }
        self.flush_guard(inner);

        if establish {
            self.establish(now);
        }
        Ok(())
    }

    fn local_ltep_handshake(&self, metadata_download: bool) -> ExtensionHandshake {
        let config = &self.ctx.config;
        let mut hs = ExtensionHandshake::local();
        hs.client = Some(format!("{} {}", config.client_name, config.client_version));
        hs.port = Some(config.tcp_port);
        hs.crypto_requested = config.crypto_requested;
        hs.ipv6 = config.ipv6;
        hs.yourip = Some(ip_bytes(self.addr.ip()));
        if !metadata_download {
            hs.metadata_size = self.local_metadata_size();
            hs.upload_only = self.ctx.manager.is_seeding();
        }
        hs
    }

    fn local_vendor_handshake(
        &self,
        session_id: SessionId,
        reconnect: Option<SessionId>,
        metadata_download: bool,
    ) -> VendorHandshake {
        let config = &self.ctx.config;
        VendorHandshake {
            identity: Bytes::copy_from_slice(self.ctx.local_id.as_bytes()),
            session_id: Some(session_id),
            reconnect_session_id: reconnect,
            client: config.client_name.clone(),
            version: config.client_version.clone(),
            tcp_port: config.tcp_port,
            udp_port: config.udp_port,
            udp2_port: config.udp2_port,
            ipv6: config.ipv6,
            metadata_size: if metadata_download {
                None
            } else {
                self.local_metadata_size()
            },
            messages: LOCAL_VENDOR_MESSAGES
                .iter()
                .map(|(id, version)| ((*id).to_string(), *version))
                .collect(),
            handshake_type: if config.crypto_requested {
                HandshakeType::Crypto
            } else {
                HandshakeType::Plain
            },
        }
    }

    fn local_metadata_size(&self) -> Option<u32> {
        self.ctx
            .manager
            .metadata()
            .and_then(|md| u32::try_from(md.len()).ok())
    }

    pub(super) fn on_ltep_handshake(
        &self,
        hs: ExtensionHandshake,
        now: Instant,
    ) -> Result<(), PeerError> {
        let metadata_download = self.ctx.manager.is_metadata_download();
        let mut inner = self.inner.lock();
        if inner.dialect != Dialect::Ltep {
            return Err(PeerError::InvalidMessage(
                "extension handshake outside the extension protocol".into(),
            ));
        }

        inner.versions = MessageVersions::intersect(
            LOCAL_EXTENSIONS.iter().map(|(name, _)| (*name, 1)),
            hs.extensions.keys().map(|name| (name.as_str(), 1)),
        );
        if let Some(client) = &hs.client {
            inner.client = client.clone();
        }
        inner.remote_port = hs.port.or(inner.remote_port);
        inner.metadata_size = hs.metadata_size.or(inner.metadata_size);
        inner.availability.set_upload_only(hs.upload_only);
        debug!(
            peer = %self.addr,
            extensions = ?hs.extensions.keys().collect::<Vec<_>>(),
            "extension handshake"
        );
        inner.push(Action::SetCodec(WireCodec::Ltep {
            remote: hs.extensions,
        }));
        self.resolve_capabilities(&mut inner);

        let establish = inner.state == ConnectionState::Handshaking && metadata_download;
        if establish && inner.metadata_size.is_none() {
            return Err(PeerError::Closed("peer has no metadata to offer".into()));
        }
        let transferring = inner.is_transferring();
        self.flush_guard(inner);

        if establish {
            self.establish(now);
        } else if transferring {
            self.refresh_peer(now);
        }
        Ok(())
    }

    pub(super) fn on_vendor_handshake(
        &self,
        hs: VendorHandshake,
        now: Instant,
    ) -> Result<(), PeerError> {
        let (dialect, resumed) = {
            let inner = self.inner.lock();
            (inner.dialect, inner.is_reconnect)
        };
        if dialect != Dialect::Vendor {
            return Err(PeerError::InvalidMessage(
                "vendor handshake outside vendor messaging".into(),
            ));
        }
        // The peer may remember us under the session id of an earlier
        // connection from another address.
        let record = hs
            .reconnect_session_id
            .filter(|_| !resumed)
            .and_then(|id| self.ctx.services.reconnects.take(&id, now));

        let mut inner = self.inner.lock();
        if let Some(record) = record {
            info!(peer = %self.addr, session = ?hs.reconnect_session_id, "peer resumed previous session");
            inner.resume(record);
        }

        inner.versions = MessageVersions::intersect(
            LOCAL_VENDOR_MESSAGES,
            hs.messages.iter().map(|(id, version)| (id.as_str(), *version)),
        );
        let versions = inner.versions.clone();
        inner.push(Action::SetCodec(WireCodec::Vendor { versions }));
        if !hs.client.is_empty() {
            inner.client = format!("{} {}", hs.client, hs.version).trim_end().to_string();
        }
        if hs.tcp_port != 0 {
            inner.remote_port = Some(hs.tcp_port);
        }
        inner.metadata_size = hs.metadata_size.or(inner.metadata_size);
        if hs.session_id.is_some() {
            inner.peer_session_id = hs.session_id;
        }
        debug!(
            peer = %self.addr,
            client = %inner.client,
            messages = inner.versions.len(),
            "vendor handshake"
        );
        self.resolve_capabilities(&mut inner);
        self.flush_guard(inner);
        Ok(())
    }

    /// Moves to transferring. Runs once, however often it is called.
    pub(super) fn establish(&self, now: Instant) {
        let superseeding = self.ctx.manager.is_superseeding();
        let done = self.ctx.manager.have_pieces();
        {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Handshaking || self.is_closing() {
                return;
            }
            inner.advance(ConnectionState::Transferring);
            inner.established_at = Some(now);
            inner.push(Action::ResumeDecoding);

            self.send_bitfield(&mut inner, superseeding, &done, now);
            if inner.dht {
                if let Some(port) = self.ctx.config.dht_port {
                    inner.send(Message::Port(port), now);
                }
            }
            self.resolve_capabilities(&mut inner);

            info!(peer = %self.addr, dialect = ?inner.dialect, "connection established");
            self.flush_guard(inner);
        }
        self.refresh_peer(now);
    }

    fn send_bitfield(&self, inner: &mut Inner, superseeding: bool, done: &Bitfield, now: Instant) {
        let fast = inner.fast;
        if superseeding || done.is_empty() {
            if fast {
                inner.send(Message::HaveNone, now);
            }
            return;
        }

        if self.ctx.config.lazy_bitfield {
            let mut rng = rand::rng();
            let lazy = lazy_bitfield(done, &mut rng);
            inner.send(Message::Bitfield(lazy.bitfield.to_bytes()), now);

            let mut due = now + Duration::from_millis(rng.random_range(LAZY_FIRST_DELAY_MS.0..=LAZY_FIRST_DELAY_MS.1));
            for piece in lazy.withheld {
                inner.lazy_haves.push_back((due, piece));
                due += Duration::from_millis(rng.random_range(LAZY_GAP_MS.0..=LAZY_GAP_MS.1));
            }
            return;
        }

        if done.is_full() && fast {
            inner.send(Message::HaveAll, now);
        } else {
            inner.send(Message::Bitfield(done.to_bytes()), now);
        }
    }

    /// Decides which optional exchanges the two sides share.
    fn resolve_capabilities(&self, inner: &mut Inner) {
        inner.pex_supported = self.ctx.config.enable_pex
            && match inner.dialect {
                Dialect::Classic => false,
                Dialect::Ltep => inner.versions.supports(UT_PEX),
                Dialect::Vendor => inner.versions.supports(AZ_PEER_EXCHANGE),
            };
    }

    /// Keeps both allowed-fast sets in line with what each side has, and
    /// makes our offer once it is worth making. `offer` holds the generated
    /// pieces with their byte budgets.
    pub(super) fn check_fast(
        &self,
        inner: &mut Inner,
        local: &LocalSnapshot,
        offer: Option<Vec<(u32, u64)>>,
        now: Instant,
    ) {
        if !inner.fast || !inner.is_transferring() {
            return;
        }
        if local.done.count() > ALLOWED_FAST_PEER_PIECE_MAX as usize && !inner.grant.is_empty() {
            inner.grant.clear();
            inner.overlay = None;
            if inner.really_choked {
                inner.effectively_choked = true;
            }
        }

        if inner.availability.count() >= ALLOWED_FAST_PEER_PIECE_MAX as usize {
            inner.offer.clear();
            return;
        }
        let Some(offer) = offer else {
            return;
        };
        if inner.offer.was_generated()
            || !local.upload_allowed
            || !local.fast_offer_allowed
            || inner.availability.is_seed()
            || inner.availability.is_relative_seed()
            || !fully_supports_fast(&inner.client)
        {
            return;
        }

        let pieces: Vec<u32> = offer.iter().map(|&(piece, _)| piece).collect();
        inner.offer.offer(&pieces, |piece| {
            offer
                .iter()
                .find(|&&(p, _)| p == piece)
                .map_or(0, |&(_, budget)| budget)
        });
        for &piece in &pieces {
            inner.send(Message::AllowedFast(piece), now);
        }
        debug!(peer = %self.addr, ?pieces, "offered allowed-fast set");
    }
}

fn ip_bytes(ip: IpAddr) -> Bytes {
    match ip {
        IpAddr::V4(v4) => Bytes::copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => Bytes::copy_from_slice(&v6.octets()),
    }
}
