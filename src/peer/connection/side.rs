//! Extension traffic: peer exchange, metadata, hints, stats and hashes.
//!
//! Metadata requests go through the same ledger as block requests, keyed as
//! `(piece, 0, block length)`, so late blocks are recognised the same way.

use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::debug;

use super::transfer::classify;
use super::{Action, Inner, PeerConnection};
use crate::bencode::Value;
use crate::constants::{
    HASH_REQUEST_BACKLOG_MAX, PEX_FLOOD_MAX, PEX_FLOOD_WINDOW, REQUEST_HINT_MAX_LIFE,
};
use crate::peer::codec::PeerMessage;
use crate::peer::error::PeerError;
use crate::peer::extension::{ExtensionMessage, UPLOAD_ONLY, UT_METADATA, UT_PEX};
use crate::peer::limiter::Limited;
use crate::peer::message::{HashRequest, Message};
use crate::peer::metadata::{self, MetadataMessage};
use crate::peer::negotiate::Dialect;
use crate::peer::piece::BlockRequest;
use crate::peer::stats::BlockOutcome;
use crate::peer::vendor::{
    RequestHint, VendorMessage, AZ_BAD_PIECE, AZ_METADATA, AZ_PEER_EXCHANGE, AZ_REQUEST_HINT,
    AZ_STAT_REPLY, AZ_STAT_REQUEST,
};
use crate::pex::PexMessage;

impl PeerConnection {
    pub(super) fn on_extension(&self, ext: ExtensionMessage, now: Instant) -> Result<(), PeerError> {
        match ext {
            ExtensionMessage::Handshake(hs) => self.on_ltep_handshake(hs, now),
            ExtensionMessage::Pex(volley) => self.on_pex(volley, now),
            ExtensionMessage::Metadata(msg) => self.on_metadata(msg, now),
            ExtensionMessage::UploadOnly(flag) => {
                self.inner.lock().availability.set_upload_only(flag);
                self.refresh_peer(now);
                Ok(())
            }
            ExtensionMessage::Unknown { id, .. } => {
                debug!(peer = %self.addr, id, "unknown extension message");
                Ok(())
            }
        }
    }

    pub(super) fn on_vendor(&self, msg: VendorMessage, now: Instant) -> Result<(), PeerError> {
        match msg {
            VendorMessage::Handshake(hs) => self.on_vendor_handshake(hs, now),
            VendorMessage::Have(pieces) => {
                if !self.inner.lock().is_transferring() {
                    return Err(PeerError::Discarded("have before handshake completed".into()));
                }
                self.on_have(&pieces, now)
            }
            VendorMessage::Pex { info_hash, volley } => {
                if info_hash != self.ctx.info_hash {
                    return Err(PeerError::Discarded("peer exchange for another swarm".into()));
                }
                self.on_pex(volley, now)
            }
            VendorMessage::Metadata(msg) => self.on_metadata(msg, now),
            VendorMessage::RequestHint(hint) => {
                let life = Duration::from_millis(u64::from(hint.life_ms))
                    .min(REQUEST_HINT_MAX_LIFE);
                self.inner.lock().request_hint = Some((hint, now + life));
                Ok(())
            }
            VendorMessage::BadPiece(piece) => {
                self.inner.lock().push(Action::BadPiece(piece));
                self.flush();
                Ok(())
            }
            VendorMessage::StatsRequest(_) => {
                let mut inner = self.inner.lock();
                if inner.versions.supports(AZ_STAT_REPLY) {
                    let reply = inner.stats.to_value();
                    inner.send(VendorMessage::StatsReply(reply), now);
                }
                self.flush_guard(inner);
                Ok(())
            }
            VendorMessage::StatsReply(value) => {
                self.inner.lock().remote_stats = Some(value);
                Ok(())
            }
        }
    }

    fn on_pex(&self, volley: PexMessage, now: Instant) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        if !inner.pex_supported {
            return Err(PeerError::Discarded("peer exchange not negotiated".into()));
        }
        if !inner
            .limiter
            .count(Limited::PeerExchange, PEX_FLOOD_MAX, PEX_FLOOD_WINDOW, now)
        {
            return Err(PeerError::Flood("peer exchange"));
        }

        let cap = self.ctx.config.pex_cap(inner.pex_received == 0);
        inner.pex_received += 1;
        if volley.exceeds(cap) {
            return Err(PeerError::Discarded(format!(
                "peer exchange volley of {} added, {} dropped over cap {cap}",
                volley.added.len(),
                volley.dropped.len()
            )));
        }
        inner.push(Action::Pex(volley));
        self.flush_guard(inner);
        Ok(())
    }

    fn on_metadata(&self, msg: MetadataMessage, now: Instant) -> Result<(), PeerError> {
        match msg {
            MetadataMessage::Request { piece } => {
                let manager = &self.ctx.manager;
                let reply = if manager.is_metadata_download() {
                    MetadataMessage::reject(piece)
                } else {
                    manager
                        .metadata()
                        .and_then(|full| {
                            let total_size = u32::try_from(full.len()).ok()?;
                            let data = metadata::block(&full, piece)?;
                            Some(MetadataMessage::Data {
                                piece,
                                total_size,
                                data,
                            })
                        })
                        .unwrap_or_else(|| MetadataMessage::reject(piece))
                };
                let mut inner = self.inner.lock();
                if let Some(reply) = wrap_metadata(&inner, reply) {
                    inner.send(reply, now);
                }
                self.flush_guard(inner);
                Ok(())
            }
            MetadataMessage::Data {
                piece,
                total_size,
                data,
            } => self.on_metadata_block(piece, total_size, data, now),
            MetadataMessage::Reject { piece } => {
                if let Some(entry) = self.ledger.lock().take_piece(piece) {
                    self.inner.lock().push(Action::Cancelled(entry.request));
                    self.flush();
                }
                Ok(())
            }
        }
    }

    fn on_metadata_block(
        &self,
        piece: u32,
        total_size: u32,
        data: Bytes,
        now: Instant,
    ) -> Result<(), PeerError> {
        let len = data.len() as u64;
        let expected = metadata::expected_block_len(piece, total_size);
        if expected.map(u64::from) != Some(len) {
            self.record_outcome(BlockOutcome::Discarded, len);
            return Err(PeerError::Discarded(format!(
                "metadata block {piece} of {len} bytes for size {total_size}"
            )));
        }

        let (live, recent) = {
            let mut ledger = self.ledger.lock();
            let live = ledger.take_piece(piece).is_some();
            if live {
                ledger.reset_clocks(now);
            }
            let key = BlockRequest::new(piece, 0, len as u32);
            (live, ledger.was_recent(&key))
        };

        let outcome = classify(live, false, recent, false);
        if matches!(outcome, BlockOutcome::Completed | BlockOutcome::Recovered) {
            let mut inner = self.inner.lock();
            inner.last_data_received = Some(now);
            inner.push(Action::MetadataBlock(piece, data));
            self.flush_guard(inner);
        }
        self.record_outcome(outcome, len);

        match outcome {
            BlockOutcome::Discarded => Err(PeerError::Discarded(format!(
                "unsolicited metadata block {piece}"
            ))),
            _ => Ok(()),
        }
    }

    pub(super) fn on_hash_request(&self, req: HashRequest, now: Instant) -> Result<(), PeerError> {
        let reply = if self.ctx.transport.queued_protocol_bytes() > HASH_REQUEST_BACKLOG_MAX {
            debug!(peer = %self.addr, "hash request refused, send queue backlogged");
            Message::HashReject(req)
        } else {
            match self.ctx.manager.hash_request(&req) {
                Some(hashes) => Message::Hashes {
                    request: req,
                    hashes,
                },
                None => Message::HashReject(req),
            }
        };
        let mut inner = self.inner.lock();
        inner.send(reply, now);
        self.flush_guard(inner);
        Ok(())
    }

    /// Sends a PEX volley over whichever framework the peer negotiated.
    pub fn send_pex(&self, volley: PexMessage) -> bool {
        let mut inner = self.inner.lock();
        if !inner.is_transferring() || !inner.pex_supported {
            return false;
        }
        let msg = match inner.dialect {
            Dialect::Ltep if inner.versions.supports(UT_PEX) => {
                PeerMessage::Extension(ExtensionMessage::Pex(volley))
            }
            Dialect::Vendor if inner.versions.supports(AZ_PEER_EXCHANGE) => {
                PeerMessage::Vendor(VendorMessage::Pex {
                    info_hash: self.ctx.info_hash,
                    volley,
                })
            }
            _ => return false,
        };
        inner.send(msg, Instant::now());
        self.flush_guard(inner);
        true
    }

    pub fn send_request_hint(&self, hint: RequestHint) -> bool {
        self.send_vendor(AZ_REQUEST_HINT, VendorMessage::RequestHint(hint))
    }

    /// Tells the peer a piece it sent us failed its hash check.
    pub fn send_bad_piece(&self, piece: u32) -> bool {
        self.send_vendor(AZ_BAD_PIECE, VendorMessage::BadPiece(piece))
    }

    pub fn request_stats(&self) -> bool {
        self.send_vendor(AZ_STAT_REQUEST, VendorMessage::StatsRequest(Value::dict()))
    }

    pub fn send_upload_only(&self, upload_only: bool) -> bool {
        let mut inner = self.inner.lock();
        let negotiated = inner.dialect == Dialect::Ltep && inner.versions.supports(UPLOAD_ONLY);
        if !inner.is_transferring() || !negotiated {
            return false;
        }
        inner.send(ExtensionMessage::UploadOnly(upload_only), Instant::now());
        self.flush_guard(inner);
        true
    }

    /// The peer's current request hint, dropped once its lifetime is over.
    pub fn request_hint(&self, now: Instant) -> Option<RequestHint> {
        let mut inner = self.inner.lock();
        let current = inner.request_hint;
        match current {
            Some((hint, expires)) if now < expires => Some(hint),
            Some(_) => {
                inner.request_hint = None;
                None
            }
            None => None,
        }
    }

    fn send_vendor(&self, kind: &str, msg: VendorMessage) -> bool {
        let mut inner = self.inner.lock();
        if !inner.is_transferring()
            || inner.dialect != Dialect::Vendor
            || !inner.versions.supports(kind)
        {
            return false;
        }
        inner.send(msg, Instant::now());
        self.flush_guard(inner);
        true
    }
}

/// Frames a metadata message for the negotiated framework.
fn wrap_metadata(inner: &Inner, msg: MetadataMessage) -> Option<PeerMessage> {
    match inner.dialect {
        Dialect::Ltep if inner.versions.supports(UT_METADATA) => {
            Some(ExtensionMessage::Metadata(msg).into())
        }
        Dialect::Vendor if inner.versions.supports(AZ_METADATA) => {
            Some(VendorMessage::Metadata(msg).into())
        }
        _ => None,
    }
}
