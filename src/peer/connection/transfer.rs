//! Choking, availability and the piece pipeline in both directions.

use parking_lot::MutexGuard;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::{Action, Inner, PeerConnection};
use crate::constants::{
    ALLOWED_FAST_BUDGET_PIECES, ALLOWED_FAST_OFFERED, ALLOWED_FAST_PEER_PIECE_MAX,
    MAX_REQUEST_LENGTH, PRIORITY_NEVER, SNUB_WINDOW,
};
use crate::peer::availability::LocalView;
use crate::peer::bitfield::Bitfield;
use crate::peer::codec::PeerMessage;
use crate::peer::error::PeerError;
use crate::peer::extension::{ExtensionMessage, UT_METADATA};
use crate::peer::fast::{generate_allowed_fast_set, OfferCheck};
use crate::peer::ledger::Issue;
use crate::peer::message::Message;
use crate::peer::metadata::MetadataMessage;
use crate::peer::negotiate::Dialect;
use crate::peer::piece::{Block, BlockRequest};
use crate::peer::stats::BlockOutcome;
use crate::peer::vendor::{VendorMessage, AZ_HAVE, AZ_METADATA};

/// Suggestions kept per connection.
const MAX_SUGGESTED: usize = 32;

/// What the manager reports about our own side, read before locking.
pub(super) struct LocalSnapshot {
    pub(super) done: Bitfield,
    pub(super) seeding: bool,
    pub(super) download_allowed: bool,
    pub(super) any_downloadable: bool,
    pub(super) upload_allowed: bool,
    pub(super) fast_offer_allowed: bool,
}

impl PeerConnection {
    pub(super) fn on_choke(&self) -> Result<(), PeerError> {
        let cancel_all = {
            let mut inner = self.inner.lock();
            if inner.really_choked {
                return Ok(());
            }
            inner.really_choked = true;
            if inner.fast && !inner.grant.is_empty() {
                inner.overlay = Some(inner.grant.overlay(self.piece_count));
                inner.effectively_choked = false;
                false
            } else {
                inner.overlay = None;
                inner.effectively_choked = true;
                true
            }
        };
        trace!(peer = %self.addr, cancel_all, "choked");
        if cancel_all {
            self.cancel_all_requests();
        }
        Ok(())
    }

    pub(super) fn on_unchoke(&self) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        inner.really_choked = false;
        inner.effectively_choked = false;
        inner.overlay = None;
        trace!(peer = %self.addr, "unchoked");
        Ok(())
    }

    pub(super) fn on_interested(&self, interested: bool) -> Result<(), PeerError> {
        self.inner.lock().peer_interested = interested;
        Ok(())
    }

    /// Drops every live request and tells the manager.
    fn cancel_all_requests(&self) {
        let drained = self.ledger.lock().drain();
        if drained.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for req in drained {
            inner.push(Action::Cancelled(req));
        }
        self.flush_guard(inner);
    }

    pub(super) fn on_have(&self, pieces: &[u32], now: Instant) -> Result<(), PeerError> {
        {
            let mut inner = self.inner.lock();
            for &piece in pieces {
                if inner.availability.apply_have(piece)? {
                    inner.push(Action::HaveReceived(piece));
                }
            }
            self.flush_guard(inner);
        }
        self.refresh_peer(now);
        Ok(())
    }

    pub(super) fn on_bitfield(&self, bits: &[u8], now: Instant) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        let old = inner.availability.have_set().cloned();
        let new = inner.availability.apply_bitfield(bits)?.clone();
        self.replace_availability(inner, old, new, now);
        Ok(())
    }

    pub(super) fn on_have_all(&self, now: Instant) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        let old = inner.availability.have_set().cloned();
        let new = inner.availability.apply_have_all().clone();
        self.replace_availability(inner, old, new, now);
        Ok(())
    }

    pub(super) fn on_have_none(&self, now: Instant) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        let old = inner.availability.have_set().cloned();
        let new = inner.availability.apply_have_none().clone();
        self.replace_availability(inner, old, new, now);
        Ok(())
    }

    fn replace_availability(
        &self,
        mut inner: MutexGuard<'_, Inner>,
        old: Option<Bitfield>,
        new: Bitfield,
        now: Instant,
    ) {
        if let Some(old) = old.filter(|old| !old.is_empty()) {
            inner.push(Action::AvailabilityRemoved(old));
        }
        if !new.is_empty() {
            inner.push(Action::AvailabilityAdded(new));
        }
        self.flush_guard(inner);
        self.refresh_peer(now);
    }

    /// Reads the manager's view of our side. Must be called with no
    /// connection lock held.
    pub(super) fn local_snapshot(&self) -> LocalSnapshot {
        let manager = &self.ctx.manager;
        LocalSnapshot {
            done: manager.have_pieces(),
            seeding: manager.is_seeding(),
            download_allowed: manager.is_download_allowed(),
            any_downloadable: manager.has_downloadable_piece(),
            upload_allowed: manager.is_upload_allowed(),
            fast_offer_allowed: manager.allow_fast_offer(self.addr),
        }
    }

    /// Re-evaluates seed status, interest and the allowed-fast sets after
    /// either side's pieces changed.
    ///
    /// The manager is queried between two short locks: the first copies the
    /// peer's have-set, the second commits the result.
    pub(super) fn refresh_peer(&self, now: Instant) {
        let (have, offer_pending) = {
            let inner = self.inner.lock();
            if !inner.is_transferring() {
                return;
            }
            (
                inner.availability.have_set().cloned(),
                inner.fast && !inner.offer.was_generated(),
            )
        };

        let manager = &self.ctx.manager;
        let local = self.local_snapshot();
        let mut interesting = Bitfield::new(self.piece_count as usize);
        for piece in have.iter().flat_map(|have| have.ones()) {
            if manager.is_piece_interesting(piece as u32) {
                interesting.set(piece);
            }
        }
        let offer = offer_pending.then(|| {
            generate_allowed_fast_set(
                &self.ctx.info_hash,
                self.addr.ip(),
                self.piece_count,
                ALLOWED_FAST_OFFERED,
            )
            .into_iter()
            .map(|piece| {
                let budget = ALLOWED_FAST_BUDGET_PIECES * u64::from(manager.piece_length(piece));
                (piece, budget)
            })
            .collect::<Vec<_>>()
        });

        let mut inner = self.inner.lock();
        if !inner.is_transferring() {
            return;
        }
        let view = LocalView {
            seeding: local.seeding,
            done: &local.done,
            needed: |piece: u32| interesting.has(piece as usize),
        };
        inner.availability.check_seed(&view);
        self.update_interest(&mut inner, &local, &interesting, now);
        self.check_fast(&mut inner, &local, offer, now);
        self.flush_guard(inner);
    }

    fn update_interest(
        &self,
        inner: &mut Inner,
        local: &LocalSnapshot,
        interesting: &Bitfield,
        now: Instant,
    ) {
        let wanted = inner.availability.compute_interest(
            local.download_allowed,
            local.any_downloadable,
            |piece| interesting.has(piece as usize),
        );
        let Some(wanted) = wanted else {
            return;
        };
        if wanted != inner.am_interested {
            inner.am_interested = wanted;
            let msg = if wanted {
                Message::Interested
            } else {
                Message::NotInterested
            };
            inner.send(msg, now);
        }
    }

    /// Recomputes interest after the manager's view of the swarm changed.
    pub fn check_interest(&self) {
        self.refresh_peer(Instant::now());
    }

    pub(super) fn on_request(&self, req: BlockRequest, now: Instant) -> Result<(), PeerError> {
        if req.length == 0
            || req.length > MAX_REQUEST_LENGTH
            || !self.ctx.manager.validate_read_request(&req)
        {
            return Err(PeerError::InvalidRequest {
                piece: req.piece,
                offset: req.offset,
                length: req.length,
            });
        }

        let upload_allowed = self.ctx.manager.is_upload_allowed();
        let mut inner = self.inner.lock();
        let admitted = if !upload_allowed {
            false
        } else if inner.am_choking {
            match inner.offer.check(req.piece, req.length) {
                OfferCheck::Allowed => true,
                OfferCheck::OverBudget => {
                    debug!(peer = %self.addr, piece = req.piece, "allowed-fast budget exhausted");
                    inner.push(Action::BadFastUse);
                    false
                }
                OfferCheck::NotOffered => false,
            }
        } else {
            true
        };

        if !admitted {
            if inner.fast {
                inner.send(Message::Reject(req), now);
            } else {
                trace!(peer = %self.addr, piece = req.piece, "ignoring request while choking");
            }
        } else if !inner.upload_queue.contains(&req) {
            inner.upload_queue.push(req);
            inner.push(Action::QueueRead(req));
        }
        self.flush_guard(inner);
        Ok(())
    }

    pub(super) fn on_cancel(&self, req: BlockRequest) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        inner.upload_queue.retain(|queued| *queued != req);
        Ok(())
    }

    pub(super) fn on_piece(&self, block: Block, now: Instant) -> Result<(), PeerError> {
        let req = block.request();
        let len = u64::from(req.length);
        let manager = &self.ctx.manager;
        let stats = {
            let mut inner = self.inner.lock();
            inner.last_data_received = Some(now);
            Arc::clone(&inner.stats)
        };
        stats.add_data_received(len);

        if !manager.validate_block(req.piece, req.offset, req.length) {
            self.record_outcome(BlockOutcome::Discarded, len);
            return Err(PeerError::Discarded(format!(
                "invalid block piece {} offset {} length {}",
                req.piece, req.offset, req.length
            )));
        }

        let written = manager.is_block_written(req.piece, req.offset);
        let endgame = manager.is_endgame();
        let (live, outcome) = {
            let mut ledger = self.ledger.lock();
            let live = ledger.take(&req, now).is_some();
            let outcome = classify(live, written, ledger.was_recent(&req), endgame);
            if live || outcome == BlockOutcome::Recovered {
                ledger.reset_clocks(now);
            }
            (live, outcome)
        };

        {
            let mut inner = self.inner.lock();
            let timely = inner
                .last_good_data
                .is_some_and(|t| now.saturating_duration_since(t) <= SNUB_WINDOW);
            match outcome {
                BlockOutcome::Completed | BlockOutcome::Recovered => {
                    if timely {
                        inner.snubbed = false;
                    }
                    inner.last_good_data = Some(now);
                    inner.push(Action::Write(block, outcome == BlockOutcome::Recovered));
                }
                BlockOutcome::Discarded | BlockOutcome::DiscardedEndgame if live && timely => {
                    inner.snubbed = false;
                }
                _ => {}
            }
            self.flush_guard(inner);
        }

        self.record_outcome(outcome, len);
        match outcome {
            BlockOutcome::Discarded if !live => Err(PeerError::Discarded(format!(
                "unsolicited block piece {} offset {}",
                req.piece, req.offset
            ))),
            BlockOutcome::Discarded | BlockOutcome::DiscardedEndgame => {
                debug!(peer = %self.addr, piece = req.piece, offset = req.offset, ?outcome, "duplicate block");
                Ok(())
            }
            _ => {
                trace!(peer = %self.addr, piece = req.piece, offset = req.offset, ?outcome, "block received");
                Ok(())
            }
        }
    }

    pub(super) fn record_outcome(&self, outcome: BlockOutcome, len: u64) {
        self.ctx.services.counters.record(outcome);
        if matches!(outcome, BlockOutcome::Discarded | BlockOutcome::DiscardedEndgame) {
            self.stats().add_discarded(len);
        }
    }

    pub(super) fn on_reject(&self, req: BlockRequest) -> Result<(), PeerError> {
        if !self.ledger.lock().cancel(&req) {
            debug!(peer = %self.addr, piece = req.piece, offset = req.offset, "reject for unknown request");
            return Ok(());
        }
        let mut inner = self.inner.lock();
        inner.push(Action::Cancelled(req));
        if inner.grant.remove(req.piece) && inner.really_choked {
            if inner.grant.is_empty() {
                inner.overlay = None;
                inner.effectively_choked = true;
            } else {
                inner.overlay = Some(inner.grant.overlay(self.piece_count));
            }
        }
        self.flush_guard(inner);
        Ok(())
    }

    pub(super) fn on_allowed_fast(&self, piece: u32) -> Result<(), PeerError> {
        if piece >= self.piece_count {
            return Err(PeerError::InvalidMessage(format!("allowed fast for piece {piece}")));
        }
        if self.ctx.manager.have_pieces().count() > ALLOWED_FAST_PEER_PIECE_MAX as usize {
            trace!(peer = %self.addr, piece, "ignoring allowed fast, enough pieces already");
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.grant.insert(piece) && inner.really_choked {
            inner.overlay = Some(inner.grant.overlay(self.piece_count));
            inner.effectively_choked = false;
        }
        Ok(())
    }

    pub(super) fn on_suggest(&self, piece: u32) -> Result<(), PeerError> {
        if piece >= self.piece_count {
            return Err(PeerError::Discarded(format!("suggestion for piece {piece}")));
        }
        let mut inner = self.inner.lock();
        if !inner.suggested.contains(&piece) {
            if inner.suggested.len() == MAX_SUGGESTED {
                inner.suggested.remove(0);
            }
            inner.suggested.push(piece);
        }
        Ok(())
    }

    /// Issues a request. Returns the request when it went out, or when it
    /// was already live and `return_duplicates` is set; `None` otherwise.
    pub fn request(&self, req: BlockRequest, return_duplicates: bool) -> Option<BlockRequest> {
        self.request_at(req, return_duplicates, Instant::now())
    }

    /// `request` with an explicit clock.
    pub fn request_at(
        &self,
        req: BlockRequest,
        return_duplicates: bool,
        now: Instant,
    ) -> Option<BlockRequest> {
        if self.is_closing() {
            return None;
        }
        let metadata = self.ctx.manager.is_metadata_download();
        let mut inner = self.inner.lock();
        if !inner.is_transferring() {
            return None;
        }

        let msg = if metadata {
            let msg = MetadataMessage::request(req.piece);
            match inner.dialect {
                Dialect::Ltep if inner.versions.supports(UT_METADATA) => {
                    PeerMessage::Extension(ExtensionMessage::Metadata(msg))
                }
                Dialect::Vendor if inner.versions.supports(AZ_METADATA) => {
                    PeerMessage::Vendor(VendorMessage::Metadata(msg))
                }
                _ => return None,
            }
        } else {
            let admitted = match &inner.overlay {
                Some(overlay) => overlay
                    .get(req.piece as usize)
                    .is_some_and(|&p| p != PRIORITY_NEVER),
                None => !inner.effectively_choked,
            };
            if !admitted {
                return None;
            }
            PeerMessage::Core(Message::Request(req))
        };

        match self.ledger.lock().issue(req, now) {
            Issue::New => {}
            Issue::Duplicate => return return_duplicates.then_some(req),
        }
        trace!(peer = %self.addr, piece = req.piece, offset = req.offset, "request");
        inner.send(msg, now);
        self.flush_guard(inner);
        Some(req)
    }

    /// Withdraws a live request. Data that still arrives is recovered.
    pub fn cancel_request(&self, req: &BlockRequest) -> bool {
        if !self.ledger.lock().cancel(req) {
            return false;
        }
        let metadata = self.ctx.manager.is_metadata_download();
        let mut inner = self.inner.lock();
        if inner.is_transferring() && !metadata {
            inner.send(Message::Cancel(*req), Instant::now());
        }
        self.flush_guard(inner);
        true
    }

    /// Live requests older than `max_age`.
    pub fn expired_requests(&self, now: Instant, max_age: Duration) -> Vec<BlockRequest> {
        self.ledger.lock().expired(now, max_age)
    }

    /// Live requests in issue order.
    pub fn outstanding_requests(&self) -> Vec<BlockRequest> {
        self.ledger.lock().requests()
    }

    /// Round trip of the first request, once its block came back.
    pub fn latency(&self) -> Option<Duration> {
        self.ledger.lock().latency()
    }

    /// Chokes the peer. Queued requests outside the allowed-fast offer are
    /// dropped, and rejected if fast.
    pub fn send_choke(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.am_choking || !inner.is_transferring() {
            return;
        }
        inner.am_choking = true;
        inner.send(Message::Choke, now);

        let queue = std::mem::take(&mut inner.upload_queue);
        let (keep, dropped): (Vec<_>, Vec<_>) = queue
            .into_iter()
            .partition(|req| inner.offer.contains(req.piece));
        inner.upload_queue = keep;
        if inner.fast {
            for req in dropped {
                inner.send(Message::Reject(req), now);
            }
        }
        self.flush_guard(inner);
    }

    /// Unchokes the peer.
    pub fn send_unchoke(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if !inner.am_choking || !inner.is_transferring() {
            return;
        }
        inner.am_choking = false;
        inner.send(Message::Unchoke, now);
        self.flush_guard(inner);
    }

    /// Announces a piece we just completed.
    pub fn send_have(&self, piece: u32) {
        let now = Instant::now();
        let superseeding = self.ctx.manager.is_superseeding();
        {
            let mut inner = self.inner.lock();
            if !inner.is_transferring() {
                return;
            }
            inner.lazy_haves.retain(|(_, p)| *p != piece);
            if !superseeding {
                if inner.dialect == Dialect::Vendor && inner.versions.supports(AZ_HAVE) {
                    inner.send(VendorMessage::Have(vec![piece]), now);
                } else {
                    inner.send(Message::Have(piece), now);
                }
            }
            self.flush_guard(inner);
        }
        self.refresh_peer(now);
    }

    /// Sends a block read from disk, unless the peer cancelled it or we
    /// choked it in the meantime.
    pub fn send_piece(&self, block: Block) -> bool {
        let now = Instant::now();
        let req = block.request();
        let mut inner = self.inner.lock();
        if !inner.is_transferring() || self.is_closing() {
            return false;
        }
        let Some(pos) = inner.upload_queue.iter().position(|queued| *queued == req) else {
            trace!(peer = %self.addr, piece = req.piece, "block no longer wanted");
            return false;
        };
        if inner.am_choking {
            if inner.offer.check(req.piece, req.length) != OfferCheck::Allowed {
                return false;
            }
            inner.offer.charge(req.piece, req.length);
        }
        inner.upload_queue.remove(pos);
        inner.stats.add_data_sent(u64::from(req.length));
        inner.send(Message::Piece(block), now);
        self.flush_guard(inner);
        true
    }

    /// Peer requests waiting for a disk read.
    pub fn queued_uploads(&self) -> Vec<BlockRequest> {
        self.inner.lock().upload_queue.clone()
    }

    /// Whether the peer is choking us.
    pub fn is_choked(&self) -> bool {
        self.inner.lock().really_choked
    }

    /// Choked, or unchoked but with nothing the peer has that we need.
    pub fn is_effectively_choked(&self) -> bool {
        self.inner.lock().effectively_choked
    }

    /// Whether we are choking the peer.
    pub fn is_choking(&self) -> bool {
        self.inner.lock().am_choking
    }

    /// Whether we are interested in the peer.
    pub fn is_interested(&self) -> bool {
        self.inner.lock().am_interested
    }

    /// Whether the peer is interested in us.
    pub fn is_peer_interested(&self) -> bool {
        self.inner.lock().peer_interested
    }

    /// Per-piece request priority while choked with allowed-fast pieces.
    pub fn priority_overlay(&self) -> Option<Vec<i32>> {
        self.inner.lock().overlay.clone()
    }

    /// Pieces the peer allowed us to request while choked.
    pub fn allowed_fast_granted(&self) -> Vec<u32> {
        self.inner.lock().grant.iter().collect()
    }

    /// Whether we offered `piece` to the peer as allowed-fast.
    pub fn is_allowed_fast_offered(&self, piece: u32) -> bool {
        self.inner.lock().offer.contains(piece)
    }

    /// Whether the peer has `piece`.
    pub fn peer_has(&self, piece: u32) -> bool {
        self.inner.lock().availability.has(piece)
    }

    /// Number of pieces the peer has.
    pub fn peer_piece_count(&self) -> usize {
        self.inner.lock().availability.count()
    }

    /// Whether the peer has every piece.
    pub fn is_seed(&self) -> bool {
        self.inner.lock().availability.is_seed()
    }

    /// Whether the peer has everything we still need.
    pub fn is_relative_seed(&self) -> bool {
        self.inner.lock().availability.is_relative_seed()
    }
}

/// Sorts an inbound block into one of the four outcomes.
pub(super) fn classify(live: bool, written: bool, recent: bool, endgame: bool) -> BlockOutcome {
    match (live, written) {
        (true, true) if endgame => BlockOutcome::DiscardedEndgame,
        (true, true) => BlockOutcome::Discarded,
        (true, false) => BlockOutcome::Completed,
        (false, false) if recent => BlockOutcome::Recovered,
        (false, _) => BlockOutcome::Discarded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify(true, false, true, false), BlockOutcome::Completed);
        assert_eq!(classify(true, true, true, false), BlockOutcome::Discarded);
        assert_eq!(classify(true, true, true, true), BlockOutcome::DiscardedEndgame);
        assert_eq!(classify(false, false, true, true), BlockOutcome::Recovered);
        assert_eq!(classify(false, true, true, false), BlockOutcome::Discarded);
        assert_eq!(classify(false, false, false, false), BlockOutcome::Discarded);
    }
}
