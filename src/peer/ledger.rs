use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use super::piece::BlockRequest;
use crate::constants::RECENT_REQUEST_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub request: BlockRequest,
    /// Staleness clock; reset whenever a requested or recovered block arrives.
    pub issued_at: Instant,
    /// The first request of a connection measures round-trip latency.
    pub timed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issue {
    New,
    /// Already live; nothing changed.
    Duplicate,
}

/// In-flight requests to one peer, plus a small cache of recently issued
/// ones used to recognise late but legitimate data.
pub struct RequestLedger {
    live: Vec<LedgerEntry>,
    recent: LruCache<BlockRequest, ()>,
    timed_issued: bool,
    latency: Option<Duration>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::with_recent_capacity(RECENT_REQUEST_CAPACITY)
    }

    pub fn with_recent_capacity(capacity: usize) -> Self {
        Self {
            live: Vec::new(),
            recent: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            timed_issued: false,
            latency: None,
        }
    }

    /// Adds a live request and mirrors it into the recent cache. The cache
    /// only reorders on insertion, so lookups never keep an entry alive.
    pub fn issue(&mut self, request: BlockRequest, now: Instant) -> Issue {
        if self.contains(&request) {
            return Issue::Duplicate;
        }
        let timed = !self.timed_issued;
        self.timed_issued = true;
        self.recent.put(request, ());
        self.live.push(LedgerEntry {
            request,
            issued_at: now,
            timed,
        });
        Issue::New
    }

    pub fn contains(&self, request: &BlockRequest) -> bool {
        self.live.iter().any(|e| e.request == *request)
    }

    /// Whether the request was issued recently, live or not.
    pub fn was_recent(&self, request: &BlockRequest) -> bool {
        self.recent.contains(request)
    }

    /// Removes a live request. Completing the timed request records the
    /// round trip.
    pub fn take(&mut self, request: &BlockRequest, now: Instant) -> Option<LedgerEntry> {
        let pos = self.live.iter().position(|e| e.request == *request)?;
        let entry = self.live.remove(pos);
        if entry.timed {
            self.latency = Some(now.saturating_duration_since(entry.issued_at));
        }
        Some(entry)
    }

    /// Removes a live request without completing it. It stays in the recent
    /// cache, so data that still arrives is recovered.
    pub fn cancel(&mut self, request: &BlockRequest) -> bool {
        let before = self.live.len();
        self.live.retain(|e| e.request != *request);
        self.live.len() != before
    }

    /// Removes the first live request for `piece`.
    pub fn take_piece(&mut self, piece: u32) -> Option<LedgerEntry> {
        let pos = self.live.iter().position(|e| e.request.piece == piece)?;
        Some(self.live.remove(pos))
    }

    pub fn reset_clocks(&mut self, now: Instant) {
        for entry in &mut self.live {
            entry.issued_at = now;
        }
    }

    /// Live requests whose clock is older than `max_age`.
    pub fn expired(&self, now: Instant, max_age: Duration) -> Vec<BlockRequest> {
        self.live
            .iter()
            .filter(|e| now.saturating_duration_since(e.issued_at) > max_age)
            .map(|e| e.request)
            .collect()
    }

    /// Empties the live set; the recent cache is kept.
    pub fn drain(&mut self) -> Vec<BlockRequest> {
        self.live.drain(..).map(|e| e.request).collect()
    }

    pub fn requests(&self) -> Vec<BlockRequest> {
        self.live.iter().map(|e| e.request).collect()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }
}

impl Default for RequestLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(piece: u32) -> BlockRequest {
        BlockRequest::new(piece, 0, 16_384)
    }

    #[test]
    fn test_duplicate_issue_keeps_one_entry() {
        let mut ledger = RequestLedger::new();
        let now = Instant::now();
        assert_eq!(ledger.issue(req(1), now), Issue::New);
        assert_eq!(ledger.issue(req(1), now), Issue::Duplicate);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_cancel_keeps_recent_entry() {
        let mut ledger = RequestLedger::new();
        let now = Instant::now();
        ledger.issue(req(4), now);
        assert!(ledger.cancel(&req(4)));
        assert!(!ledger.cancel(&req(4)));
        assert!(ledger.is_empty());
        assert!(ledger.was_recent(&req(4)));
    }

    #[test]
    fn test_only_first_request_is_timed() {
        let mut ledger = RequestLedger::new();
        let start = Instant::now();
        ledger.issue(req(1), start);
        ledger.issue(req(2), start);

        let second = ledger.take(&req(2), start + Duration::from_millis(50)).unwrap();
        assert!(!second.timed);
        assert_eq!(ledger.latency(), None);

        ledger.take(&req(1), start + Duration::from_millis(80));
        assert_eq!(ledger.latency(), Some(Duration::from_millis(80)));
    }

    #[test]
    fn test_recent_cache_outlives_live_entry() {
        let mut ledger = RequestLedger::new();
        let now = Instant::now();
        ledger.issue(req(1), now);
        ledger.take(&req(1), now);
        assert!(!ledger.contains(&req(1)));
        assert!(ledger.was_recent(&req(1)));
    }

    #[test]
    fn test_recent_cache_evicts_oldest_first() {
        let mut ledger = RequestLedger::with_recent_capacity(2);
        let now = Instant::now();
        for piece in 0..3 {
            ledger.issue(req(piece), now);
            ledger.take(&req(piece), now);
        }
        assert!(!ledger.was_recent(&req(0)));
        assert!(ledger.was_recent(&req(1)));
        assert!(ledger.was_recent(&req(2)));
    }

    #[test]
    fn test_lookup_does_not_refresh_recent_entry() {
        let mut ledger = RequestLedger::with_recent_capacity(2);
        let now = Instant::now();
        ledger.issue(req(0), now);
        ledger.issue(req(1), now);
        assert!(ledger.was_recent(&req(0)));
        ledger.issue(req(2), now);
        assert!(!ledger.was_recent(&req(0)));
    }

    #[test]
    fn test_expiry_and_clock_reset() {
        let mut ledger = RequestLedger::new();
        let start = Instant::now();
        ledger.issue(req(1), start);
        let later = start + Duration::from_secs(90);
        assert_eq!(ledger.expired(later, Duration::from_secs(60)), vec![req(1)]);

        ledger.reset_clocks(later);
        assert!(ledger.expired(later, Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_drain_empties_live_set() {
        let mut ledger = RequestLedger::new();
        let now = Instant::now();
        ledger.issue(req(1), now);
        ledger.issue(req(2), now);
        assert_eq!(ledger.drain(), vec![req(1), req(2)]);
        assert!(ledger.is_empty());
        assert!(ledger.was_recent(&req(2)));
    }
}
