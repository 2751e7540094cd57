//! Session continuity across reconnects.
//!
//! A connection derives a session id from a process secret, the info hash
//! and the peer's address. When it closes after doing something useful, its
//! statistics are parked in a shared [`ReconnectCache`] under that id; a new
//! connection that derives the same id picks them up again.

use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng as _;
use sha1::{Digest, Sha1};
use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use super::stats::PeerStats;
use crate::constants::{RECONNECT_CACHE_HARD, RECONNECT_CACHE_SOFT, RECONNECT_MAX_AGE};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; 20]);

impl SessionId {
    /// `SHA1(secret ‖ info_hash ‖ ip)`; stable for one peer address.
    pub fn derive(secret: &SessionSecret, info_hash: &[u8; 20], ip: IpAddr) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(secret.0);
        hasher.update(info_hash);
        match ip {
            IpAddr::V4(v4) => hasher.update(v4.octets()),
            IpAddr::V6(v6) => hasher.update(v6.octets()),
        }
        Self(hasher.finalize().into())
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 20]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId(")?;
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Long-lived random secret mixed into every session id.
#[derive(Clone)]
pub struct SessionSecret([u8; 20]);

impl SessionSecret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 20];
        rand::rng().fill(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

/// Upload/download limits in bytes per second; zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimits {
    pub upload: u64,
    pub download: u64,
}

impl RateLimits {
    pub fn is_set(&self) -> bool {
        self.upload != 0 || self.download != 0
    }
}

/// What a closed connection leaves behind for its successor.
#[derive(Debug, Clone)]
pub struct ReconnectRecord {
    pub peer_session_id: Option<SessionId>,
    pub stats: Arc<PeerStats>,
    pub snubbed: bool,
    pub last_good_data: Option<Instant>,
    pub limits: RateLimits,
    pub stored_at: Instant,
}

/// Shared, capped cache of recently closed connections.
pub struct ReconnectCache {
    entries: Mutex<LruCache<SessionId, ReconnectRecord>>,
    max_age: Duration,
    soft_limit: usize,
}

impl ReconnectCache {
    pub fn new() -> Self {
        Self::with_limits(RECONNECT_CACHE_SOFT, RECONNECT_CACHE_HARD, RECONNECT_MAX_AGE)
    }

    pub fn with_limits(soft_limit: usize, hard_limit: usize, max_age: Duration) -> Self {
        let hard = NonZeroUsize::new(hard_limit).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(hard)),
            max_age,
            soft_limit,
        }
    }

    /// Parks a record; the oldest record is evicted past the hard limit.
    pub fn insert(&self, id: SessionId, record: ReconnectRecord) {
        if let Some((evicted, _)) = self.entries.lock().push(id, record) {
            if evicted != id {
                trace!(session = ?evicted, "reconnect cache full, evicted oldest");
            }
        }
    }

    /// Removes and returns the record for `id` unless it is too old.
    pub fn take(&self, id: &SessionId, now: Instant) -> Option<ReconnectRecord> {
        let record = self.entries.lock().pop(id)?;
        if now.saturating_duration_since(record.stored_at) > self.max_age {
            return None;
        }
        Some(record)
    }

    /// Periodic cleaning: once above the soft limit, drops aged records.
    pub fn clean(&self, now: Instant) {
        let mut entries = self.entries.lock();
        if entries.len() <= self.soft_limit {
            return;
        }
        while let Some((_, oldest)) = entries.peek_lru() {
            if now.saturating_duration_since(oldest.stored_at) <= self.max_age {
                break;
            }
            entries.pop_lru();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReconnectCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(at: Instant) -> ReconnectRecord {
        ReconnectRecord {
            peer_session_id: None,
            stats: Arc::new(PeerStats::new()),
            snubbed: false,
            last_good_data: None,
            limits: RateLimits::default(),
            stored_at: at,
        }
    }

    #[test]
    fn test_session_id_is_deterministic_per_address() {
        let secret = SessionSecret::from_bytes([9; 20]);
        let a = SessionId::derive(&secret, &[1; 20], "10.0.0.1".parse().unwrap());
        let b = SessionId::derive(&secret, &[1; 20], "10.0.0.1".parse().unwrap());
        let c = SessionId::derive(&secret, &[1; 20], "10.0.0.2".parse().unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_take_returns_fresh_record_once() {
        let cache = ReconnectCache::new();
        let now = Instant::now();
        let id = SessionId([1; 20]);
        cache.insert(id, record(now));

        assert!(cache.take(&id, now + Duration::from_secs(10)).is_some());
        assert!(cache.take(&id, now + Duration::from_secs(10)).is_none());
    }

    #[test]
    fn test_aged_record_is_not_returned() {
        let cache = ReconnectCache::new();
        let now = Instant::now();
        let id = SessionId([2; 20]);
        cache.insert(id, record(now));
        assert!(cache.take(&id, now + RECONNECT_MAX_AGE + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_hard_limit_evicts_oldest() {
        let cache = ReconnectCache::with_limits(2, 3, RECONNECT_MAX_AGE);
        let now = Instant::now();
        for i in 0..4u8 {
            cache.insert(SessionId([i; 20]), record(now));
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.take(&SessionId([0; 20]), now).is_none());
        assert!(cache.take(&SessionId([3; 20]), now).is_some());
    }

    #[test]
    fn test_clean_only_above_soft_limit() {
        let cache = ReconnectCache::with_limits(2, 10, Duration::from_secs(60));
        let start = Instant::now();
        cache.insert(SessionId([1; 20]), record(start));
        cache.insert(SessionId([2; 20]), record(start));

        let later = start + Duration::from_secs(120);
        cache.clean(later);
        assert_eq!(cache.len(), 2);

        cache.insert(SessionId([3; 20]), record(later));
        cache.clean(later);
        assert_eq!(cache.len(), 1);
    }
}
