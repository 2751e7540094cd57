use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Kinds of inbound messages counted for flood detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Limited {
    KeepAlive,
    PeerExchange,
}

/// Rolling-window counter of inbound messages per kind.
#[derive(Debug, Default)]
pub struct MessageLimiter {
    seen: HashMap<Limited, VecDeque<Instant>>,
}

impl MessageLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one message at `now`. Returns false when more than `max`
    /// messages of this kind fall inside `window`.
    pub fn count(&mut self, kind: Limited, max: usize, window: Duration, now: Instant) -> bool {
        let times = self.seen.entry(kind).or_default();
        while times
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) >= window)
        {
            times.pop_front();
        }
        times.push_back(now);
        times.len() <= max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seventh_in_window_is_refused() {
        let mut limiter = MessageLimiter::new();
        let start = Instant::now();
        let window = Duration::from_secs(60);
        for i in 0..6 {
            assert!(limiter.count(Limited::KeepAlive, 6, window, start + Duration::from_secs(i)));
        }
        assert!(!limiter.count(Limited::KeepAlive, 6, window, start + Duration::from_secs(10)));
    }

    #[test]
    fn test_window_rolls() {
        let mut limiter = MessageLimiter::new();
        let start = Instant::now();
        let window = Duration::from_secs(60);
        for _ in 0..6 {
            assert!(limiter.count(Limited::KeepAlive, 6, window, start));
        }
        assert!(limiter.count(Limited::KeepAlive, 6, window, start + window));
    }

    #[test]
    fn test_kinds_are_independent() {
        let mut limiter = MessageLimiter::new();
        let now = Instant::now();
        let window = Duration::from_secs(60);
        assert!(limiter.count(Limited::KeepAlive, 1, window, now));
        assert!(limiter.count(Limited::PeerExchange, 1, window, now));
        assert!(!limiter.count(Limited::KeepAlive, 1, window, now));
    }
}
