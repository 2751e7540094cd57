use std::sync::atomic::{AtomicU64, Ordering};

use crate::bencode::Value;

/// How an inbound block was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockOutcome {
    /// Answered a live request and was handed to the write path.
    Completed,
    /// No live request, but it was issued recently; written with force.
    Recovered,
    /// Duplicate, unsolicited or invalid; dropped.
    Discarded,
    /// Duplicate while the swarm is in end-game mode; expected and dropped.
    DiscardedEndgame,
}

/// Byte counters for one peer.
///
/// Held behind an `Arc` so a reconnecting peer can inherit the counters of
/// its previous connection.
#[derive(Debug, Default)]
pub struct PeerStats {
    data_received: AtomicU64,
    data_sent: AtomicU64,
    protocol_received: AtomicU64,
    protocol_sent: AtomicU64,
    discarded: AtomicU64,
}

impl PeerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_data_received(&self, bytes: u64) {
        self.data_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_data_sent(&self, bytes: u64) {
        self.data_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_protocol_received(&self, bytes: u64) {
        self.protocol_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_protocol_sent(&self, bytes: u64) {
        self.protocol_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_discarded(&self, bytes: u64) {
        self.discarded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn data_received(&self) -> u64 {
        self.data_received.load(Ordering::Relaxed)
    }

    pub fn data_sent(&self) -> u64 {
        self.data_sent.load(Ordering::Relaxed)
    }

    pub fn protocol_received(&self) -> u64 {
        self.protocol_received.load(Ordering::Relaxed)
    }

    pub fn protocol_sent(&self) -> u64 {
        self.protocol_sent.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Counters as sent in a stats reply.
    pub fn to_value(&self) -> Value {
        let mut dict = Value::dict();
        let as_i64 = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        dict.insert("data_recv", as_i64(self.data_received()));
        dict.insert("data_sent", as_i64(self.data_sent()));
        dict.insert("prot_recv", as_i64(self.protocol_received()));
        dict.insert("prot_sent", as_i64(self.protocol_sent()));
        dict.insert("discarded", as_i64(self.discarded()));
        dict
    }
}

/// Process-wide block classification totals, read by diagnostics.
#[derive(Debug, Default)]
pub struct SessionCounters {
    discarded: AtomicU64,
    discarded_endgame: AtomicU64,
    recovered: AtomicU64,
    completed: AtomicU64,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: BlockOutcome) {
        let counter = match outcome {
            BlockOutcome::Completed => &self.completed,
            BlockOutcome::Recovered => &self.recovered,
            BlockOutcome::Discarded => &self.discarded,
            BlockOutcome::DiscardedEndgame => &self.discarded_endgame,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, outcome: BlockOutcome) -> u64 {
        match outcome {
            BlockOutcome::Completed => &self.completed,
            BlockOutcome::Recovered => &self.recovered,
            BlockOutcome::Discarded => &self.discarded,
            BlockOutcome::DiscardedEndgame => &self.discarded_endgame,
        }
        .load(Ordering::Relaxed)
    }
}
