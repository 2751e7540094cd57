use crate::constants::{FAST_RATE, READ_AHEAD_BANDS, READ_AHEAD_MIN, TURBO_RATE};

/// Transport service level, escalated as throughput grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TransportMode {
    #[default]
    Normal,
    Fast,
    Turbo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub mode: TransportMode,
    /// How many queued upload requests to read from disk ahead of sending.
    pub read_ahead: usize,
}

/// Maps measured rates (bytes per second) to a mode and read-ahead depth.
///
/// The mode never drops below `current`.
pub fn tune(current: TransportMode, send_rate: u64, receive_rate: u64) -> Tuning {
    let read_ahead = READ_AHEAD_BANDS
        .iter()
        .find(|(min, _)| send_rate >= *min)
        .map_or(READ_AHEAD_MIN, |(_, depth)| *depth);

    let by_rate = |rate: u64| {
        if rate >= TURBO_RATE {
            TransportMode::Turbo
        } else if rate >= FAST_RATE {
            TransportMode::Fast
        } else {
            TransportMode::Normal
        }
    };

    Tuning {
        mode: current.max(by_rate(send_rate)).max(by_rate(receive_rate)),
        read_ahead,
    }
}
