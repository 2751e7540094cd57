//! Protocol constants and tuning parameters.
//!
//! Defaults for everything a single peer connection needs: wire numbers,
//! timeouts, flood limits, fast-extension sizes and throughput bands. Most of
//! them can be overridden per connection through [`PeerConfig`](crate::PeerConfig).

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &[u8; 8] = b"-PW0100-";

/// Client name announced in extension handshakes
pub const CLIENT_NAME: &str = "peerwire";

/// Client version announced in the vendor handshake
pub const CLIENT_VERSION: &str = "0.1.0";

// ============================================================================
// Reserved-byte capability bits (byte index, mask)
// ============================================================================

/// Vendor extended messaging
pub const RESERVED_VENDOR: (usize, u8) = (0, 0x80);

/// libtorrent-style extension protocol (BEP-10)
pub const RESERVED_LTEP: (usize, u8) = (5, 0x10);

/// Extension negotiation preference, major bit
pub const RESERVED_ENP_MAJOR: (usize, u8) = (5, 0x02);

/// Extension negotiation preference, minor bit
pub const RESERVED_ENP_MINOR: (usize, u8) = (5, 0x01);

/// Fast extension (BEP-6)
pub const RESERVED_FAST: (usize, u8) = (7, 0x04);

/// DHT port announce (BEP-5)
pub const RESERVED_DHT: (usize, u8) = (7, 0x01);

// ============================================================================
// Blocks and messages
// ============================================================================

/// Standard block size (16 KiB)
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Largest block a peer may ask us for
pub const MAX_REQUEST_LENGTH: u32 = 128 * 1024;

/// Metadata-over-wire block size (BEP-9)
pub const METADATA_BLOCK_SIZE: u32 = 16 * 1024;

/// Capacity of the recently-issued request cache
pub const RECENT_REQUEST_CAPACITY: usize = 16;

// ============================================================================
// Fast extension (BEP-6)
// ============================================================================

/// Pieces offered to a peer as allowed-fast
pub const ALLOWED_FAST_OFFERED: usize = 10;

/// Offers stop once the peer owns this many pieces
pub const ALLOWED_FAST_PEER_PIECE_MAX: u32 = 10;

/// Upper bound on allowed-fast pieces accepted from one peer
pub const ALLOWED_FAST_RECEIVED_MAX: usize = 20;

/// Byte budget per offered piece, in piece lengths
pub const ALLOWED_FAST_BUDGET_PIECES: u64 = 2;

/// Priority given to pieces outside the received allowed-fast set
pub const PRIORITY_NEVER: i32 = i32::MIN;

// ============================================================================
// Timeouts
// ============================================================================

/// Close if the handshake has not completed after this long
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Close an established connection silent for this long
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Send a keep-alive when nothing was sent for this long
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Good data within this window clears the snubbed flag
pub const SNUB_WINDOW: Duration = Duration::from_secs(60);

/// Longest life accepted for a request hint
pub const REQUEST_HINT_MAX_LIFE: Duration = Duration::from_secs(150);

// ============================================================================
// Flood limits
// ============================================================================

/// Keep-alives tolerated per window
pub const KEEP_ALIVE_FLOOD_MAX: usize = 6;

/// Keep-alive flood window
pub const KEEP_ALIVE_FLOOD_WINDOW: Duration = Duration::from_secs(60);

/// PEX messages tolerated per window
pub const PEX_FLOOD_MAX: usize = 7;

/// PEX flood window
pub const PEX_FLOOD_WINDOW: Duration = Duration::from_secs(120);

/// Peers per PEX volley on the first exchange
pub const PEX_INITIAL_VOLLEY_MAX: usize = 50;

/// Peers per PEX volley afterwards
pub const PEX_VOLLEY_MAX: usize = 100;

// ============================================================================
// Hash exchange (BEP-52)
// ============================================================================

/// Queued protocol bytes above which hash requests are rejected
pub const HASH_REQUEST_BACKLOG_MAX: usize = 4 * 1024 * 1024;

// ============================================================================
// Lazy bitfield
// ============================================================================

/// Extra pieces withheld from a lazy bitfield (inclusive range)
pub const LAZY_EXTRA_MIN: usize = 4;
pub const LAZY_EXTRA_MAX: usize = 19;

/// Delay before the first withheld have, in milliseconds (inclusive range)
pub const LAZY_FIRST_DELAY_MS: (u64, u64) = (1_000, 3_000);

/// Gap between withheld haves, in milliseconds (inclusive range)
pub const LAZY_GAP_MS: (u64, u64) = (0, 2_000);

// ============================================================================
// Connection limits
// ============================================================================

/// Maximum peers per swarm
pub const MAX_PEERS_PER_SWARM: usize = 200;

/// Maximum peers across all swarms
pub const MAX_PEERS_GLOBAL: usize = 500;

// ============================================================================
// Reconnection cache
// ============================================================================

/// Entries above which periodic cleaning kicks in
pub const RECONNECT_CACHE_SOFT: usize = 20;

/// Hard capacity; the oldest entry is evicted beyond it
pub const RECONNECT_CACHE_HARD: usize = 100;

/// Age after which a cached record is dropped
pub const RECONNECT_MAX_AGE: Duration = Duration::from_secs(2 * 60);

/// Connections older than this are cached even without data exchanged
pub const RECONNECT_MIN_LIFETIME: Duration = Duration::from_secs(30);

// ============================================================================
// Performance tuning (bytes per second)
// ============================================================================

/// Send-rate bands: (minimum rate, read-ahead depth)
pub const READ_AHEAD_BANDS: [(u64, usize); 6] = [
    (3_125_000, 256),
    (1_250_000, 128),
    (125_000, 32),
    (62_500, 16),
    (31_250, 8),
    (12_500, 4),
];

/// Read-ahead below the slowest band
pub const READ_AHEAD_MIN: usize = 2;

/// Rate from which the transport switches to turbo mode
pub const TURBO_RATE: u64 = 1_250_000;

/// Rate from which the transport switches to fast mode
pub const FAST_RATE: u64 = 125_000;
