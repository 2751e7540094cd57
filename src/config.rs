//! Per-connection configuration.
//!
//! A [`PeerConfig`] is shared by every connection of a swarm. Defaults come
//! from [`constants`](crate::constants).

use crate::constants::*;
use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;
use std::time::Duration;

/// Which extension frameworks this side is willing to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessagingMode {
    /// Plain BitTorrent, no extension framework at all.
    ClassicOnly,
    /// libtorrent-style extension protocol only.
    LtepOnly,
    /// Either framework; the reserved bits decide.
    #[default]
    Any,
}

/// Preference between the two extension frameworks, announced through the
/// two negotiation bits of the reserved vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VendorPreference {
    ForceLtep,
    PreferLtep,
    PreferVendor,
    #[default]
    ForceVendor,
}

impl VendorPreference {
    /// Decodes the (major, minor) bit pair.
    pub fn from_bits(major: bool, minor: bool) -> Self {
        match (major, minor) {
            (false, false) => VendorPreference::ForceLtep,
            (false, true) => VendorPreference::PreferLtep,
            (true, false) => VendorPreference::PreferVendor,
            (true, true) => VendorPreference::ForceVendor,
        }
    }

    /// The (major, minor) bit pair announcing this preference.
    pub fn bits(self) -> (bool, bool) {
        match self {
            VendorPreference::ForceLtep => (false, false),
            VendorPreference::PreferLtep => (false, true),
            VendorPreference::PreferVendor => (true, false),
            VendorPreference::ForceVendor => (true, true),
        }
    }
}

/// Configuration shared by the connections of one swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Extension frameworks we accept
    pub messaging_mode: MessagingMode,

    /// Preference announced when both frameworks are available
    pub vendor_preference: VendorPreference,

    /// Advertise and use the fast extension
    pub fast_extension: bool,

    /// DHT port to announce (None = DHT disabled)
    pub dht_port: Option<u16>,

    /// Withhold a few pieces from the initial bitfield
    pub lazy_bitfield: bool,

    /// Exchange peers with PEX-capable peers
    pub enable_pex: bool,

    /// Accept several connections from one IP address
    pub allow_same_ip: bool,

    /// When one identity arrives on both address families, keep the IPv6 one
    pub prefer_ipv6: bool,

    /// Maximum connections per swarm
    pub max_peers_per_swarm: usize,

    /// Maximum connections across all swarms
    pub max_peers_global: usize,

    /// Peers accepted in the first PEX volley
    pub pex_initial_volley_max: usize,

    /// Peers accepted in later PEX volleys
    pub pex_volley_max: usize,

    /// Client name in extension handshakes
    pub client_name: String,

    /// Client version in the vendor handshake
    pub client_version: String,

    /// Listen ports announced to peers
    pub tcp_port: u16,
    pub udp_port: u16,
    pub udp2_port: u16,

    /// Public IPv6 address to advertise, if any
    pub ipv6: Option<Ipv6Addr>,

    /// Ask peers for encrypted connections
    pub crypto_requested: bool,

    /// Handshake timeout in seconds
    pub handshake_timeout: u64,

    /// Idle timeout in seconds
    pub idle_timeout: u64,

    /// Keep-alive interval in seconds
    pub keep_alive_interval: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            messaging_mode: MessagingMode::Any,
            vendor_preference: VendorPreference::ForceVendor,
            fast_extension: true,
            dht_port: None,
            lazy_bitfield: false,
            enable_pex: true,
            allow_same_ip: false,
            prefer_ipv6: false,
            max_peers_per_swarm: MAX_PEERS_PER_SWARM,
            max_peers_global: MAX_PEERS_GLOBAL,
            pex_initial_volley_max: PEX_INITIAL_VOLLEY_MAX,
            pex_volley_max: PEX_VOLLEY_MAX,
            client_name: CLIENT_NAME.to_string(),
            client_version: CLIENT_VERSION.to_string(),
            tcp_port: 6881,
            udp_port: 6881,
            udp2_port: 6881,
            ipv6: None,
            crypto_requested: false,
            handshake_timeout: HANDSHAKE_TIMEOUT.as_secs(),
            idle_timeout: IDLE_TIMEOUT.as_secs(),
            keep_alive_interval: KEEP_ALIVE_INTERVAL.as_secs(),
        }
    }
}

impl PeerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval)
    }

    /// Largest PEX volley accepted; the first exchange gets the smaller cap.
    pub fn pex_cap(&self, initial: bool) -> usize {
        if initial {
            self.pex_initial_volley_max
        } else {
            self.pex_volley_max
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preference_bits_round_trip_every_variant() {
        for pref in [
            VendorPreference::ForceLtep,
            VendorPreference::PreferLtep,
            VendorPreference::PreferVendor,
            VendorPreference::ForceVendor,
        ] {
            let (major, minor) = pref.bits();
            assert_eq!(VendorPreference::from_bits(major, minor), pref);
        }
    }

    #[test]
    fn test_first_pex_volley_cap_is_smaller() {
        let config = PeerConfig::default();
        assert!(config.pex_cap(true) < config.pex_cap(false));
    }

    #[test]
    fn test_default_timeouts() {
        let config = PeerConfig::default();
        assert_eq!(config.handshake_timeout(), HANDSHAKE_TIMEOUT);
        assert_eq!(config.idle_timeout(), IDLE_TIMEOUT);
        assert_eq!(config.keep_alive_interval(), KEEP_ALIVE_INTERVAL);
    }
}
