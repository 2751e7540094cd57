//! Capability discovery and extension-dialect selection.

use std::collections::BTreeMap;

use super::message::Handshake;
use super::peer_id::misannounces_vendor_messaging;
use crate::config::{MessagingMode, PeerConfig, VendorPreference};
use crate::constants::{
    RESERVED_DHT, RESERVED_ENP_MAJOR, RESERVED_ENP_MINOR, RESERVED_FAST, RESERVED_LTEP,
    RESERVED_VENDOR,
};

/// The extension framework a connection speaks, fixed once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Dialect {
    #[default]
    Classic,
    Ltep,
    Vendor,
}

/// Capabilities read from a reserved-byte vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub ltep: bool,
    pub vendor: bool,
    pub fast: bool,
    pub dht: bool,
    pub preference: VendorPreference,
}

impl Capabilities {
    pub fn from_handshake(hs: &Handshake) -> Self {
        Self {
            ltep: hs.has_bit(RESERVED_LTEP),
            vendor: hs.has_bit(RESERVED_VENDOR),
            fast: hs.has_bit(RESERVED_FAST),
            dht: hs.has_bit(RESERVED_DHT),
            preference: VendorPreference::from_bits(
                hs.has_bit(RESERVED_ENP_MAJOR),
                hs.has_bit(RESERVED_ENP_MINOR),
            ),
        }
    }
}

/// The reserved bytes this side announces.
pub fn local_reserved(config: &PeerConfig) -> [u8; 8] {
    let mut reserved = [0u8; 8];
    let mut set = |(byte, mask): (usize, u8)| reserved[byte] |= mask;

    if config.messaging_mode != MessagingMode::ClassicOnly {
        set(RESERVED_LTEP);
    }
    if config.messaging_mode == MessagingMode::Any {
        set(RESERVED_VENDOR);
        let (major, minor) = config.vendor_preference.bits();
        if major {
            set(RESERVED_ENP_MAJOR);
        }
        if minor {
            set(RESERVED_ENP_MINOR);
        }
    }
    if config.fast_extension {
        set(RESERVED_FAST);
    }
    if config.dht_port.is_some() {
        set(RESERVED_DHT);
    }
    reserved
}

/// Picks the dialect from local policy and the peer's capability bits.
///
/// When the peer announces both frameworks, its preference bits decide:
/// anything but "force libtorrent-style" selects the vendor dialect. Both
/// sides evaluate the other's bits, so two peers announcing the same
/// preference agree.
pub fn decide_dialect(mode: MessagingMode, peer: &Capabilities, client: &str) -> Dialect {
    match mode {
        MessagingMode::ClassicOnly => return Dialect::Classic,
        MessagingMode::LtepOnly => {
            return if peer.ltep {
                Dialect::Ltep
            } else {
                Dialect::Classic
            }
        }
        MessagingMode::Any => {}
    }

    match (peer.ltep, peer.vendor) {
        (false, false) => Dialect::Classic,
        (true, false) => Dialect::Ltep,
        (false, true) if misannounces_vendor_messaging(client) => Dialect::Classic,
        (false, true) => Dialect::Vendor,
        (true, true) if peer.preference != VendorPreference::ForceLtep => Dialect::Vendor,
        (true, true) => Dialect::Ltep,
    }
}

/// Negotiated version per optional message kind.
///
/// A kind is present only when both sides announced it; its version is the
/// lower of the two. Kinds absent here are never sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageVersions {
    versions: BTreeMap<String, u8>,
}

impl MessageVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intersect<'a>(
        local: impl IntoIterator<Item = (&'a str, u8)>,
        remote: impl IntoIterator<Item = (&'a str, u8)>,
    ) -> Self {
        let remote: BTreeMap<&str, u8> = remote.into_iter().collect();
        let versions = local
            .into_iter()
            .filter_map(|(kind, ours)| {
                remote
                    .get(kind)
                    .map(|&theirs| (kind.to_string(), ours.min(theirs)))
            })
            .collect();
        Self { versions }
    }

    pub fn version(&self, kind: &str) -> Option<u8> {
        self.versions.get(kind).copied()
    }

    pub fn supports(&self, kind: &str) -> bool {
        self.versions.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(ltep: bool, vendor: bool, preference: VendorPreference) -> Capabilities {
        Capabilities {
            ltep,
            vendor,
            fast: false,
            dht: false,
            preference,
        }
    }

    #[test]
    fn test_dialect_truth_table() {
        let none = VendorPreference::ForceLtep;
        let any = MessagingMode::Any;
        assert_eq!(decide_dialect(any, &caps(false, false, none), "x"), Dialect::Classic);
        assert_eq!(decide_dialect(any, &caps(true, false, none), "x"), Dialect::Ltep);
        assert_eq!(decide_dialect(any, &caps(false, true, none), "x"), Dialect::Vendor);
        assert_eq!(
            decide_dialect(any, &caps(false, true, none), "Plus! II"),
            Dialect::Classic
        );
    }

    #[test]
    fn test_both_bits_resolved_by_preference() {
        let any = MessagingMode::Any;
        for (pref, expected) in [
            (VendorPreference::ForceLtep, Dialect::Ltep),
            (VendorPreference::PreferLtep, Dialect::Vendor),
            (VendorPreference::PreferVendor, Dialect::Vendor),
            (VendorPreference::ForceVendor, Dialect::Vendor),
        ] {
            assert_eq!(decide_dialect(any, &caps(true, true, pref), "x"), expected);
        }
    }

    #[test]
    fn test_symmetric_peers_agree() {
        for pref in [VendorPreference::ForceLtep, VendorPreference::ForceVendor] {
            let config = PeerConfig {
                vendor_preference: pref,
                ..PeerConfig::default()
            };
            let hs = Handshake::new([0; 20], [0; 20], local_reserved(&config));
            let seen_by_a = decide_dialect(MessagingMode::Any, &Capabilities::from_handshake(&hs), "");
            let seen_by_b = decide_dialect(MessagingMode::Any, &Capabilities::from_handshake(&hs), "");
            assert_eq!(seen_by_a, seen_by_b);
        }
    }

    #[test]
    fn test_local_policy_overrides_peer_bits() {
        let both = caps(true, true, VendorPreference::ForceVendor);
        assert_eq!(decide_dialect(MessagingMode::ClassicOnly, &both, "x"), Dialect::Classic);
        assert_eq!(decide_dialect(MessagingMode::LtepOnly, &both, "x"), Dialect::Ltep);
        assert_eq!(
            decide_dialect(MessagingMode::LtepOnly, &caps(false, true, VendorPreference::ForceVendor), "x"),
            Dialect::Classic
        );
    }

    #[test]
    fn test_local_reserved_bits() {
        let reserved = local_reserved(&PeerConfig::default());
        assert_eq!(reserved[0] & 0x80, 0x80);
        assert_eq!(reserved[5], 0x10 | 0x02 | 0x01);
        assert_eq!(reserved[7], 0x04);

        let classic = PeerConfig {
            messaging_mode: MessagingMode::ClassicOnly,
            fast_extension: false,
            ..PeerConfig::default()
        };
        assert_eq!(local_reserved(&classic), [0; 8]);
    }

    #[test]
    fn test_versions_intersection() {
        let versions = MessageVersions::intersect(
            [("AZ_HAVE", 2), ("AZ_BAD_PIECE", 1), ("AZ_METADATA", 1)],
            [("AZ_HAVE", 1), ("AZ_METADATA", 3), ("AZ_OTHER", 1)],
        );
        assert_eq!(versions.version("AZ_HAVE"), Some(1));
        assert_eq!(versions.version("AZ_METADATA"), Some(1));
        assert!(!versions.supports("AZ_BAD_PIECE"));
        assert!(!versions.supports("AZ_OTHER"));
        assert_eq!(versions.len(), 2);
    }
}
