use std::fmt;

use rand::Rng as _;

use crate::constants::CLIENT_PREFIX;

/// Azureus-style two-letter client codes we can name.
const KNOWN_CLIENTS: &[(&[u8; 2], &str)] = &[
    (b"AZ", "Azureus"),
    (b"BI", "BiglyBT"),
    (b"BC", "BitComet"),
    (b"DE", "Deluge"),
    (b"LT", "libtorrent"),
    (b"lt", "libTorrent"),
    (b"PW", "peerwire"),
    (b"qB", "qBittorrent"),
    (b"TR", "Transmission"),
    (b"UT", "\u{b5}Torrent"),
];

/// Clients whose fast-extension support is known to be broken.
const BROKEN_FAST_CLIENTS: &[&str] = &["BitComet", "Plus!"];

/// A 20-byte peer identifier.
///
/// Generated ids follow the Azureus-style `-PW0100-<12 random bytes>` layout.
/// Incoming ids are used for self-connection and duplicate detection and to
/// guess the remote client before any extension handshake names it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generates a new random peer id with our client prefix.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(CLIENT_PREFIX);
        rand::rng().fill(&mut id[8..]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The `XX0000` part of an Azureus-style id.
    pub fn client_id(&self) -> Option<&str> {
        if self.0[0] == b'-' && self.0[7] == b'-' {
            std::str::from_utf8(&self.0[1..7]).ok()
        } else {
            None
        }
    }

    /// Best-effort client name derived from the id alone.
    pub fn client_name(&self) -> String {
        if self.0.starts_with(b"Plus") {
            return "Plus! II".to_string();
        }
        if let Some(id) = self.client_id() {
            let code = &self.0[1..3];
            let version = &id[2..];
            return match KNOWN_CLIENTS.iter().find(|(c, _)| c.as_slice() == code) {
                Some((_, name)) => format!("{name} {version}"),
                None => format!("Unknown [{id}]"),
            };
        }
        "Unknown".to_string()
    }
}

/// Whether a client claims vendor messaging support without implementing it.
pub fn misannounces_vendor_messaging(client: &str) -> bool {
    client.contains("Plus!")
}

/// Whether a client implements the fast extension well enough to be offered
/// allowed-fast pieces.
pub fn fully_supports_fast(client: &str) -> bool {
    !BROKEN_FAST_CLIENTS.iter().any(|c| client.contains(c))
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id() {
            Some(client) => write!(f, "PeerId({client})"),
            None => write!(f, "PeerId({:02x?})", &self.0[..8]),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            if byte.is_ascii_alphanumeric() || *byte == b'-' {
                write!(f, "{}", *byte as char)?;
            } else {
                write!(f, "%{byte:02x}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_carry_prefix() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert_eq!(a.client_id(), Some("PW0100"));
    }

    #[test]
    fn test_client_name() {
        let mut id = [b'x'; 20];
        id[..8].copy_from_slice(b"-TR4050-");
        assert_eq!(PeerId(id).client_name(), "Transmission 4050");

        id[..8].copy_from_slice(b"-ZZ1000-");
        assert_eq!(PeerId(id).client_name(), "Unknown [ZZ1000]");

        id[..4].copy_from_slice(b"Plus");
        assert!(misannounces_vendor_messaging(&PeerId(id).client_name()));
    }

    #[test]
    fn test_fast_support() {
        assert!(fully_supports_fast("qBittorrent 4.6"));
        assert!(!fully_supports_fast("BitComet 1.9"));
    }
}
