//! Identity registry shared by every connection of the process.
//!
//! Tracks which peer ids are connected per swarm, refuses banned clients,
//! duplicates and same-address connections, and enforces connection
//! ceilings. Replaced connections are evicted through a weak handle once the
//! map guard is released.

use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Weak;
use tracing::{debug, info};

use super::error::{CloseReason, ErrorKind, PeerError};
use crate::config::PeerConfig;

/// Something the registry can close when a better connection replaces it.
pub trait Evict: Send + Sync {
    fn evict(&self, reason: CloseReason);
}

/// How the connection manager classified a new connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionClass {
    pub optimistic: bool,
    pub priority: bool,
}

/// Proof of registration, handed back on unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    token: u64,
}

struct Registered {
    addr: SocketAddr,
    token: u64,
    evict: Weak<dyn Evict>,
}

#[derive(Default)]
pub struct IdentityRegistry {
    swarms: DashMap<[u8; 20], HashMap<[u8; 20], Registered>>,
    banned: DashSet<String>,
    total: AtomicUsize,
    next_token: AtomicU64,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bans every client whose name contains `name`.
    pub fn ban_client(&self, name: impl Into<String>) {
        self.banned.insert(name.into());
    }

    pub fn unban_client(&self, name: &str) {
        self.banned.remove(name);
    }

    pub fn is_banned(&self, client: &str) -> bool {
        self.banned.iter().any(|name| client.contains(name.as_str()))
    }

    /// Registers a connection that completed its handshake.
    pub fn register(
        &self,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        addr: SocketAddr,
        class: ConnectionClass,
        config: &PeerConfig,
        evict: Weak<dyn Evict>,
    ) -> Result<Registration, PeerError> {
        let lan_local = is_lan_local(addr.ip());
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let replaced = {
            let mut swarm = self.swarms.entry(info_hash).or_default();

            let mut duplicate = false;
            if let Some(existing) = swarm.get(&peer_id) {
                if !replaces(addr, existing.addr, config.prefer_ipv6) {
                    debug!(peer = %addr, existing = %existing.addr, "duplicate peer id");
                    return Err(PeerError::DuplicateIdentity);
                }
                duplicate = true;
            }

            if !config.allow_same_ip
                && swarm
                    .iter()
                    .any(|(id, r)| *id != peer_id && r.addr.ip() == addr.ip())
            {
                return Err(PeerError::SameIp);
            }

            let bypass = class.optimistic || class.priority || lan_local;
            if !duplicate
                && !bypass
                && (swarm.len() >= config.max_peers_per_swarm
                    || self.total.load(Ordering::Relaxed) >= config.max_peers_global)
            {
                return Err(PeerError::ConnectionLimit);
            }

            let old = swarm.insert(peer_id, Registered { addr, token, evict });
            if old.is_none() {
                self.total.fetch_add(1, Ordering::Relaxed);
            }
            old
        };

        if let Some(old) = replaced {
            info!(peer = %addr, replaced = %old.addr, "duplicate peer id, keeping new connection");
            if let Some(conn) = old.evict.upgrade() {
                conn.evict(CloseReason {
                    kind: ErrorKind::Policy,
                    message: "replaced by a connection from the same peer".into(),
                });
            }
        }

        Ok(Registration {
            info_hash,
            peer_id,
            token,
        })
    }

    /// Removes a registration unless another connection has since taken the
    /// slot.
    pub fn unregister(&self, registration: &Registration) {
        let Some(mut swarm) = self.swarms.get_mut(&registration.info_hash) else {
            return;
        };
        let ours = swarm
            .get(&registration.peer_id)
            .is_some_and(|r| r.token == registration.token);
        if ours {
            swarm.remove(&registration.peer_id);
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
        let empty = swarm.is_empty();
        drop(swarm);
        if empty {
            self.swarms.remove_if(&registration.info_hash, |_, peers| peers.is_empty());
        }
    }

    pub fn is_registered(&self, info_hash: &[u8; 20], peer_id: &[u8; 20]) -> bool {
        self.swarms
            .get(info_hash)
            .is_some_and(|swarm| swarm.contains_key(peer_id))
    }

    pub fn swarm_len(&self, info_hash: &[u8; 20]) -> usize {
        self.swarms.get(info_hash).map_or(0, |swarm| swarm.len())
    }

    pub fn len(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether a new connection for an already registered id wins.
fn replaces(new: SocketAddr, existing: SocketAddr, prefer_ipv6: bool) -> bool {
    if is_lan_local(new.ip()) && (!is_lan_local(existing.ip()) || is_gateway(existing.ip())) {
        return true;
    }
    if new.is_ipv6() != existing.is_ipv6() {
        return new.is_ipv6() == prefer_ipv6;
    }
    false
}

/// Private, loopback and link-local addresses.
pub fn is_lan_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || first & 0xfe00 == 0xfc00 || first & 0xffc0 == 0xfe80
        }
    }
}

/// Home routers usually sit on `.1` or `.254`; a LAN connection that looks
/// like it came through one is really a NATed outside peer.
fn is_gateway(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => matches!(v4.octets()[3], 1 | 254),
        IpAddr::V6(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Evicted(Mutex<Vec<CloseReason>>);

    impl Evict for Evicted {
        fn evict(&self, reason: CloseReason) {
            self.0.lock().push(reason);
        }
    }

    fn handle() -> (Arc<Evicted>, Weak<dyn Evict>) {
        let conn = Arc::new(Evicted::default());
        let weak = Arc::downgrade(&conn) as Weak<dyn Evict>;
        (conn, weak)
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    const HASH: [u8; 20] = [1; 20];

    #[test]
    fn test_register_and_unregister() {
        let registry = IdentityRegistry::new();
        let (_conn, weak) = handle();
        let config = PeerConfig::default();
        let reg = registry
            .register(HASH, [2; 20], addr("8.8.8.8:6881"), ConnectionClass::default(), &config, weak)
            .unwrap();
        assert!(registry.is_registered(&HASH, &[2; 20]));
        assert_eq!(registry.len(), 1);

        registry.unregister(&reg);
        assert!(registry.is_empty());
        assert_eq!(registry.swarm_len(&HASH), 0);
    }

    #[test]
    fn test_duplicate_identity_refused() {
        let registry = IdentityRegistry::new();
        let config = PeerConfig::default();
        let (_a, wa) = handle();
        let (_b, wb) = handle();
        registry
            .register(HASH, [2; 20], addr("8.8.8.8:6881"), ConnectionClass::default(), &config, wa)
            .unwrap();
        let err = registry
            .register(HASH, [2; 20], addr("9.9.9.9:6881"), ConnectionClass::default(), &config, wb)
            .unwrap_err();
        assert!(matches!(err, PeerError::DuplicateIdentity));
    }

    #[test]
    fn test_lan_connection_replaces_gateway() {
        let registry = IdentityRegistry::new();
        let config = PeerConfig::default();
        let (old, wa) = handle();
        let (_new, wb) = handle();
        let first = registry
            .register(HASH, [2; 20], addr("192.168.1.1:6881"), ConnectionClass::default(), &config, wa)
            .unwrap();
        registry
            .register(HASH, [2; 20], addr("192.168.1.20:6881"), ConnectionClass::default(), &config, wb)
            .unwrap();
        assert_eq!(old.0.lock().len(), 1);

        // The evicted connection's own unregister must not remove the winner.
        registry.unregister(&first);
        assert!(registry.is_registered(&HASH, &[2; 20]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_address_family_preference() {
        let registry = IdentityRegistry::new();
        let config = PeerConfig {
            prefer_ipv6: true,
            ..PeerConfig::default()
        };
        let (old, wa) = handle();
        let (_new, wb) = handle();
        registry
            .register(HASH, [2; 20], addr("8.8.8.8:6881"), ConnectionClass::default(), &config, wa)
            .unwrap();
        registry
            .register(HASH, [2; 20], addr("[2001:db8::1]:6881"), ConnectionClass::default(), &config, wb)
            .unwrap();
        assert_eq!(old.0.lock().len(), 1);

        let (_v4, wc) = handle();
        let err = registry
            .register(HASH, [2; 20], addr("8.8.4.4:6881"), ConnectionClass::default(), &config, wc)
            .unwrap_err();
        assert!(matches!(err, PeerError::DuplicateIdentity));
    }

    #[test]
    fn test_same_ip_refused_unless_allowed() {
        let registry = IdentityRegistry::new();
        let mut config = PeerConfig::default();
        let (_a, wa) = handle();
        let (_b, wb) = handle();
        registry
            .register(HASH, [2; 20], addr("8.8.8.8:6881"), ConnectionClass::default(), &config, wa)
            .unwrap();
        let err = registry
            .register(HASH, [3; 20], addr("8.8.8.8:7000"), ConnectionClass::default(), &config, wb.clone())
            .unwrap_err();
        assert!(matches!(err, PeerError::SameIp));

        config.allow_same_ip = true;
        registry
            .register(HASH, [3; 20], addr("8.8.8.8:7000"), ConnectionClass::default(), &config, wb)
            .unwrap();
    }

    #[test]
    fn test_limits_and_bypass() {
        let registry = IdentityRegistry::new();
        let config = PeerConfig {
            max_peers_per_swarm: 1,
            ..PeerConfig::default()
        };
        let (_a, wa) = handle();
        let (_b, wb) = handle();
        registry
            .register(HASH, [2; 20], addr("8.8.8.8:6881"), ConnectionClass::default(), &config, wa)
            .unwrap();
        let err = registry
            .register(HASH, [3; 20], addr("9.9.9.9:6881"), ConnectionClass::default(), &config, wb.clone())
            .unwrap_err();
        assert!(matches!(err, PeerError::ConnectionLimit));

        let optimistic = ConnectionClass {
            optimistic: true,
            ..ConnectionClass::default()
        };
        registry
            .register(HASH, [3; 20], addr("9.9.9.9:6881"), optimistic, &config, wb)
            .unwrap();
        assert_eq!(registry.swarm_len(&HASH), 2);
    }

    #[test]
    fn test_banned_clients() {
        let registry = IdentityRegistry::new();
        registry.ban_client("BadClient");
        assert!(registry.is_banned("BadClient 1.0"));
        assert!(!registry.is_banned("qBittorrent 4.6"));
        registry.unban_client("BadClient");
        assert!(!registry.is_banned("BadClient 1.0"));
    }

    #[test]
    fn test_lan_detection() {
        assert!(is_lan_local("10.0.0.5".parse().unwrap()));
        assert!(is_lan_local("fe80::1".parse().unwrap()));
        assert!(!is_lan_local("8.8.8.8".parse().unwrap()));
        assert!(is_gateway("192.168.0.254".parse().unwrap()));
    }
}
