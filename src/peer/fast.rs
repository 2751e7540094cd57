//! Fast extension (BEP-6) bookkeeping.
//!
//! Two independent sets per connection: the pieces we offer the peer while
//! choking it ([`AllowedFastOffer`]), each with a byte budget, and the pieces
//! the peer lets us fetch while it chokes us ([`AllowedFastGrant`]), which
//! drive a priority overlay for request admission.

use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use crate::constants::{ALLOWED_FAST_RECEIVED_MAX, PRIORITY_NEVER};

/// Generates the allowed-fast set for a peer.
///
/// Deterministic in all four inputs: the same arguments always produce the
/// same ordered list. At most `min(count, num_pieces)` distinct indices are
/// returned. IPv6 peers get an empty set.
pub fn generate_allowed_fast_set(
    info_hash: &[u8; 20],
    peer_ip: IpAddr,
    num_pieces: u32,
    count: usize,
) -> Vec<u32> {
    let IpAddr::V4(ip) = peer_ip else {
        return Vec::new();
    };
    let wanted = count.min(num_pieces as usize);
    let mut set = Vec::with_capacity(wanted);
    if wanted == 0 {
        return set;
    }

    let octets = ip.octets();
    let mut x = Vec::with_capacity(24);
    x.extend_from_slice(&[octets[0], octets[1], octets[2], 0]);
    x.extend_from_slice(info_hash);

    while set.len() < wanted {
        let hash = Sha1::digest(&x);
        for chunk in hash.chunks_exact(4) {
            if set.len() == wanted {
                break;
            }
            let index = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) % num_pieces;
            if !set.contains(&index) {
                set.push(index);
            }
        }
        x = hash.to_vec();
    }
    set
}

/// Result of checking a choked peer's request against the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferCheck {
    /// Piece offered and the request fits the remaining budget.
    Allowed,
    /// Piece offered but the budget is exhausted by this request.
    OverBudget,
    NotOffered,
}

/// Pieces we allowed the peer to fetch while choked, with remaining bytes.
#[derive(Debug, Clone, Default)]
pub struct AllowedFastOffer {
    budgets: BTreeMap<u32, u64>,
    generated: bool,
}

impl AllowedFastOffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the offer was ever generated on this connection.
    pub fn was_generated(&self) -> bool {
        self.generated
    }

    /// Records the offer; budgets are per piece.
    pub fn offer(&mut self, pieces: &[u32], budget: impl Fn(u32) -> u64) {
        self.generated = true;
        for &piece in pieces {
            self.budgets.insert(piece, budget(piece));
        }
    }

    pub fn contains(&self, piece: u32) -> bool {
        self.budgets.contains_key(&piece)
    }

    pub fn check(&self, piece: u32, length: u32) -> OfferCheck {
        match self.budgets.get(&piece) {
            None => OfferCheck::NotOffered,
            Some(&left) if u64::from(length) > left => OfferCheck::OverBudget,
            Some(_) => OfferCheck::Allowed,
        }
    }

    /// Charges a served block; the offer for the piece ends at zero.
    pub fn charge(&mut self, piece: u32, length: u32) {
        if let Some(left) = self.budgets.get_mut(&piece) {
            *left = left.saturating_sub(u64::from(length));
            if *left == 0 {
                self.budgets.remove(&piece);
            }
        }
    }

    pub fn remaining(&self, piece: u32) -> Option<u64> {
        self.budgets.get(&piece).copied()
    }

    pub fn clear(&mut self) {
        self.budgets.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.budgets.is_empty()
    }
}

/// Pieces the peer allowed us to fetch while it chokes us.
#[derive(Debug, Clone, Default)]
pub struct AllowedFastGrant {
    pieces: BTreeSet<u32>,
}

impl AllowedFastGrant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a piece; returns false once the set is full or already has it.
    pub fn insert(&mut self, piece: u32) -> bool {
        if self.pieces.len() >= ALLOWED_FAST_RECEIVED_MAX {
            return false;
        }
        self.pieces.insert(piece)
    }

    pub fn remove(&mut self, piece: u32) -> bool {
        self.pieces.remove(&piece)
    }

    pub fn contains(&self, piece: u32) -> bool {
        self.pieces.contains(&piece)
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn clear(&mut self) {
        self.pieces.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.pieces.iter().copied()
    }

    /// Priority overlay: `PRIORITY_NEVER` everywhere except granted pieces,
    /// which get zero.
    pub fn overlay(&self, piece_count: u32) -> Vec<i32> {
        let mut priorities = vec![PRIORITY_NEVER; piece_count as usize];
        for piece in self.iter() {
            if let Some(slot) = priorities.get_mut(piece as usize) {
                *slot = 0;
            }
        }
        priorities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference values from BEP-6: 7 of 1313 pieces for 80.4.4.200.
    #[test]
    fn test_bep6_reference_vector() {
        let info_hash = [0xaa; 20];
        let set = generate_allowed_fast_set(&info_hash, "80.4.4.200".parse().unwrap(), 1313, 7);
        assert_eq!(set, vec![1059, 431, 808, 1217, 287, 376, 1188]);

        let set = generate_allowed_fast_set(&info_hash, "80.4.4.200".parse().unwrap(), 1313, 9);
        assert_eq!(set, vec![1059, 431, 808, 1217, 287, 376, 1188, 353, 508]);
    }

    #[test]
    fn test_generation_is_reproducible() {
        let ip = "10.1.2.3".parse().unwrap();
        let a = generate_allowed_fast_set(&[5; 20], ip, 500, 10);
        let b = generate_allowed_fast_set(&[5; 20], ip, 500, 10);
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
    }

    #[test]
    fn test_low_octet_does_not_matter() {
        let a = generate_allowed_fast_set(&[5; 20], "10.1.2.3".parse().unwrap(), 500, 10);
        let b = generate_allowed_fast_set(&[5; 20], "10.1.2.250".parse().unwrap(), 500, 10);
        assert_eq!(a, b);
    }

    #[test]
    fn test_wanting_more_than_available_terminates() {
        let set = generate_allowed_fast_set(&[7; 20], "1.2.3.4".parse().unwrap(), 4, 10);
        let mut sorted = set.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3]);
        assert!(generate_allowed_fast_set(&[7; 20], "1.2.3.4".parse().unwrap(), 0, 10).is_empty());
    }

    #[test]
    fn test_ipv6_gets_nothing() {
        assert!(generate_allowed_fast_set(&[1; 20], "::1".parse().unwrap(), 100, 10).is_empty());
    }

    #[test]
    fn test_offer_budget() {
        let mut offer = AllowedFastOffer::new();
        offer.offer(&[3], |_| 32_768);
        assert_eq!(offer.check(3, 16_384), OfferCheck::Allowed);
        offer.charge(3, 16_384);
        offer.charge(3, 16_384);
        assert_eq!(offer.check(3, 16_384), OfferCheck::NotOffered);

        offer.offer(&[4], |_| 10_000);
        assert_eq!(offer.check(4, 16_384), OfferCheck::OverBudget);
    }

    #[test]
    fn test_grant_cap_and_overlay() {
        let mut grant = AllowedFastGrant::new();
        for piece in 0..30 {
            grant.insert(piece);
        }
        assert_eq!(grant.len(), ALLOWED_FAST_RECEIVED_MAX);

        let mut grant = AllowedFastGrant::new();
        grant.insert(1);
        grant.insert(3);
        grant.insert(99);
        let overlay = grant.overlay(4);
        assert_eq!(overlay, vec![PRIORITY_NEVER, 0, PRIORITY_NEVER, 0]);
    }
}
