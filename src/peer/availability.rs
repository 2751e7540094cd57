//! The peer's have-set and what follows from it: seed and relative-seed
//! classification, whether the peer is interesting, and the lazy bitfield we
//! announce in the other direction.

use rand::seq::IteratorRandom;
use rand::Rng;

use super::bitfield::Bitfield;
use super::error::PeerError;
use crate::constants::{LAZY_EXTRA_MAX, LAZY_EXTRA_MIN};

const UPLOAD_ONLY_INDICATED: u8 = 0x01;
const UPLOAD_ONLY_SEED: u8 = 0x02;

/// What this side knows about its own pieces when classifying a peer.
pub struct LocalView<'a, F: Fn(u32) -> bool> {
    pub seeding: bool,
    pub done: &'a Bitfield,
    /// Whether a piece is still wanted by the local selector.
    pub needed: F,
}

#[derive(Debug, Clone)]
pub struct Availability {
    piece_count: usize,
    /// `None` until the peer announces anything.
    have: Option<Bitfield>,
    relative_seed: u8,
}

impl Availability {
    pub fn new(piece_count: usize) -> Self {
        Self {
            piece_count,
            have: None,
            relative_seed: 0,
        }
    }

    pub fn have_set(&self) -> Option<&Bitfield> {
        self.have.as_ref()
    }

    /// Number of pieces the peer has announced.
    pub fn count(&self) -> usize {
        self.have.as_ref().map_or(0, Bitfield::count)
    }

    pub fn has(&self, piece: u32) -> bool {
        self.have.as_ref().is_some_and(|h| h.has(piece as usize))
    }

    fn have_mut(&mut self) -> &mut Bitfield {
        let piece_count = self.piece_count;
        self.have.get_or_insert_with(|| Bitfield::new(piece_count))
    }

    /// Replaces the have-set with a bitfield message body.
    pub fn apply_bitfield(&mut self, bytes: &[u8]) -> Result<&Bitfield, PeerError> {
        let parsed =
            Bitfield::from_wire(bytes, self.piece_count).ok_or(PeerError::MalformedBitfield {
                got: bytes.len(),
                expected: self.piece_count.div_ceil(8),
            })?;
        Ok(self.have.insert(parsed))
    }

    /// Records one piece; returns whether it was new.
    pub fn apply_have(&mut self, piece: u32) -> Result<bool, PeerError> {
        if piece as usize >= self.piece_count {
            return Err(PeerError::InvalidMessage(format!("have for piece {piece}")));
        }
        Ok(self.have_mut().set(piece as usize))
    }

    pub fn apply_have_all(&mut self) -> &Bitfield {
        let have = self.have_mut();
        have.set_all();
        have
    }

    pub fn apply_have_none(&mut self) -> &Bitfield {
        let have = self.have_mut();
        have.clear_all();
        have
    }

    /// Takes the have-set away, e.g. when the connection closes.
    pub fn retract(&mut self) -> Option<Bitfield> {
        self.have.take()
    }

    pub fn is_seed(&self) -> bool {
        self.have.as_ref().is_some_and(Bitfield::is_full)
    }

    pub fn is_relative_seed(&self) -> bool {
        self.relative_seed & UPLOAD_ONLY_SEED != 0
    }

    pub fn set_upload_only(&mut self, upload_only: bool) {
        if upload_only {
            self.relative_seed |= UPLOAD_ONLY_INDICATED;
        } else {
            self.relative_seed &= !UPLOAD_ONLY_INDICATED;
        }
    }

    pub fn upload_only_indicated(&self) -> bool {
        self.relative_seed & UPLOAD_ONLY_INDICATED != 0
    }

    /// Re-evaluates the relative-seed classification.
    pub fn check_seed<F: Fn(u32) -> bool>(&mut self, local: &LocalView<'_, F>) {
        let indicated = self.upload_only_indicated();
        let relative = match &self.have {
            _ if local.seeding && (self.is_seed() || indicated) => true,
            Some(have) if !local.seeding && indicated => have
                .ones()
                .all(|p| local.done.has(p) || !(local.needed)(p as u32)),
            Some(have) if local.seeding && local.done.count() <= have.count() => {
                local.done.ones().all(|p| have.has(p))
            }
            _ => false,
        };
        if relative {
            self.relative_seed |= UPLOAD_ONLY_SEED;
        } else {
            self.relative_seed &= !UPLOAD_ONLY_SEED;
        }
    }

    /// Whether we should be interested in the peer. `None` when the peer
    /// has not announced anything yet, in which case interest is unchanged.
    pub fn compute_interest(
        &self,
        download_allowed: bool,
        any_downloadable: bool,
        interesting: impl Fn(u32) -> bool,
    ) -> Option<bool> {
        let have = self.have.as_ref()?;
        if have.is_empty() || !download_allowed || !any_downloadable {
            return Some(false);
        }
        if self.is_seed() || self.is_relative_seed() {
            return Some(true);
        }
        Some(have.ones().any(|p| interesting(p as u32)))
    }
}

/// The bitfield we actually send in lazy mode, and the pieces left out.
#[derive(Debug, Clone)]
pub struct LazyBitfield {
    pub bitfield: Bitfield,
    pub withheld: Vec<u32>,
}

/// Withholds one done piece from the first byte, one from the last byte and
/// a handful of others.
pub fn lazy_bitfield<R: Rng + ?Sized>(done: &Bitfield, rng: &mut R) -> LazyBitfield {
    let mut bitfield = done.clone();
    let mut withheld = Vec::new();
    let count = done.piece_count();
    let mut withhold = |bitfield: &mut Bitfield, piece: usize| {
        if bitfield.clear(piece) {
            withheld.push(piece as u32);
        }
    };

    let first_byte = 0..count.min(8);
    let last_byte = (count.saturating_sub(1) / 8 * 8)..count;
    for range in [first_byte, last_byte] {
        let pick = range.filter(|&p| bitfield.has(p)).choose(rng);
        if let Some(piece) = pick {
            withhold(&mut bitfield, piece);
        }
    }

    let extra = rng.random_range(LAZY_EXTRA_MIN..=LAZY_EXTRA_MAX);
    let candidates = bitfield.ones().choose_multiple(rng, extra);
    for piece in candidates {
        withhold(&mut bitfield, piece);
    }

    LazyBitfield { bitfield, withheld }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(n: usize) -> Bitfield {
        Bitfield::full(n)
    }

    #[test]
    fn test_have_set_is_lazily_allocated() {
        let mut avail = Availability::new(16);
        assert!(avail.have_set().is_none());
        assert_eq!(avail.apply_have(3).unwrap(), true);
        assert_eq!(avail.apply_have(3).unwrap(), false);
        assert_eq!(avail.count(), 1);
    }

    #[test]
    fn test_have_out_of_range() {
        let mut avail = Availability::new(16);
        assert!(avail.apply_have(16).is_err());
    }

    #[test]
    fn test_malformed_bitfield_is_a_data_anomaly() {
        let mut avail = Availability::new(16);
        let err = avail.apply_bitfield(&[0xff]).unwrap_err();
        assert!(!err.is_fatal());
        assert!(avail.have_set().is_none());
    }

    #[test]
    fn test_seed_requires_pieces() {
        let mut avail = Availability::new(0);
        avail.apply_have_all();
        assert!(!avail.is_seed());

        let mut avail = Availability::new(10);
        avail.apply_have_all();
        assert!(avail.is_seed());
    }

    #[test]
    fn test_relative_seed_while_seeding() {
        let done = full(8);
        let mut avail = Availability::new(8);
        avail.apply_bitfield(&[0xff]).unwrap();
        avail.check_seed(&LocalView {
            seeding: true,
            done: &done,
            needed: |_| false,
        });
        assert!(avail.is_relative_seed());
    }

    #[test]
    fn test_upload_only_peer_with_nothing_we_need() {
        let mut done = Bitfield::new(8);
        done.set(0);
        let mut avail = Availability::new(8);
        avail.apply_bitfield(&[0b1100_0000]).unwrap();
        avail.set_upload_only(true);

        let view = LocalView {
            seeding: false,
            done: &done,
            needed: |p| p != 1,
        };
        avail.check_seed(&view);
        assert!(avail.is_relative_seed());

        let view = LocalView {
            seeding: false,
            done: &done,
            needed: |_| true,
        };
        avail.check_seed(&view);
        assert!(!avail.is_relative_seed());
    }

    #[test]
    fn test_interest() {
        let mut avail = Availability::new(8);
        assert_eq!(avail.compute_interest(true, true, |_| true), None);

        avail.apply_have(2).unwrap();
        assert_eq!(avail.compute_interest(true, true, |p| p == 2), Some(true));
        assert_eq!(avail.compute_interest(true, true, |p| p == 3), Some(false));
        assert_eq!(avail.compute_interest(false, true, |_| true), Some(false));

        avail.apply_have_all();
        assert_eq!(avail.compute_interest(true, true, |_| false), Some(true));
    }

    #[test]
    fn test_lazy_bitfield_withholds_edges() {
        let done = full(100);
        let mut rng = rand::rng();
        let lazy = lazy_bitfield(&done, &mut rng);

        assert!(lazy.withheld.iter().any(|&p| p < 8));
        assert!(lazy.withheld.iter().any(|&p| p >= 96));
        assert!(lazy.withheld.len() >= 2 + LAZY_EXTRA_MIN);
        assert!(lazy.withheld.len() <= 2 + LAZY_EXTRA_MAX);
        assert_eq!(lazy.bitfield.count() + lazy.withheld.len(), 100);
        for piece in &lazy.withheld {
            assert!(!lazy.bitfield.has(*piece as usize));
        }
    }

    #[test]
    fn test_lazy_bitfield_with_few_pieces() {
        let mut done = Bitfield::new(20);
        done.set(5);
        let lazy = lazy_bitfield(&done, &mut rand::rng());
        assert_eq!(lazy.withheld, vec![5]);
        assert!(lazy.bitfield.is_empty());
    }
}
