//! The bridge hashring.
//!
//! A ring is an ordered mapping from HMAC positions to bridges.  Each
//! bridge sits at `HMAC(ring key, fingerprint)`; a request maps to a
//! position of its own and is answered with the next bridges clockwise
//! from there, wrapping at the end.  Since both sides of the mapping are
//! keyed HMACs, neighbouring requesters see stable but unrelated slices
//! of the ring, and the slices reshuffle whenever the epoch (part of the
//! request position input) changes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display};
use std::sync::Arc;

use crate::key::DIGEST_LEN;
use crate::{AnswerParameters, Bridge, BridgeFingerprint, HmacKey};

/// A position on a hashring.
///
/// Positions are the raw 20-byte HMAC-SHA1 output, ordered as big-endian
/// unsigned integers (which is exactly their lexicographic byte order).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingPosition([u8; DIGEST_LEN]);

impl From<[u8; DIGEST_LEN]> for RingPosition {
    fn from(bytes: [u8; DIGEST_LEN]) -> Self {
        RingPosition(bytes)
    }
}

impl Display for RingPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for RingPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RingPosition({})", self)
    }
}

/// An ordered ring of bridges, keyed by HMAC of their fingerprints.
///
/// A ring can be cheaply cloned; the bridges themselves are shared.
/// Collisions between two distinct fingerprints are treated as
/// impossible (they would need an HMAC-SHA1 collision); inserting the
/// same fingerprint twice replaces the earlier record.
#[derive(Clone, Debug)]
pub struct BridgeRing {
    /// The key under which bridges are positioned.
    key: HmacKey,
    /// Requirements on the answers this ring produces.
    params: AnswerParameters,
    /// The ring itself, ordered by position.
    ring: BTreeMap<RingPosition, Arc<Bridge>>,
    /// Fingerprint-to-position index, so replacement is by identity.
    positions: HashMap<BridgeFingerprint, RingPosition>,
}

impl BridgeRing {
    /// Return a new empty ring positioning bridges under `key`.
    pub fn new(key: HmacKey, params: AnswerParameters) -> Self {
        BridgeRing {
            key,
            params,
            ring: BTreeMap::new(),
            positions: HashMap::new(),
        }
    }

    /// Return the position `bridge` has (or would have) on this ring.
    pub fn position_of(&self, bridge: &Bridge) -> RingPosition {
        RingPosition(self.key.digest(bridge.fingerprint.as_bytes()))
    }

    /// Insert `bridge`, replacing any earlier record with the same
    /// fingerprint.
    pub fn insert(&mut self, bridge: Arc<Bridge>) {
        let pos = self.position_of(&bridge);
        if let Some(old) = self.positions.insert(bridge.fingerprint, pos) {
            self.ring.remove(&old);
        }
        self.ring.insert(pos, bridge);
    }

    /// Return the number of bridges on the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Return true if the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Iterate over the bridges in ring order.
    pub fn bridges(&self) -> impl Iterator<Item = &Arc<Bridge>> {
        self.ring.values()
    }

    /// Iterate clockwise from `pos`, wrapping around once.
    fn walk_from(&self, pos: RingPosition) -> impl Iterator<Item = &Arc<Bridge>> {
        self.ring
            .range(pos..)
            .chain(self.ring.range(..pos))
            .map(|(_, b)| b)
    }

    /// Return up to `n` bridges walking clockwise from `pos`.
    ///
    /// If the ring carries answer parameters, bridges satisfying unmet
    /// requirements are picked first; remaining slots are then filled in
    /// ring order.  No bridge appears twice.  If fewer than `n`
    /// qualifying bridges exist, the answer is simply shorter.
    pub fn bridges_at(&self, pos: RingPosition, n: usize) -> Vec<Arc<Bridge>> {
        let mut answer: Vec<Arc<Bridge>> = Vec::with_capacity(n.min(self.ring.len()));
        let mut taken: HashSet<BridgeFingerprint> = HashSet::new();

        for constraint in self.params.constraints() {
            let mut need = constraint.count;
            for bridge in self.walk_from(pos) {
                if need == 0 || answer.len() >= n {
                    break;
                }
                if constraint.matches(bridge) && taken.insert(bridge.fingerprint) {
                    answer.push(Arc::clone(bridge));
                    need -= 1;
                }
            }
        }

        for bridge in self.walk_from(pos) {
            if answer.len() >= n {
                break;
            }
            if taken.insert(bridge.fingerprint) {
                answer.push(Arc::clone(bridge));
            }
        }

        answer
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use crate::testing::{fake_bridge, fake_bridge_on_port, test_key};

    /// A ring with `n` deterministic bridges.
    fn ring_of(n: u32) -> BridgeRing {
        let mut ring = BridgeRing::new(test_key("Order-Bridges-In-Ring-0"), AnswerParameters::new());
        for i in 0..n {
            ring.insert(Arc::new(fake_bridge(i)));
        }
        ring
    }

    #[test]
    fn insert_and_replace() {
        let mut ring = ring_of(10);
        assert_eq!(ring.len(), 10);

        // Reinserting the same identity replaces, not duplicates.
        let mut updated = fake_bridge(3);
        updated.or_port = 4443;
        ring.insert(Arc::new(updated));
        assert_eq!(ring.len(), 10);
        let got = ring
            .bridges()
            .find(|b| b.fingerprint == fake_bridge(3).fingerprint)
            .unwrap();
        assert_eq!(got.or_port, 4443);
    }

    #[test]
    fn walk_wraps_and_never_repeats() {
        let ring = ring_of(8);
        // Walking from the very top of the position space must wrap.
        let top = RingPosition([0xff; DIGEST_LEN]);
        let got = ring.bridges_at(top, 8);
        assert_eq!(got.len(), 8);
        let distinct: HashSet<_> = got.iter().map(|b| b.fingerprint).collect();
        assert_eq!(distinct.len(), 8);

        // Asking for more than exists returns what exists.
        assert_eq!(ring.bridges_at(top, 100).len(), 8);
    }

    #[test]
    fn deterministic_order() {
        let a = ring_of(64);
        let b = ring_of(64);
        let pos = RingPosition([0x42; DIGEST_LEN]);
        let fps_a: Vec<_> = a.bridges_at(pos, 5).iter().map(|b| b.fingerprint).collect();
        let fps_b: Vec<_> = b.bridges_at(pos, 5).iter().map(|b| b.fingerprint).collect();
        assert_eq!(fps_a, fps_b);
    }

    #[test]
    fn port_constraint_is_enforced() {
        let params = AnswerParameters::new().require_port(443, 1);
        let mut ring = BridgeRing::new(test_key("Order-Bridges-In-Ring-0"), params);
        // Many bridges on an uninteresting port, a few on 443.
        for i in 0..60 {
            ring.insert(Arc::new(fake_bridge_on_port(i, 9001)));
        }
        for i in 60..68 {
            ring.insert(Arc::new(fake_bridge_on_port(i, 443)));
        }

        for seed in 0..32_u8 {
            let got = ring.bridges_at(RingPosition([seed; DIGEST_LEN]), 5);
            assert_eq!(got.len(), 5);
            let distinct: HashSet<_> = got.iter().map(|b| b.fingerprint).collect();
            assert_eq!(distinct.len(), 5);
            assert!(got.iter().any(|b| b.or_port == 443));
        }
    }

    #[test]
    fn constraint_cannot_be_met() {
        let params = AnswerParameters::new().require_port(443, 2);
        let mut ring = BridgeRing::new(test_key("Order-Bridges-In-Ring-0"), params);
        for i in 0..10 {
            ring.insert(Arc::new(fake_bridge_on_port(i, 9001)));
        }
        // No port-443 bridge exists; we still answer.
        let got = ring.bridges_at(RingPosition([0; DIGEST_LEN]), 3);
        assert_eq!(got.len(), 3);
    }
}
