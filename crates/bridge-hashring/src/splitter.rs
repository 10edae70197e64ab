//! Splitters: structures that partition the bridge catalogue.
//!
//! Two kinds of partition happen here.  The [`BridgeSplitter`] sits at
//! the top and assigns every bridge to exactly one distribution channel,
//! by HMAC modulo the configured share weights.  Inside each channel, a
//! [`FilteredBridgeSplitter`] holds that channel's bridges and derives
//! cached sub-rings from them, one per ruleset.
//!
//! Sub-rings created while prepopulating are pinned: they are both the
//! source of the assignment dump and a warm cache for the request path,
//! so the LRU never evicts them.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::{AnswerParameters, Bridge, BridgeFingerprint, BridgeRing, HmacKey, Ruleset};

/// One cached, unpinned sub-ring.
struct CachedRing {
    /// The ring.
    ring: Arc<BridgeRing>,
    /// Recency stamp; larger is more recent.
    last_used: u64,
}

/// The sub-ring cache of a [`FilteredBridgeSplitter`].
///
/// Lives behind a mutex so that recency bookkeeping is atomic with the
/// lookup that triggers it.
struct RingCache {
    /// Pinned sub-rings, in the order prepopulation added them.  Never
    /// evicted; this order is the assignment-dump order.
    pinned: Vec<(Ruleset, Arc<BridgeRing>)>,
    /// Unpinned sub-rings, evicted least-recently-used first.
    cached: HashMap<Ruleset, CachedRing>,
    /// Source of recency stamps.
    clock: u64,
}

impl RingCache {
    /// Return an empty cache.
    fn new() -> Self {
        RingCache {
            pinned: Vec::new(),
            cached: HashMap::new(),
            clock: 0,
        }
    }

    /// Look up `ruleset`, updating recency if it is an unpinned entry.
    fn get(&mut self, ruleset: &Ruleset) -> Option<Arc<BridgeRing>> {
        if let Some((_, ring)) = self.pinned.iter().find(|(rs, _)| rs == ruleset) {
            return Some(Arc::clone(ring));
        }
        self.clock += 1;
        let clock = self.clock;
        self.cached.get_mut(ruleset).map(|entry| {
            entry.last_used = clock;
            Arc::clone(&entry.ring)
        })
    }

    /// Evict least-recently-used unpinned entries until fewer than
    /// `max` remain.
    fn evict_down_to(&mut self, max: usize) {
        while self.cached.len() >= max {
            let victim = self
                .cached
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(rs, _)| rs.clone());
            match victim {
                Some(rs) => {
                    debug!("evicting cached sub-ring [{}]", rs);
                    self.cached.remove(&rs);
                }
                None => break,
            }
        }
    }
}

/// A bridge set together with a bounded cache of filtered sub-rings.
///
/// Every live sub-ring is kept consistent with the bridge set: an
/// inserted bridge lands in each sub-ring whose ruleset it satisfies.
/// Rings are handed out as `Arc` clones, and mutation goes through
/// copy-on-write, so a reader that obtained a ring before a catalogue
/// change keeps a consistent pre-change view.
pub struct FilteredBridgeSplitter {
    /// The ring-assignment key; sub-ring order keys are derived from it.
    key: HmacKey,
    /// Bound on the number of unpinned cached sub-rings.
    max_cached_rings: usize,
    /// All bridges of this channel, by identity.
    bridges: HashMap<BridgeFingerprint, Arc<Bridge>>,
    /// The sub-ring cache.
    cache: Mutex<RingCache>,
}

impl FilteredBridgeSplitter {
    /// Return a new splitter with no bridges.
    ///
    /// `key` is this channel's ring-assignment key; at most
    /// `max_cached_rings` sub-rings beyond the pinned ones are kept.
    pub fn new(key: HmacKey, max_cached_rings: usize) -> Self {
        FilteredBridgeSplitter {
            key,
            max_cached_rings,
            bridges: HashMap::new(),
            cache: Mutex::new(RingCache::new()),
        }
    }

    /// Return the ring-assignment key.
    pub fn key(&self) -> &HmacKey {
        &self.key
    }

    /// Return the number of bridges held.
    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    /// Return true if no bridges are held.
    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    /// Iterate over all bridges of this channel, in no particular
    /// order.
    pub fn bridges(&self) -> impl Iterator<Item = &Arc<Bridge>> {
        self.bridges.values()
    }

    /// Add `bridge`, updating every live sub-ring whose ruleset accepts
    /// it.
    pub fn insert(&mut self, bridge: Arc<Bridge>) {
        self.bridges.insert(bridge.fingerprint, Arc::clone(&bridge));
        let mut cache = self.cache.lock().expect("poisoned lock");
        for (ruleset, ring) in &mut cache.pinned {
            if ruleset.matches(&bridge) {
                Arc::make_mut(ring).insert(Arc::clone(&bridge));
            }
        }
        for (ruleset, entry) in &mut cache.cached {
            if ruleset.matches(&bridge) {
                Arc::make_mut(&mut entry.ring).insert(Arc::clone(&bridge));
            }
        }
    }

    /// Register a pinned sub-ring for `ruleset`, populating it from the
    /// held bridges.  Reregistering an already-pinned ruleset is a
    /// no-op.
    pub fn add_pinned_ring(&mut self, ruleset: Ruleset, ring: BridgeRing) {
        let mut cache = self.cache.lock().expect("poisoned lock");
        if cache.pinned.iter().any(|(rs, _)| *rs == ruleset) {
            return;
        }
        // A ruleset that was cached unpinned gets promoted: drop the
        // cached copy so there is only one live ring per ruleset.
        cache.cached.remove(&ruleset);
        let mut ring = ring;
        for bridge in self.bridges.values() {
            if ruleset.matches(bridge) {
                ring.insert(Arc::clone(bridge));
            }
        }
        debug!("pinned sub-ring [{}] with {} bridges", ruleset, ring.len());
        cache.pinned.push((ruleset, Arc::new(ring)));
    }

    /// Look up the sub-ring for `ruleset`, or `None` if it is not live.
    pub fn lookup(&self, ruleset: &Ruleset) -> Option<Arc<BridgeRing>> {
        self.cache.lock().expect("poisoned lock").get(ruleset)
    }

    /// Look up the sub-ring for `ruleset`, building it with `order_key`
    /// and `params` and caching it on a miss.
    pub fn lookup_or_add(
        &self,
        ruleset: Ruleset,
        order_key: HmacKey,
        params: AnswerParameters,
    ) -> Arc<BridgeRing> {
        let mut cache = self.cache.lock().expect("poisoned lock");
        if let Some(ring) = cache.get(&ruleset) {
            return ring;
        }
        debug!("cache miss for sub-ring [{}]", ruleset);
        let mut ring = BridgeRing::new(order_key, params);
        for bridge in self.bridges.values() {
            if ruleset.matches(bridge) {
                ring.insert(Arc::clone(bridge));
            }
        }
        let ring = Arc::new(ring);
        cache.evict_down_to(self.max_cached_rings);
        cache.clock += 1;
        let last_used = cache.clock;
        cache.cached.insert(
            ruleset,
            CachedRing {
                ring: Arc::clone(&ring),
                last_used,
            },
        );
        ring
    }

    /// Drop all bridges and all sub-rings, pinned ones included.
    pub fn clear(&mut self) {
        self.bridges.clear();
        let mut cache = self.cache.lock().expect("poisoned lock");
        cache.pinned.clear();
        cache.cached.clear();
        cache.clock = 0;
    }

    /// Write the assignment dump for this channel: one line per bridge
    /// per pinned sub-ring containing it, `<fingerprint> <ruleset
    /// descriptions>`.
    pub fn dump_assignments(&self, w: &mut dyn Write) -> io::Result<()> {
        let cache = self.cache.lock().expect("poisoned lock");
        for (ruleset, ring) in &cache.pinned {
            for bridge in ring.bridges() {
                writeln!(w, "{} {}", bridge.fingerprint, ruleset.description())?;
            }
        }
        Ok(())
    }
}

/// Something that can hold the bridges assigned to one distribution
/// channel.
///
/// Implemented by the distributors, and by [`UnallocatedHolder`] for the
/// reserved share.
pub trait BridgeHolder: Send + Sync {
    /// Add `bridge` to this channel.
    fn insert(&mut self, bridge: Arc<Bridge>);
    /// Drop all bridges.
    fn clear(&mut self);
    /// Return the number of bridges held.
    fn len(&self) -> usize;
    /// Return true if no bridges are held.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Write this channel's assignment dump to `w`.
    fn dump_assignments(&self, w: &mut dyn Write) -> io::Result<()>;
}

/// A side-channel notified of every top-level assignment, so the
/// persistent store can record bridge provenance.
pub trait AssignmentTracker: Send + Sync {
    /// Record that `bridge` was assigned to the channel named
    /// `distributor` at `seen_at`.  Implementations handle their own
    /// failures; assignment proceeds regardless.
    fn record(&self, bridge: &Bridge, distributor: &str, seen_at: SystemTime);
}

/// A shareable handle to a [`BridgeHolder`].
pub type SharedBridgeHolder = Arc<RwLock<dyn BridgeHolder>>;

/// One registered channel of a [`BridgeSplitter`].
struct SplitterEntry {
    /// The channel name, used for tracking and logs.
    name: String,
    /// The channel's integer share weight.
    share: u32,
    /// The channel itself.
    holder: SharedBridgeHolder,
}

/// The top-level splitter: assigns each bridge to exactly one channel.
///
/// Channels are registered in a fixed order with integer shares; a
/// bridge goes to the channel whose cumulative share range covers the
/// HMAC of its fingerprint modulo the share total.  Registration order
/// is part of the assignment, so it must not change between runs.
pub struct BridgeSplitter {
    /// The partitioning key.
    key: HmacKey,
    /// The registered channels, in registration order.
    entries: Vec<SplitterEntry>,
    /// Sum of all shares.
    total_share: u32,
    /// Optional provenance tracker.
    tracker: Option<Box<dyn AssignmentTracker>>,
}

impl BridgeSplitter {
    /// Return a new splitter partitioning under `key`, with no channels
    /// yet.
    pub fn new(key: HmacKey) -> Self {
        BridgeSplitter {
            key,
            entries: Vec::new(),
            total_share: 0,
            tracker: None,
        }
    }

    /// Register `holder` as the channel named `name` with the given
    /// share weight.
    pub fn add_ring(&mut self, holder: SharedBridgeHolder, name: &str, share: u32) {
        self.total_share += share;
        self.entries.push(SplitterEntry {
            name: name.to_owned(),
            share,
            holder,
        });
    }

    /// Install a provenance tracker.
    pub fn set_tracker(&mut self, tracker: Box<dyn AssignmentTracker>) {
        self.tracker = Some(tracker);
    }

    /// Return the index of the channel that `fingerprint` belongs to.
    fn index_for(&self, fingerprint: &BridgeFingerprint) -> Option<usize> {
        if self.total_share == 0 {
            return None;
        }
        let mut v = self.key.index(fingerprint.as_bytes()) % self.total_share;
        for (i, entry) in self.entries.iter().enumerate() {
            if v < entry.share {
                return Some(i);
            }
            v -= entry.share;
        }
        // Unreachable: the shares sum to total_share.
        None
    }

    /// Assign `bridge` to its channel.
    pub fn insert(&self, bridge: Arc<Bridge>, seen_at: SystemTime) {
        let Some(i) = self.index_for(&bridge.fingerprint) else {
            warn!("no channel shares configured; dropping bridge");
            return;
        };
        let entry = &self.entries[i];
        if let Some(tracker) = &self.tracker {
            tracker.record(&bridge, &entry.name, seen_at);
        }
        entry.holder.write().expect("poisoned lock").insert(bridge);
    }

    /// Replace the whole catalogue with `bridges`.
    ///
    /// Write access to every channel is acquired before anything is
    /// cleared, so concurrent readers observe either the old catalogue
    /// or the new one, never a mixture.
    pub fn reload<I: IntoIterator<Item = Arc<Bridge>>>(&self, bridges: I, seen_at: SystemTime) {
        let mut guards: Vec<_> = self
            .entries
            .iter()
            .map(|e| e.holder.write().expect("poisoned lock"))
            .collect();
        for guard in &mut guards {
            guard.clear();
        }
        let mut n = 0_usize;
        for bridge in bridges {
            let Some(i) = self.index_for(&bridge.fingerprint) else {
                warn!("no channel shares configured; dropping catalogue");
                return;
            };
            if let Some(tracker) = &self.tracker {
                tracker.record(&bridge, &self.entries[i].name, seen_at);
            }
            guards[i].insert(bridge);
            n += 1;
        }
        debug!("reloaded {} bridges into {} channels", n, guards.len());
    }

    /// Drop all bridges from every channel.
    pub fn clear(&self) {
        for entry in &self.entries {
            entry.holder.write().expect("poisoned lock").clear();
        }
    }

    /// Return the total number of bridges across all channels.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.holder.read().expect("poisoned lock").len())
            .sum()
    }

    /// Return true if every channel is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the assignment dump of every channel, in registration
    /// order.
    pub fn dump_assignments(&self, w: &mut dyn Write) -> io::Result<()> {
        for entry in &self.entries {
            entry
                .holder
                .read()
                .expect("poisoned lock")
                .dump_assignments(w)?;
        }
        Ok(())
    }
}

/// A channel that holds back a share of the catalogue without handing it
/// out anywhere.
#[derive(Default)]
pub struct UnallocatedHolder {
    /// The reserved bridges.
    bridges: Vec<Arc<Bridge>>,
}

impl UnallocatedHolder {
    /// Return a new empty holder.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BridgeHolder for UnallocatedHolder {
    fn insert(&mut self, bridge: Arc<Bridge>) {
        self.bridges.push(bridge);
    }

    fn clear(&mut self) {
        self.bridges.clear();
    }

    fn len(&self) -> usize {
        self.bridges.len()
    }

    fn dump_assignments(&self, w: &mut dyn Write) -> io::Result<()> {
        for bridge in &self.bridges {
            writeln!(w, "{} unallocated", bridge.fingerprint)?;
        }
        Ok(())
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
    use crate::testing::{fake_bridge, fake_bridge_v6, test_key};
    use crate::{BridgeFilter, IpFamily};

    /// Ruleset selecting one IP family.
    fn family_ruleset(family: IpFamily) -> Ruleset {
        [BridgeFilter::by_family(family)].into_iter().collect()
    }

    /// A splitter holding `n` v4 and `n` v6 bridges.
    fn splitter_of(n: u32) -> FilteredBridgeSplitter {
        let mut sp = FilteredBridgeSplitter::new(test_key("Assign-Bridges-To-Rings"), 3);
        for i in 0..n {
            sp.insert(Arc::new(fake_bridge(i)));
            sp.insert(Arc::new(fake_bridge_v6(i)));
        }
        sp
    }

    /// An empty ring ordered under a per-test key.
    fn empty_ring() -> BridgeRing {
        BridgeRing::new(test_key("Order-Bridges-In-Ring-0"), AnswerParameters::new())
    }

    #[test]
    fn live_rings_track_inserts() {
        let mut sp = splitter_of(10);
        sp.add_pinned_ring(family_ruleset(IpFamily::V4), empty_ring());
        let ring = sp.lookup(&family_ruleset(IpFamily::V4)).unwrap();
        assert_eq!(ring.len(), 10);

        // A bridge inserted later appears in the matching live ring...
        sp.insert(Arc::new(fake_bridge(77)));
        let ring = sp.lookup(&family_ruleset(IpFamily::V4)).unwrap();
        assert_eq!(ring.len(), 11);
        // ...but not in rings whose ruleset it fails.
        let v6 = sp.lookup_or_add(
            family_ruleset(IpFamily::V6),
            test_key("Order-Bridges-In-Ring-0"),
            AnswerParameters::new(),
        );
        assert_eq!(v6.len(), 10);
    }

    #[test]
    fn filter_soundness() {
        let sp = splitter_of(25);
        let ring = sp.lookup_or_add(
            family_ruleset(IpFamily::V6),
            test_key("Order-Bridges-In-Ring-0"),
            AnswerParameters::new(),
        );
        assert_eq!(ring.len(), 25);
        assert!(ring.bridges().all(|b| b.has_family(IpFamily::V6)));
    }

    #[test]
    fn lru_evicts_unpinned_only() {
        let mut sp = splitter_of(4);
        sp.add_pinned_ring(family_ruleset(IpFamily::V4), empty_ring());

        // The cache bound is 3; create four distinct unpinned rings.
        let key = test_key("Assign-Bridges-To-Rings");
        let rulesets: Vec<Ruleset> = (1..=4)
            .map(|i| [BridgeFilter::by_ring(key.clone(), 4, i)].into_iter().collect())
            .collect();
        for rs in &rulesets {
            sp.lookup_or_add(
                rs.clone(),
                test_key("Order-Bridges-In-Ring-0"),
                AnswerParameters::new(),
            );
        }

        // The least recently used unpinned ring is gone...
        assert!(sp.lookup(&rulesets[0]).is_none());
        // ...the newer ones and the pinned ring are still there.
        assert!(sp.lookup(&rulesets[3]).is_some());
        assert!(sp.lookup(&family_ruleset(IpFamily::V4)).is_some());
    }

    #[test]
    fn old_ring_handles_survive_reload() {
        let mut sp = splitter_of(6);
        sp.add_pinned_ring(family_ruleset(IpFamily::V4), empty_ring());
        let before = sp.lookup(&family_ruleset(IpFamily::V4)).unwrap();
        assert_eq!(before.len(), 6);

        sp.insert(Arc::new(fake_bridge(99)));
        // The handle obtained earlier still sees the pre-insert ring.
        assert_eq!(before.len(), 6);
        assert_eq!(sp.lookup(&family_ruleset(IpFamily::V4)).unwrap().len(), 7);
    }

    #[test]
    fn clear_drops_everything() {
        let mut sp = splitter_of(5);
        sp.add_pinned_ring(family_ruleset(IpFamily::V4), empty_ring());
        sp.clear();
        assert_eq!(sp.len(), 0);
        assert!(sp.lookup(&family_ruleset(IpFamily::V4)).is_none());
    }

    #[test]
    fn weighted_split_is_exclusive_and_exhaustive() {
        let mut splitter = BridgeSplitter::new(test_key("Splitter-Key"));
        let a: Arc<RwLock<UnallocatedHolder>> = Arc::new(RwLock::new(UnallocatedHolder::new()));
        let b: Arc<RwLock<UnallocatedHolder>> = Arc::new(RwLock::new(UnallocatedHolder::new()));
        let c: Arc<RwLock<UnallocatedHolder>> = Arc::new(RwLock::new(UnallocatedHolder::new()));
        splitter.add_ring(a.clone(), "https", 10);
        splitter.add_ring(b.clone(), "email", 10);
        splitter.add_ring(c.clone(), "unallocated", 2);

        let now = SystemTime::now();
        for i in 0..500 {
            splitter.insert(Arc::new(fake_bridge(i)), now);
        }
        let (na, nb, nc) = (
            a.read().unwrap().len(),
            b.read().unwrap().len(),
            c.read().unwrap().len(),
        );
        // Every bridge went to exactly one channel.
        assert_eq!(na + nb + nc, 500);
        assert_eq!(splitter.len(), 500);
        // And the shares are roughly honoured.
        assert!(na > 150 && nb > 150);
        assert!(nc < 100);
    }

    #[test]
    fn split_is_deterministic() {
        let build = || {
            let mut splitter = BridgeSplitter::new(test_key("Splitter-Key"));
            let a: Arc<RwLock<UnallocatedHolder>> = Arc::new(RwLock::new(UnallocatedHolder::new()));
            let b: Arc<RwLock<UnallocatedHolder>> = Arc::new(RwLock::new(UnallocatedHolder::new()));
            splitter.add_ring(a.clone(), "https", 3);
            splitter.add_ring(b.clone(), "email", 5);
            let now = SystemTime::now();
            for i in 0..100 {
                splitter.insert(Arc::new(fake_bridge(i)), now);
            }
            let dump = |h: &Arc<RwLock<UnallocatedHolder>>| {
                let mut out = Vec::new();
                h.read().unwrap().dump_assignments(&mut out).unwrap();
                out
            };
            (dump(&a), dump(&b))
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn dump_format() {
        let mut sp = splitter_of(2);
        sp.add_pinned_ring(family_ruleset(IpFamily::V4), empty_ring());
        let mut out = Vec::new();
        sp.dump_assignments(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let (fpr, desc) = line.split_once(' ').unwrap();
            assert_eq!(fpr.len(), 40);
            assert_eq!(desc, "ip=4");
        }
    }
}
