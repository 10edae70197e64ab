//! The IP-based distributor.
//!
//! Requesters are mapped to coarse network areas, and areas to one of
//! `K` cluster rings, so an adversary who controls a subnet sees one
//! answer no matter how many addresses it burns.  Requesters arriving
//! from a configured category (known open proxies, Tor exits) are kept
//! out of the clusters entirely and served from category rings of their
//! own, with at most four distinct views per period.

use std::io::{self, Write};
use std::net::IpAddr;
use std::sync::Arc;

use safelog::sensitive;
use tracing::{debug, info, warn};

use bridge_hashring::{
    AnswerParameters, Bridge, BridgeFilter, BridgeHolder, BridgeRing, FilteredBridgeSplitter,
    HmacKey, IpFamily, RingPosition, Ruleset,
};

use crate::area::AreaMapper;
use crate::num_bridges_per_answer;
use crate::proxies::ProxyCategory;

/// Extra room in the sub-ring cache beyond the prepopulated rings, for
/// rings built from request-time filters.
const EXTRA_RING_CACHE: usize = 5;

/// How many groups category requesters are folded into.  However many
/// proxy addresses an adversary burns, it sees at most this many
/// distinct answers per period.
const CATEGORY_GROUPS: u128 = 4;

/// A distributor answering requests by the client's IP address.
pub struct IpDistributor {
    /// Maps a client address to its area string.
    area_mapper: AreaMapper,
    /// Number of cluster rings.
    n_clusters: u32,
    /// Distinguished address categories, first match wins.
    categories: Vec<ProxyCategory>,
    /// HMAC placing requesters on a ring.
    area_order: HmacKey,
    /// HMAC assigning areas to clusters.
    area_cluster: HmacKey,
    /// Requirements on answers.
    params: AnswerParameters,
    /// This channel's bridges and sub-rings.
    splitter: FilteredBridgeSplitter,
}

impl IpDistributor {
    /// Create a distributor from this channel's root key and
    /// configuration.
    pub fn new(
        key: &HmacKey,
        area_mapper: AreaMapper,
        n_clusters: u32,
        categories: Vec<ProxyCategory>,
        params: AnswerParameters,
    ) -> Self {
        let n_clusters = n_clusters.max(1);
        let ring_cache =
            n_clusters as usize + categories.len() + EXTRA_RING_CACHE;
        IpDistributor {
            area_mapper,
            n_clusters,
            area_order: key.subkey("Order-Areas-In-Rings"),
            area_cluster: key.subkey("Assign-Areas-To-Rings"),
            params,
            splitter: FilteredBridgeSplitter::new(
                key.subkey("Assign-Bridges-To-Rings"),
                ring_cache,
            ),
            categories,
        }
    }

    /// Total number of top-level sub-rings: one per cluster, one per
    /// category.
    fn total_rings(&self) -> u32 {
        self.n_clusters + self.categories.len() as u32
    }

    /// The order key of sub-ring `ring` (1-based; key labels are
    /// 0-based).
    fn order_key(&self, ring: u32) -> HmacKey {
        self.splitter
            .key()
            .subkey(&format!("Order-Bridges-In-Ring-{}", ring - 1))
    }

    /// Decide which sub-ring and which hashring position serve `ip`
    /// during `epoch`.
    fn place(&self, ip: IpAddr, epoch: &str) -> (u32, RingPosition) {
        // Only one of category quarantine or area clustering applies.
        if let Some(j) = self.categories.iter().position(|c| c.contains(ip)) {
            let ring = self.n_clusters + j as u32 + 1;
            let group = int_of_ip(ip) % CATEGORY_GROUPS + 1;
            info!(
                "client {} is from category {:?}",
                sensitive(ip),
                self.categories[j].tag()
            );
            let pos = self
                .area_order
                .digest(format!("known-proxy<{}>{}", epoch, group).as_bytes());
            (ring, pos.into())
        } else {
            let area = (self.area_mapper)(ip);
            debug!("client {} mapped to area {}", sensitive(ip), area);
            let cluster = self.area_cluster.index(area.as_bytes()) % self.n_clusters + 1;
            let pos = self
                .area_order
                .digest(format!("<{}>{}", epoch, area).as_bytes());
            (cluster, pos.into())
        }
    }

    /// Answer a request from `ip`.
    ///
    /// `epoch` is the current period's string; `n` caps the answer
    /// size; `extra` carries the filters the client asked for.  An
    /// empty answer is normal when the catalogue is empty or nothing
    /// matches the filters.
    pub fn get_bridges_for_ip(
        &self,
        ip: IpAddr,
        epoch: &str,
        n: usize,
        extra: &[BridgeFilter],
    ) -> Vec<Arc<Bridge>> {
        if self.splitter.is_empty() {
            warn!("bailing on request: distributor has no bridges");
            return Vec::new();
        }

        let (ring_num, pos) = self.place(ip, epoch);
        let mut ruleset: Ruleset = extra.iter().cloned().collect();
        ruleset.insert(BridgeFilter::by_ring(
            self.splitter.key().clone(),
            self.total_rings(),
            ring_num,
        ));

        let ring =
            self.splitter
                .lookup_or_add(ruleset, self.order_key(ring_num), self.params.clone());
        let count = num_bridges_per_answer(ring.len(), n);
        ring.bridges_at(pos, count)
    }

    /// Materialise the pinned sub-rings: every cluster and category
    /// ring, unfiltered and per address family.
    ///
    /// The unfiltered variants feed the assignment dump, and double as
    /// warm cache entries for requests that ask for no particular
    /// address family.
    pub fn prepopulate(&mut self) {
        info!("prepopulating IP distributor hashrings");
        for family in [None, Some(IpFamily::V4), Some(IpFamily::V6)] {
            for ring_num in 1..=self.total_rings() {
                let mut ruleset = Ruleset::new();
                ruleset.insert(BridgeFilter::by_ring(
                    self.splitter.key().clone(),
                    self.total_rings(),
                    ring_num,
                ));
                if let Some(family) = family {
                    ruleset.insert(BridgeFilter::by_family(family));
                }
                let ring = BridgeRing::new(self.order_key(ring_num), self.params.clone());
                self.splitter.add_pinned_ring(ruleset, ring);
            }
        }
    }
}

impl BridgeHolder for IpDistributor {
    fn insert(&mut self, bridge: Arc<Bridge>) {
        self.splitter.insert(bridge);
    }

    fn clear(&mut self) {
        self.splitter.clear();
        self.prepopulate();
    }

    fn len(&self) -> usize {
        self.splitter.len()
    }

    fn dump_assignments(&self, w: &mut dyn Write) -> io::Result<()> {
        self.splitter.dump_assignments(w)
    }
}

/// Interpret an address as an integer, for grouping category
/// requesters.
fn int_of_ip(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}
