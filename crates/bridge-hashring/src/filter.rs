//! Filter predicates over bridges, and rulesets of them.
//!
//! A filter is a small value: its kind plus its parameters.  Two filters
//! built from the same parameters are equal, which is what lets a
//! [`Ruleset`] double as the cache key for the sub-ring it describes.
//! Every filter renders as a stable `key=value` description; those
//! descriptions appear in the assignment dump, so their exact form
//! matters to external tooling.

use std::collections::BTreeSet;
use std::fmt::{self, Display};

use crate::{Bridge, Error, HmacKey, IpFamily};

/// A predicate over bridges.
///
/// Filters are compared, ordered, and hashed by their kind and
/// parameters, never by their descriptions (which are derived).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum BridgeFilter {
    /// The bridge belongs to sub-ring `index` of `total`, as decided by
    /// HMAC of its fingerprint under `key`.  Ring numbers are 1-based.
    Ring {
        /// The ring-assignment key of the splitter this filter was made
        /// for.  Part of the filter's identity: the same index under a
        /// different splitter is a different predicate.
        key: HmacKey,
        /// How many sub-rings the bridges are spread over.
        total: u32,
        /// Which sub-ring this filter selects, in `1..=total`.
        index: u32,
    },
    /// The bridge has an endpoint in the given IP family.
    Ip(IpFamily),
    /// The bridge offers the named pluggable transport (stored
    /// lowercase) with an endpoint in the given family.
    Transport {
        /// The transport method name, lowercase.
        method: String,
        /// The address family the client needs the transport on.
        family: IpFamily,
    },
    /// The bridge is not known to be blocked in the given country
    /// (lowercase code).
    Unblocked(String),
}

impl BridgeFilter {
    /// Return a filter selecting bridges with an endpoint in `family`.
    pub fn by_family(family: IpFamily) -> Self {
        BridgeFilter::Ip(family)
    }

    /// Return a filter selecting the `index`th of `total` sub-rings
    /// under the given assignment key.
    pub fn by_ring(key: HmacKey, total: u32, index: u32) -> Self {
        BridgeFilter::Ring { key, total, index }
    }

    /// Return a filter selecting bridges offering the transport
    /// `method` in `family`.
    pub fn by_transport(method: &str, family: IpFamily) -> Self {
        BridgeFilter::Transport {
            method: method.to_ascii_lowercase(),
            family,
        }
    }

    /// Return a filter selecting bridges not blocked in the country
    /// `cc`.
    pub fn unblocked_in(cc: &str) -> Result<Self, Error> {
        if cc.len() != 2 || !cc.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(Error::BadCountryCode(cc.to_owned()));
        }
        Ok(BridgeFilter::Unblocked(cc.to_ascii_lowercase()))
    }

    /// Return true if `bridge` satisfies this filter.
    pub fn matches(&self, bridge: &Bridge) -> bool {
        match self {
            BridgeFilter::Ring { key, total, index } => {
                key.index(bridge.fingerprint.as_bytes()) % *total + 1 == *index
            }
            BridgeFilter::Ip(family) => bridge.has_family(*family),
            BridgeFilter::Transport { method, family } => bridge.transports.iter().any(|t| {
                t.method.eq_ignore_ascii_case(method) && IpFamily::of(&t.addr.ip()) == *family
            }),
            BridgeFilter::Unblocked(cc) => !bridge.is_blocked_in(cc),
        }
    }
}

impl Display for BridgeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeFilter::Ring { index, .. } => write!(f, "ring={}", index),
            BridgeFilter::Ip(family) => write!(f, "ip={}", family),
            BridgeFilter::Transport { method, .. } => write!(f, "transport={}", method),
            BridgeFilter::Unblocked(cc) => write!(f, "unblocked={}", cc),
        }
    }
}

/// An unordered conjunction of filters.
///
/// A ruleset is the identity of the sub-ring it describes: the splitter
/// caches sub-rings under their rulesets, and two rulesets holding equal
/// filters are the same key no matter how they were assembled.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ruleset(BTreeSet<BridgeFilter>);

impl Ruleset {
    /// Return an empty ruleset, which matches every bridge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `filter` to the conjunction.
    pub fn insert(&mut self, filter: BridgeFilter) {
        self.0.insert(filter);
    }

    /// Return true if `bridge` satisfies every filter of the set.
    pub fn matches(&self, bridge: &Bridge) -> bool {
        self.0.iter().all(|f| f.matches(bridge))
    }

    /// Return true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return the number of filters in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over the filters, in their canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &BridgeFilter> {
        self.0.iter()
    }

    /// Render the space-separated `key=value` descriptions used in the
    /// assignment dump.  The order is the canonical filter order, so the
    /// output is stable across runs.
    pub fn description(&self) -> String {
        let descs: Vec<String> = self.0.iter().map(|f| f.to_string()).collect();
        descs.join(" ")
    }
}

impl FromIterator<BridgeFilter> for Ruleset {
    fn from_iter<I: IntoIterator<Item = BridgeFilter>>(iter: I) -> Self {
        Ruleset(iter.into_iter().collect())
    }
}

impl Display for Ruleset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
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
    use crate::testing::{fake_bridge, fake_bridge_v6, fake_dual_bridge, test_key};

    #[test]
    fn family_filters() {
        let v4 = BridgeFilter::by_family(IpFamily::V4);
        let v6 = BridgeFilter::by_family(IpFamily::V6);
        assert!(v4.matches(&fake_bridge(1)));
        assert!(!v6.matches(&fake_bridge(1)));
        assert!(v6.matches(&fake_bridge_v6(1)));
        // A dual-stack bridge satisfies both.
        assert!(v4.matches(&fake_dual_bridge(1)));
        assert!(v6.matches(&fake_dual_bridge(1)));
    }

    #[test]
    fn ring_filter_partitions() {
        let key = test_key("Assign-Bridges-To-Rings");
        let total = 4;
        let filters: Vec<BridgeFilter> = (1..=total)
            .map(|i| BridgeFilter::by_ring(key.clone(), total, i))
            .collect();
        for i in 0..200 {
            let b = fake_bridge(i);
            let matching = filters.iter().filter(|f| f.matches(&b)).count();
            assert_eq!(matching, 1);
        }
    }

    #[test]
    fn transport_filter_is_case_insensitive() {
        let mut b = fake_bridge(9);
        b.transports.push(crate::Transport {
            method: "obfs4".to_owned(),
            addr: "10.9.9.9:7002".parse().unwrap(),
            params: vec![("cert".to_owned(), "abcd".to_owned())],
        });
        assert!(BridgeFilter::by_transport("OBFS4", IpFamily::V4).matches(&b));
        assert!(!BridgeFilter::by_transport("obfs4", IpFamily::V6).matches(&b));
        assert!(!BridgeFilter::by_transport("meek", IpFamily::V4).matches(&b));
    }

    #[test]
    fn unblocked_filter() {
        let mut b = fake_bridge(5);
        b.blocked_in.insert("ru".to_owned());
        assert!(!BridgeFilter::unblocked_in("ru").unwrap().matches(&b));
        assert!(BridgeFilter::unblocked_in("us").unwrap().matches(&b));
        assert!(BridgeFilter::unblocked_in("USA").is_err());
        assert!(BridgeFilter::unblocked_in("u1").is_err());
    }

    #[test]
    fn rulesets_are_value_equal() {
        let key = test_key("Assign-Bridges-To-Rings");
        let a: Ruleset = [
            BridgeFilter::by_ring(key.clone(), 6, 2),
            BridgeFilter::by_family(IpFamily::V4),
        ]
        .into_iter()
        .collect();
        // Same filters, other insertion order, separately constructed.
        let b: Ruleset = [
            BridgeFilter::by_family(IpFamily::V4),
            BridgeFilter::by_ring(key, 6, 2),
        ]
        .into_iter()
        .collect();
        assert_eq!(a, b);
        assert_eq!(a.description(), "ring=2 ip=4");
    }

    #[test]
    fn conjunction() {
        let rs: Ruleset = [
            BridgeFilter::by_family(IpFamily::V4),
            BridgeFilter::by_family(IpFamily::V6),
        ]
        .into_iter()
        .collect();
        assert!(rs.matches(&fake_dual_bridge(2)));
        assert!(!rs.matches(&fake_bridge(2)));
        assert!(!rs.matches(&fake_bridge_v6(2)));
        assert!(Ruleset::new().matches(&fake_bridge(2)));
    }
}
