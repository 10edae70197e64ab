//! The email-based distributor.
//!
//! Mail senders are canonicalised (lowercased, domain resolved through
//! the configured domain map) and rate-limited per sender: one answer
//! per window, one warning per window, silence after that.  Accepted
//! senders are answered from a hashring position derived from their
//! canonical address and the current period, so a sender keeps getting
//! the same bridges until the period rolls over.
//!
//! Only domains in the map are served at all; requiring large webmail
//! providers means an adversary cannot cheaply mint unlimited sender
//! identities.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use safelog::sensitive;
use tracing::{debug, info};

use bridge_hashring::{
    AnswerParameters, Bridge, BridgeFilter, BridgeHolder, BridgeRing, FilteredBridgeSplitter,
    HmacKey, IpFamily, RingPosition, Ruleset,
};

use crate::storage::{unix_secs, Database};
use crate::{num_bridges_per_answer, Error, Result};

/// Minimum time between answers to one sender.
pub const MAX_EMAIL_RATE: Duration = Duration::from_secs(3 * 3600);

/// How many request-built sub-rings the email splitter caches beyond
/// the prepopulated ones.
const EMAIL_RING_CACHE: usize = 5;

/// A canonicalised email address: lowercase local part at a lowercase
/// canonical domain.
///
/// Only [`normalize_email`] constructs these, so holding one implies the
/// domain was acceptable.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EmailAddress(String);

impl EmailAddress {
    /// Return the address as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return the canonical domain part.
    pub fn domain(&self) -> &str {
        // An EmailAddress always contains exactly one '@'.
        self.0.rsplit('@').next().unwrap_or("")
    }
}

impl Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonicalise a raw sender address against a domain map.
///
/// The address must be ASCII (internationalised addresses are rejected
/// or punycoded before they get here) and its domain, lowercased, must
/// be a key of `domain_map`; the mapped value becomes the canonical
/// domain.
pub fn normalize_email(
    raw: &str,
    domain_map: &HashMap<String, String>,
) -> Result<EmailAddress> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.is_ascii() {
        return Err(Error::BadEmail);
    }
    let (local, domain) = raw.split_once('@').ok_or(Error::BadEmail)?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(Error::BadEmail);
    }
    let domain = domain.to_ascii_lowercase();
    let canonical = domain_map
        .get(&domain)
        .ok_or(Error::UnsupportedDomain { domain })?;
    Ok(EmailAddress(format!(
        "{}@{}",
        local.to_ascii_lowercase(),
        canonical
    )))
}

/// A requirement a domain's mail must satisfy before we answer it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DomainRule {
    /// The incoming mail must carry a passing DKIM authentication
    /// result.
    Dkim,
}

impl FromStr for DomainRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dkim" => Ok(DomainRule::Dkim),
            other => Err(Error::BadDomainRule(other.to_owned())),
        }
    }
}

/// A distributor answering requests that arrive by email.
pub struct EmailDistributor {
    /// HMAC mapping senders to ring positions.
    email_hmac: HmacKey,
    /// This channel's bridges and sub-rings.
    splitter: FilteredBridgeSplitter,
    /// Map from accepted domains to their canonical form.
    domain_map: HashMap<String, String>,
    /// Per-canonical-domain requirements.
    domain_rules: HashMap<String, Vec<DomainRule>>,
    /// Senders exempt from rate limiting, mapped to an optional PGP
    /// fingerprint for encrypted replies.
    whitelist: HashMap<String, Option<String>>,
    /// Requirements on answers.
    params: AnswerParameters,
    /// The persistent store holding rate-limit state.
    db: Arc<Mutex<Database>>,
}

impl EmailDistributor {
    /// Create a distributor from this channel's root key and
    /// configuration.
    pub fn new(
        key: &HmacKey,
        domain_map: HashMap<String, String>,
        domain_rules: HashMap<String, Vec<DomainRule>>,
        whitelist: HashMap<String, Option<String>>,
        params: AnswerParameters,
        db: Arc<Mutex<Database>>,
    ) -> Self {
        EmailDistributor {
            email_hmac: key.subkey("Map-Addresses-To-Ring"),
            splitter: FilteredBridgeSplitter::new(
                key.subkey("Order-Bridges-In-Ring"),
                EMAIL_RING_CACHE,
            ),
            domain_map,
            domain_rules,
            whitelist,
            params,
            db,
        }
    }

    /// Canonicalise a raw sender address against this distributor's
    /// domain map.
    pub fn normalize(&self, raw: &str) -> Result<EmailAddress> {
        normalize_email(raw, &self.domain_map)
    }

    /// Return the requirements for mail from `canonical_domain`.
    pub fn rules_for(&self, canonical_domain: &str) -> &[DomainRule] {
        self.domain_rules
            .get(canonical_domain)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Return true if `client` is exempt from rate limiting.
    pub fn is_whitelisted(&self, client: &EmailAddress) -> bool {
        self.whitelist.contains_key(client.as_str())
    }

    /// The order key for this distributor's sub-rings.
    ///
    /// A single label, not parameterised: the email channel has no
    /// clusters, so every sub-ring orders bridges the same way.
    fn order_key(&self) -> HmacKey {
        self.splitter.key().subkey("Order-Bridges-In-Ring")
    }

    /// Materialise the pinned sub-rings: one per address family.
    pub fn prepopulate(&mut self) {
        info!("prepopulating email distributor hashrings");
        for family in [IpFamily::V4, IpFamily::V6] {
            let ruleset: Ruleset = [BridgeFilter::by_family(family)].into_iter().collect();
            let ring = BridgeRing::new(self.order_key(), self.params.clone());
            self.splitter.add_pinned_ring(ruleset, ring);
        }
    }

    /// Answer a request from `client`, or tell the caller why not.
    ///
    /// `epoch` is the current period's string; `n` caps the answer
    /// size; `extra` carries the filters the sender asked for (address
    /// family, transport).  The rate-limit decision and the answer are
    /// committed in one storage transaction, so a failure between the
    /// two leaves the sender's clock untouched.
    pub fn get_bridges(
        &self,
        client: &EmailAddress,
        epoch: &str,
        n: usize,
        extra: &[BridgeFilter],
        now: SystemTime,
    ) -> Result<Vec<Arc<Bridge>>> {
        let now_s = unix_secs(now);
        let window = MAX_EMAIL_RATE.as_secs();

        let mut db = self.db.lock().expect("poisoned lock");
        let tx = db.transaction()?;
        let last_seen = tx.email_time(client.as_str())?;
        let was_warned = tx.warned_email(client.as_str())?;

        if let Some(last_seen) = last_seen {
            if self.is_whitelisted(client) {
                info!(
                    "whitelisted sender {} last seen {}s ago",
                    sensitive(client),
                    now_s.saturating_sub(last_seen)
                );
            } else if last_seen + window > now_s {
                let retry_in = last_seen + window - now_s;
                if was_warned {
                    return Err(Error::Ignored);
                }
                tx.set_warned_email(client.as_str(), true, now_s)?;
                tx.commit()?;
                return Err(Error::TooSoon { retry_in });
            }
        }
        if was_warned {
            // The window has passed; the sender starts fresh.
            tx.set_warned_email(client.as_str(), false, now_s)?;
        }

        let pos = RingPosition::from(
            self.email_hmac
                .digest(format!("<{}>{}", epoch, client).as_bytes()),
        );
        let ruleset: Ruleset = extra.iter().cloned().collect();
        let ring = self
            .splitter
            .lookup_or_add(ruleset, self.order_key(), self.params.clone());
        let count = num_bridges_per_answer(ring.len(), n);
        let answer = ring.bridges_at(pos, count);
        debug!(
            "answering sender {} with {} bridges",
            sensitive(client),
            answer.len()
        );

        tx.set_email_time(client.as_str(), now_s)?;
        tx.commit()?;
        Ok(answer)
    }

    /// Delete rate-limit state older than one full window.
    pub fn clean_database(&self, now: SystemTime) -> Result<()> {
        let cutoff = now
            .checked_sub(MAX_EMAIL_RATE)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        self.db
            .lock()
            .expect("poisoned lock")
            .clean_expired(cutoff)
    }
}

impl BridgeHolder for EmailDistributor {
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
