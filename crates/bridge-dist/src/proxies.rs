//! Categories of distinguished client addresses.
//!
//! Clients connecting from known open proxies or Tor exits cannot be
//! clustered by network area (the adversary picks the network), so each
//! configured category gets quarantined into a hashring of its own.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use tracing::warn;

/// How a category decides membership.
enum Matcher {
    /// A fixed set of addresses, as loaded from a proxy list file.
    Set(HashSet<IpAddr>),
    /// An arbitrary membership rule.
    Rule(Arc<dyn Fn(IpAddr) -> bool + Send + Sync>),
}

/// A distinguished set of client addresses, carrying a tag for logging
/// and provenance.
pub struct ProxyCategory {
    /// The category tag: a file name, or e.g. `exit_relay`.
    tag: String,
    /// The membership test.
    matcher: Matcher,
}

impl ProxyCategory {
    /// Build a category from a fixed set of addresses.
    pub fn from_addrs<I: IntoIterator<Item = IpAddr>>(tag: &str, addrs: I) -> Self {
        ProxyCategory {
            tag: tag.to_owned(),
            matcher: Matcher::Set(addrs.into_iter().collect()),
        }
    }

    /// Build a category from a membership rule.
    pub fn from_rule<F>(tag: &str, rule: F) -> Self
    where
        F: Fn(IpAddr) -> bool + Send + Sync + 'static,
    {
        ProxyCategory {
            tag: tag.to_owned(),
            matcher: Matcher::Rule(Arc::new(rule)),
        }
    }

    /// Load a category from a proxy list file: one address per line,
    /// `#` comments and blank lines skipped.  The tag is the file name.
    ///
    /// Unparseable lines are skipped with a warning rather than
    /// rejecting the file: proxy lists are fetched from external
    /// sources and routinely contain junk.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let tag = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let text = std::fs::read_to_string(path)?;
        let mut addrs = HashSet::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.parse::<IpAddr>() {
                Ok(ip) => {
                    addrs.insert(ip);
                }
                Err(_) => warn!("skipping unparseable line in {:?}", tag),
            }
        }
        Ok(ProxyCategory {
            tag,
            matcher: Matcher::Set(addrs),
        })
    }

    /// Return this category's tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Return true if `ip` belongs to this category.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match &self.matcher {
            Matcher::Set(set) => set.contains(&ip),
            Matcher::Rule(rule) => rule(ip),
        }
    }
}

impl fmt::Debug for ProxyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.matcher {
            Matcher::Set(set) => write!(f, "ProxyCategory({:?}, {} addrs)", self.tag, set.len()),
            Matcher::Rule(_) => write!(f, "ProxyCategory({:?}, rule)", self.tag),
        }
    }
}
