//! Configuration for the daemon.
//!
//! The configuration file is TOML; every option has a default, so an
//! absent file starts a daemon that serves on localhost out of
//! `./bridge-distd.*` state files.  Example:
//!
//! ```toml
//! master_key_file = "/var/lib/bridge-distd/secret_key"
//! db_file = "/var/lib/bridge-distd/state.sqlite3"
//! catalogue_file = "/var/lib/bridge-distd/bridges.json"
//! reload_interval = "30 min"
//! n_ip_clusters = 8
//! proxy_list_files = ["/var/lib/bridge-distd/tor-exits.txt"]
//!
//! [https]
//! listen = "127.0.0.1:6788"
//! share = 10
//! n_bridges_per_answer = 3
//! rotation = "2 days"
//! use_forwarded_header = true
//! need_ports = [[443, 1]]
//!
//! [email]
//! listen = "127.0.0.1:6725"
//! share = 10
//! rotation = "1 day"
//! domains = ["gmail.com", "riseup.net"]
//! domain_map = { "googlemail.com" = "gmail.com" }
//! domain_rules = { "gmail.com" = ["dkim"] }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use bridge_dist::DomainRule;

/// The whole daemon configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub(crate) struct DistdConfig {
    /// Where the 32-byte master key lives; created on first start.
    pub(crate) master_key_file: PathBuf,
    /// Where the sqlite state database lives.
    pub(crate) db_file: PathBuf,
    /// The JSON bridge catalogue to serve from.
    pub(crate) catalogue_file: PathBuf,
    /// How often to re-read the catalogue.
    #[serde(with = "humantime_serde")]
    pub(crate) reload_interval: Duration,
    /// How many cluster rings the IP distributor keeps.
    pub(crate) n_ip_clusters: u32,
    /// Proxy list files; each becomes an address category of its own.
    pub(crate) proxy_list_files: Vec<PathBuf>,
    /// Share of the catalogue held back from all distributors.
    pub(crate) reserved_share: u32,
    /// Default log filter, overridden by `RUST_LOG`.
    pub(crate) log_filter: String,
    /// The HTTP front.
    pub(crate) https: HttpsConfig,
    /// The email front.
    pub(crate) email: EmailConfig,
}

impl Default for DistdConfig {
    fn default() -> Self {
        DistdConfig {
            master_key_file: "bridge-distd.key".into(),
            db_file: "bridge-distd.sqlite3".into(),
            catalogue_file: "bridges.json".into(),
            reload_interval: Duration::from_secs(30 * 60),
            n_ip_clusters: 8,
            proxy_list_files: Vec::new(),
            reserved_share: 2,
            log_filter: "info".to_owned(),
            https: HttpsConfig::default(),
            email: EmailConfig::default(),
        }
    }
}

/// Configuration of the HTTP front.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub(crate) struct HttpsConfig {
    /// Whether to run this front at all.
    pub(crate) enabled: bool,
    /// Address to listen on.  TLS is a reverse-proxy concern.
    pub(crate) listen: SocketAddr,
    /// This front's share of the catalogue.
    pub(crate) share: u32,
    /// Most bridges handed out per answer.
    pub(crate) n_bridges_per_answer: usize,
    /// How often a client's answer rotates.
    #[serde(with = "humantime_serde")]
    pub(crate) rotation: Duration,
    /// Trust the last `X-Forwarded-For` entry as the client address.
    /// Enable only behind a proxy that always sets it.
    pub(crate) use_forwarded_header: bool,
    /// Port requirements on answers, as `[port, count]` pairs.
    pub(crate) need_ports: Vec<(u16, usize)>,
}

impl Default for HttpsConfig {
    fn default() -> Self {
        HttpsConfig {
            enabled: true,
            listen: "127.0.0.1:6788".parse().expect("bad built-in address"),
            share: 10,
            n_bridges_per_answer: 3,
            rotation: Duration::from_secs(48 * 3600),
            use_forwarded_header: false,
            need_ports: Vec::new(),
        }
    }
}

/// Configuration of the email front.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub(crate) struct EmailConfig {
    /// Whether to run this front at all.
    pub(crate) enabled: bool,
    /// Address to listen on for incoming mail.
    pub(crate) listen: SocketAddr,
    /// This front's share of the catalogue.
    pub(crate) share: u32,
    /// Most bridges handed out per answer.
    pub(crate) n_bridges_per_answer: usize,
    /// How often a sender's answer rotates.
    #[serde(with = "humantime_serde")]
    pub(crate) rotation: Duration,
    /// Domains we accept mail from.  Each maps to itself; aliases go
    /// in `domain_map`.
    pub(crate) domains: Vec<String>,
    /// Extra hostname-to-canonical-domain aliases.
    pub(crate) domain_map: HashMap<String, String>,
    /// Per-domain requirements, e.g. `{"gmail.com" = ["dkim"]}`.
    pub(crate) domain_rules: HashMap<String, Vec<String>>,
    /// Senders exempt from rate limiting, mapped to a PGP fingerprint
    /// for encrypted replies, or to `""` for plain ones.
    pub(crate) whitelist: HashMap<String, String>,
    /// Local part we accept mail for.
    pub(crate) local_part: String,
    /// `From:` header of our replies.
    pub(crate) from_addr: String,
    /// Envelope sender of our replies.
    pub(crate) smtp_from_addr: String,
    /// Outbound smarthost that relays our replies.
    pub(crate) smarthost: SocketAddr,
    /// Port requirements on answers, as `[port, count]` pairs.
    pub(crate) need_ports: Vec<(u16, usize)>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        EmailConfig {
            enabled: true,
            listen: "127.0.0.1:6725".parse().expect("bad built-in address"),
            share: 10,
            n_bridges_per_answer: 3,
            rotation: Duration::from_secs(24 * 3600),
            domains: Vec::new(),
            domain_map: HashMap::new(),
            domain_rules: HashMap::new(),
            whitelist: HashMap::new(),
            local_part: "bridges".to_owned(),
            from_addr: "bridges@localhost".to_owned(),
            smtp_from_addr: "bridges@localhost".to_owned(),
            smarthost: "127.0.0.1:25".parse().expect("bad built-in address"),
            need_ports: Vec::new(),
        }
    }
}

impl DistdConfig {
    /// Load the configuration at `path`, or the defaults if there is no
    /// such file.
    pub(crate) fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!("no configuration at {:?}; using defaults", path);
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {:?}", path))?;
        let cfg: DistdConfig =
            toml::from_str(&text).with_context(|| format!("parsing configuration {:?}", path))?;
        Ok(cfg)
    }
}

impl EmailConfig {
    /// The complete domain map: every accepted domain maps to itself,
    /// plus the configured aliases (all lowercased).
    pub(crate) fn complete_domain_map(&self) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = self
            .domains
            .iter()
            .map(|d| (d.to_ascii_lowercase(), d.to_ascii_lowercase()))
            .collect();
        for (alias, canonical) in &self.domain_map {
            map.insert(alias.to_ascii_lowercase(), canonical.to_ascii_lowercase());
        }
        map
    }

    /// Parse the configured domain rules.
    pub(crate) fn parsed_domain_rules(
        &self,
    ) -> anyhow::Result<HashMap<String, Vec<DomainRule>>> {
        let mut out = HashMap::new();
        for (domain, rules) in &self.domain_rules {
            let parsed: Result<Vec<DomainRule>, _> =
                rules.iter().map(|r| r.parse::<DomainRule>()).collect();
            out.insert(
                domain.to_ascii_lowercase(),
                parsed.with_context(|| format!("domain rules for {:?}", domain))?,
            );
        }
        Ok(out)
    }

    /// The whitelist in the distributor's form: empty fingerprints
    /// become `None`.
    pub(crate) fn parsed_whitelist(&self) -> HashMap<String, Option<String>> {
        self.whitelist
            .iter()
            .map(|(addr, fpr)| {
                let fpr = if fpr.is_empty() {
                    None
                } else {
                    Some(fpr.clone())
                };
                (addr.to_ascii_lowercase(), fpr)
            })
            .collect()
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
    use bridge_dist::DomainRule;

    #[test]
    fn example_from_module_doc_parses() {
        let cfg: DistdConfig = toml::from_str(
            r#"
            master_key_file = "/var/lib/bridge-distd/secret_key"
            reload_interval = "30 min"
            n_ip_clusters = 4

            [https]
            listen = "127.0.0.1:8000"
            rotation = "2 days"
            need_ports = [[443, 1]]

            [email]
            domains = ["gmail.com"]
            domain_map = { "googlemail.com" = "gmail.com" }
            domain_rules = { "gmail.com" = ["dkim"] }
            whitelist = { "press@example.com" = "" }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.n_ip_clusters, 4);
        assert_eq!(cfg.reload_interval, Duration::from_secs(1800));
        assert_eq!(cfg.https.rotation, Duration::from_secs(48 * 3600));
        assert_eq!(cfg.https.need_ports, vec![(443, 1)]);

        let map = cfg.email.complete_domain_map();
        assert_eq!(map.get("gmail.com").unwrap(), "gmail.com");
        assert_eq!(map.get("googlemail.com").unwrap(), "gmail.com");

        let rules = cfg.email.parsed_domain_rules().unwrap();
        assert_eq!(rules.get("gmail.com").unwrap(), &[DomainRule::Dkim]);

        let wl = cfg.email.parsed_whitelist();
        assert_eq!(wl.get("press@example.com").unwrap(), &None);
    }

    #[test]
    fn defaults_are_usable() {
        let cfg = DistdConfig::default();
        assert!(cfg.https.enabled);
        assert!(cfg.email.enabled);
        assert!(cfg.https.share > 0);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let got = toml::from_str::<DistdConfig>("definitely_not_an_option = 1");
        assert!(got.is_err());
    }

    #[test]
    fn bad_domain_rule_is_rejected() {
        let cfg: DistdConfig = toml::from_str(
            r#"
            [email]
            domain_rules = { "gmail.com" = ["spf"] }
            "#,
        )
        .unwrap();
        assert!(cfg.email.parsed_domain_rules().is_err());
    }
}
