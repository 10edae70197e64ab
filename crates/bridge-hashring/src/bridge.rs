//! Bridge records.
//!
//! A bridge is an unlisted relay endpoint.  The catalogue loader hands us
//! one record per bridge; identity is the RSA fingerprint, and a record
//! seen later with the same fingerprint replaces the earlier one
//! wholesale.

use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// The length in bytes of a bridge fingerprint.
const FINGERPRINT_LEN: usize = 20;

/// Which IP version an address belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(clippy::exhaustive_enums)]
pub enum IpFamily {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl IpFamily {
    /// Return the family of `addr`.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

impl Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "4"),
            IpFamily::V6 => write!(f, "6"),
        }
    }
}

/// The RSA identity fingerprint of a bridge: 20 bytes, written as 40 hex
/// digits.
///
/// Fingerprint equality is bridge identity equality.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BridgeFingerprint([u8; FINGERPRINT_LEN]);

impl BridgeFingerprint {
    /// Return the raw fingerprint bytes.
    ///
    /// This is the byte string that every ring HMACs to position the
    /// bridge.
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Construct a fingerprint from raw bytes.
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        BridgeFingerprint(bytes)
    }
}

impl FromStr for BridgeFingerprint {
    type Err = Error;

    /// Parse a 40-digit hex fingerprint.  Interior ASCII spaces are
    /// accepted, since fingerprints are conventionally written in
    /// 4-digit groups.
    fn from_str(s: &str) -> Result<Self, Error> {
        let compact: String = s.chars().filter(|c| *c != ' ').collect();
        let bytes = hex::decode(&compact).map_err(|_| Error::BadFingerprint)?;
        let bytes: [u8; FINGERPRINT_LEN] =
            bytes.try_into().map_err(|_| Error::BadFingerprint)?;
        Ok(BridgeFingerprint(bytes))
    }
}

impl Display for BridgeFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl fmt::Debug for BridgeFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BridgeFingerprint({})", self)
    }
}

impl Serialize for BridgeFingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BridgeFingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An additional OR endpoint of a bridge: one address carrying one or
/// more ports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct OrAddress {
    /// The address.
    pub addr: IpAddr,
    /// The ports the bridge accepts OR connections on at `addr`.
    pub ports: Vec<u16>,
}

impl OrAddress {
    /// Return the IP family of this endpoint.
    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.addr)
    }
}

/// One pluggable-transport endpoint of a bridge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct Transport {
    /// The transport method name, e.g. `obfs4`.  Matched
    /// case-insensitively.
    pub method: String,
    /// The address and port the transport listens on.
    pub addr: SocketAddr,
    /// Transport arguments to hand to the client, as `key=value` pairs.
    #[serde(default)]
    pub params: Vec<(String, String)>,
}

/// Serde default for the `running` flag: a catalogue entry that does not
/// say otherwise is assumed usable.
fn default_running() -> bool {
    true
}

/// An unlisted relay endpoint, as loaded from the catalogue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct Bridge {
    /// Nickname, for logs and operator convenience only.
    #[serde(default)]
    pub nickname: String,
    /// Primary OR address.
    pub addr: IpAddr,
    /// Primary OR port.
    pub or_port: u16,
    /// Identity fingerprint.
    pub fingerprint: BridgeFingerprint,
    /// Additional OR endpoints.
    #[serde(default)]
    pub or_addresses: Vec<OrAddress>,
    /// Pluggable-transport endpoints.
    #[serde(default)]
    pub transports: Vec<Transport>,
    /// Whether the bridge was running when last measured.
    #[serde(default = "default_running")]
    pub running: bool,
    /// Whether the bridge has the Stable flag.
    #[serde(default)]
    pub stable: bool,
    /// Lowercase country codes the bridge is known to be blocked in.
    #[serde(default)]
    pub blocked_in: BTreeSet<String>,
}

impl Bridge {
    /// Return true if the bridge has an endpoint in `family`, either as
    /// its primary address or among its OR addresses.
    pub fn has_family(&self, family: IpFamily) -> bool {
        IpFamily::of(&self.addr) == family || self.or_addresses.iter().any(|a| a.family() == family)
    }

    /// Return an OR endpoint in `family`, preferring the primary
    /// address.
    pub fn addr_for_family(&self, family: IpFamily) -> Option<SocketAddr> {
        if IpFamily::of(&self.addr) == family {
            return Some(SocketAddr::new(self.addr, self.or_port));
        }
        self.or_addresses
            .iter()
            .find(|a| a.family() == family)
            .and_then(|a| a.ports.first().map(|p| SocketAddr::new(a.addr, *p)))
    }

    /// Return true if the bridge is known to be blocked in the country
    /// `cc` (compared ASCII-case-insensitively).
    pub fn is_blocked_in(&self, cc: &str) -> bool {
        self.blocked_in
            .iter()
            .any(|b| b.eq_ignore_ascii_case(cc))
    }

    /// Render the vanilla bridge line for the primary endpoint:
    /// `address:port fingerprint`, with IPv6 addresses in brackets.
    pub fn bridge_line(&self) -> String {
        format!(
            "{} {}",
            SocketAddr::new(self.addr, self.or_port),
            self.fingerprint
        )
    }

    /// Render a vanilla bridge line for an endpoint in `family`, if the
    /// bridge has one.
    pub fn bridge_line_for_family(&self, family: IpFamily) -> Option<String> {
        self.addr_for_family(family)
            .map(|sa| format!("{} {}", sa, self.fingerprint))
    }

    /// Render a bridge line for the transport `method` in `family`, if
    /// the bridge offers one: `method address:port fingerprint k=v ...`.
    pub fn transport_line(&self, method: &str, family: IpFamily) -> Option<String> {
        let t = self.transports.iter().find(|t| {
            t.method.eq_ignore_ascii_case(method) && IpFamily::of(&t.addr.ip()) == family
        })?;
        let mut line = format!("{} {} {}", t.method, t.addr, self.fingerprint);
        for (k, v) in &t.params {
            line.push_str(&format!(" {}={}", k, v));
        }
        Some(line)
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
    use crate::testing::{fake_bridge, fake_bridge_v6, fake_dual_bridge};

    #[test]
    fn fingerprint_parse() {
        let fp: BridgeFingerprint = "00112233445566778899AABBCCDDEEFF00112233".parse().unwrap();
        assert_eq!(fp.to_string(), "00112233445566778899AABBCCDDEEFF00112233");

        // Grouped form, as written in descriptors.
        let grouped: BridgeFingerprint = "0011 2233 4455 6677 8899 AABB CCDD EEFF 0011 2233"
            .parse()
            .unwrap();
        assert_eq!(fp, grouped);

        assert!("too short".parse::<BridgeFingerprint>().is_err());
        assert!("zz112233445566778899AABBCCDDEEFF00112233"
            .parse::<BridgeFingerprint>()
            .is_err());
    }

    #[test]
    fn family_lookup() {
        let b4 = fake_bridge(7);
        assert!(b4.has_family(IpFamily::V4));
        assert!(!b4.has_family(IpFamily::V6));
        assert!(b4.bridge_line_for_family(IpFamily::V6).is_none());

        let b6 = fake_bridge_v6(7);
        assert!(b6.has_family(IpFamily::V6));
        assert!(!b6.has_family(IpFamily::V4));
        // IPv6 endpoints render in brackets.
        let line = b6.bridge_line();
        assert!(line.starts_with('['));

        let dual = fake_dual_bridge(7);
        assert!(dual.has_family(IpFamily::V4));
        assert!(dual.has_family(IpFamily::V6));
        // The v6 endpoint comes from the OR address list.
        assert_ne!(
            dual.addr_for_family(IpFamily::V4).unwrap(),
            dual.addr_for_family(IpFamily::V6).unwrap()
        );
    }

    #[test]
    fn blocked_lookup() {
        let mut b = fake_bridge(3);
        b.blocked_in.insert("ru".to_owned());
        assert!(b.is_blocked_in("ru"));
        assert!(b.is_blocked_in("RU"));
        assert!(!b.is_blocked_in("us"));
    }

    #[test]
    fn catalogue_roundtrip() {
        let b = fake_dual_bridge(42);
        let json = serde_json::to_string(&b).unwrap();
        let back: Bridge = serde_json::from_str(&json).unwrap();
        assert_eq!(b, back);
    }
}
