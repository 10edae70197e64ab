//! HMAC-SHA1 key derivation.
//!
//! Every ring in the system orders its bridges by an HMAC under a key of
//! its own.  All of those keys are derived from a single persisted master
//! key by HMACing an ASCII label; the label strings are fixed for the
//! lifetime of a deployment, since changing one reshuffles every ring
//! derived from it.

use hmac::{Hmac, Mac};
use sha1::Sha1;

/// The length in bytes of an HMAC-SHA1 output, and therefore of every
/// derived key.
pub(crate) const DIGEST_LEN: usize = 20;

/// HMAC-SHA1, as used for all key derivation and ring positioning.
type HmacSha1 = Hmac<Sha1>;

/// Compute `HMAC-SHA1(key, msg)`.
fn hmac_sha1(key: &[u8], msg: &[u8]) -> [u8; DIGEST_LEN] {
    let mut mac =
        HmacSha1::new_from_slice(key).expect("HMAC-SHA1 rejected a key, which cannot happen");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// A derived HMAC key, bound to one purpose by the label chain that
/// produced it.
///
/// Two keys derived with the same master key and label chain are equal;
/// equality (and ordering, used when a key is part of a filter predicate)
/// is over the raw key bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HmacKey {
    /// The derived key material.
    key: [u8; DIGEST_LEN],
}

impl HmacKey {
    /// Derive a key from a master secret and a purpose label.
    pub fn from_master(master: &[u8], label: &str) -> Self {
        HmacKey {
            key: hmac_sha1(master, label.as_bytes()),
        }
    }

    /// Derive a sub-key of this key for the purpose named by `label`.
    pub fn subkey(&self, label: &str) -> Self {
        HmacKey {
            key: hmac_sha1(&self.key, label.as_bytes()),
        }
    }

    /// Compute the HMAC of `msg` under this key.
    pub fn digest(&self, msg: &[u8]) -> [u8; DIGEST_LEN] {
        hmac_sha1(&self.key, msg)
    }

    /// Compute the HMAC of `msg` under this key, as lowercase hex.
    pub fn hexdigest(&self, msg: &[u8]) -> String {
        hex::encode(self.digest(msg))
    }

    /// Compute a short index from the HMAC of `msg` under this key.
    ///
    /// The index is the first 4 bytes of the digest read big-endian
    /// (equivalently, its first 8 hex digits).  This width is part of the
    /// stable behaviour of the system: reducing it would bias modular
    /// assignments, and widening it would reshuffle them.
    pub fn index(&self, msg: &[u8]) -> u32 {
        let d = self.digest(msg);
        u32::from_be_bytes([d[0], d[1], d[2], d[3]])
    }
}

// Keys must not end up in logs, so Debug shows nothing about the bytes.
impl std::fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HmacKey(..)")
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
    use hex_literal::hex;

    // RFC 2202 test case 2 for HMAC-SHA1.
    #[test]
    fn rfc2202() {
        let got = hmac_sha1(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(got, hex!("effcdf6ae5eb2fa2d27416d5f184df9c259a7c79"));
    }

    #[test]
    fn derivation_is_stable() {
        let k1 = HmacKey::from_master(b"master", "Splitter-Key");
        let k2 = HmacKey::from_master(b"master", "Splitter-Key");
        assert_eq!(k1, k2);
        assert_eq!(k1.subkey("x"), k2.subkey("x"));
        assert_ne!(k1.subkey("x"), k2.subkey("y"));
        assert_ne!(k1, HmacKey::from_master(b"other", "Splitter-Key"));
    }

    #[test]
    fn index_is_hex_prefix() {
        let k = HmacKey::from_master(b"master", "Assign-Areas-To-Rings");
        let hexed = k.hexdigest(b"10.1.0.0/16");
        let prefix = u32::from_str_radix(&hexed[..8], 16).unwrap();
        assert_eq!(prefix, k.index(b"10.1.0.0/16"));
    }

    #[test]
    fn debug_is_scrubbed() {
        let k = HmacKey::from_master(b"master", "Splitter-Key");
        assert_eq!(format!("{:?}", k), "HmacKey(..)");
    }
}
