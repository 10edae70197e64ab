//! Mapping client addresses to "areas".
//!
//! An area is a coarse bucket of IP space; every client in one area gets
//! the same hashring position for a given period, which is what makes a
//! subnet full of sybil identities collectively see a single answer.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A function mapping a client address to its area string.
///
/// Addresses mapping to equal strings are in the same area.
pub type AreaMapper = Box<dyn Fn(IpAddr) -> String + Send + Sync>;

/// Map an address to a uniform-width subnet: `a.b.0.0/16` for IPv4,
/// `xxxx:yyyy::/32` for IPv6.
pub fn uniform_map(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, _, _] = v4.octets();
            format!("{}/16", Ipv4Addr::new(a, b, 0, 0))
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            format!("{}/32", Ipv6Addr::new(s[0], s[1], 0, 0, 0, 0, 0, 0))
        }
    }
}

/// Return [`uniform_map`] as a boxed [`AreaMapper`].
pub fn uniform_mapper() -> AreaMapper {
    Box::new(uniform_map)
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

    /// Shorthand: map a parsed address.
    fn map(s: &str) -> String {
        uniform_map(s.parse().unwrap())
    }

    #[test]
    fn v4_slash16() {
        assert_eq!(map("1.2.3.4"), "1.2.0.0/16");
        assert_eq!(map("1.2.211.154"), "1.2.0.0/16");
        assert_ne!(map("1.3.3.4"), map("1.2.3.4"));
    }

    #[test]
    fn v6_slash32() {
        assert_eq!(map("2001:f::bc1:b13:2808"), "2001:f::/32");
        assert_eq!(map("2a00:c98:2030:a020:2::42"), "2a00:c98::/32");
        assert_eq!(map("2a00:c98::1"), map("2a00:c98:ffff::1"));
    }
}
