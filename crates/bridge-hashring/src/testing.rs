//! Deterministic bridge constructors for tests.
//!
//! Only available in this crate's own tests, or when the `testing`
//! feature is enabled.  Not covered by semver.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::{Bridge, BridgeFingerprint, HmacKey, OrAddress};

/// Return the fingerprint of the `idx`th fake bridge.
///
/// Fingerprints are a fixed function of `idx`, so tests that build the
/// same bridges twice get byte-identical rings.
pub fn fingerprint(idx: u32) -> BridgeFingerprint {
    let mut bytes = [0_u8; 20];
    bytes[0..4].copy_from_slice(&idx.to_be_bytes());
    // Spread the index through the rest of the bytes so fingerprints do
    // not share long common prefixes.
    for (i, b) in bytes.iter_mut().enumerate().skip(4) {
        *b = (idx.wrapping_mul(2_654_435_761).wrapping_add(i as u32) >> 16) as u8;
    }
    BridgeFingerprint::from_bytes(bytes)
}

/// Return a deterministic IPv4 bridge.
pub fn fake_bridge(idx: u32) -> Bridge {
    fake_bridge_on_port(idx, 9001)
}

/// Return a deterministic IPv4 bridge with the given ORPort.
pub fn fake_bridge_on_port(idx: u32, or_port: u16) -> Bridge {
    Bridge {
        nickname: format!("fake{}", idx),
        addr: IpAddr::V4(Ipv4Addr::new(10, (idx >> 8) as u8, (idx & 0xff) as u8, 1)),
        or_port,
        fingerprint: fingerprint(idx),
        or_addresses: Vec::new(),
        transports: Vec::new(),
        running: true,
        stable: true,
        blocked_in: Default::default(),
    }
}

/// Return a deterministic IPv6-only bridge.
///
/// Its fingerprint space is disjoint from [`fake_bridge`]'s.
pub fn fake_bridge_v6(idx: u32) -> Bridge {
    let mut b = fake_bridge(idx ^ 0x8000_0000);
    b.addr = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, idx as u16, 0, 0, 0, 0, 1));
    b
}

/// Return a deterministic dual-stack bridge: IPv4 primary address plus
/// an IPv6 OR address.
///
/// Its fingerprint space is disjoint from both [`fake_bridge`]'s and
/// [`fake_bridge_v6`]'s.
pub fn fake_dual_bridge(idx: u32) -> Bridge {
    let mut b = fake_bridge(idx ^ 0x4000_0000);
    b.or_addresses.push(OrAddress {
        addr: IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0xffff, idx as u16, 0, 0, 0, 2)),
        ports: vec![b.or_port],
    });
    b
}

/// Return an HMAC key derived from a fixed test master key.
pub fn test_key(label: &str) -> HmacKey {
    HmacKey::from_master(b"unseasonably warm test master key", label)
}
