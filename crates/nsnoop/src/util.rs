//! Address canonicalization and formatting helpers.
//!
//! The cache stores every IP address as an [`Ipv6Addr`]; IPv4 addresses are
//! kept in IPv4-mapped form (`::ffff:a.b.c.d`) so that one key type covers
//! both families. Prefix lengths follow the same convention: an IPv4 `/p`
//! becomes `/(96 + p)` on the 128-bit scale.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Canonicalize an address to the cache's IPv6 representation.
pub fn canonical_ip(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Recover the IPv4 address from an IPv4-mapped IPv6 address.
pub fn mapped_v4(addr: &Ipv6Addr) -> Option<Ipv4Addr> {
    let octets = addr.octets();
    if octets[..10] == [0; 10] && octets[10] == 0xff && octets[11] == 0xff {
        Some(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]))
    } else {
        None
    }
}

/// Prefix length on the 128-bit scale for a family-native length.
pub fn advertised_prefix_len(is_ipv4: bool, prefix_len: u8) -> u32 {
    if is_ipv4 {
        96 + u32::from(prefix_len)
    } else {
        u32::from(prefix_len)
    }
}

/// Mask an address down to its network address.
pub fn network_of(ip: &Ipv6Addr, prefix_len: u32) -> Ipv6Addr {
    let mut octets = ip.octets();
    let prefix_len = prefix_len.min(128) as usize;
    let full = prefix_len / 8;
    let partial = prefix_len % 8;

    if partial != 0 {
        octets[full] &= 0xff << (8 - partial);
    }
    for octet in octets.iter_mut().skip(full + usize::from(partial != 0)) {
        *octet = 0;
    }
    Ipv6Addr::from(octets)
}

/// IPv6 link-local test (fe80::/10). IPv4-mapped addresses never match.
pub fn is_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// Format a MAC address as `aa:bb:cc:dd:ee:ff`.
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Format an address in its family-native textual form.
pub fn format_ip(addr: &Ipv6Addr) -> String {
    match mapped_v4(addr) {
        Some(v4) => v4.to_string(),
        None => addr.to_string(),
    }
}

/// Format a network as CIDR, using the family-native prefix length.
pub fn format_cidr(addr: &Ipv6Addr, true_prefix_len: u8) -> String {
    format!("{}/{}", format_ip(addr), true_prefix_len)
}
