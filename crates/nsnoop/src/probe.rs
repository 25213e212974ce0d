//! Gratuitous probe emitter.
//!
//! Builds the ARP REQUEST or ICMPv6 Neighbor Solicitation frame that
//! refreshes a neighbor before the kernel demotes it to STALE, and sends
//! it on a raw L2 socket bound per-send to the originating SVI.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tracing::debug;
use zerocopy::{Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};
use crate::util;

pub const ETH_P_ARP: u16 = 0x0806;
pub const ETH_P_IPV6: u16 = 0x86DD;

const ETH_ALEN: usize = 6;

/// Ethernet II header.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout)]
struct EthHdr {
    dst: [u8; ETH_ALEN],
    src: [u8; ETH_ALEN],
    ethertype: [u8; 2],
}

/// RFC 826 ARP packet for Ethernet/IPv4.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout)]
struct ArpPkt {
    hardware_type: [u8; 2],
    protocol_type: [u8; 2],
    hardware_len: u8,
    protocol_len: u8,
    operation: [u8; 2],
    sender_hw: [u8; ETH_ALEN],
    sender_ip: [u8; 4],
    target_hw: [u8; ETH_ALEN],
    target_ip: [u8; 4],
}

/// IPv6 fixed header.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout)]
struct Ipv6Hdr {
    /// Version (6), traffic class, flow label.
    version_tc_flow: [u8; 4],
    payload_len: [u8; 2],
    next_header: u8,
    hop_limit: u8,
    src: [u8; 16],
    dst: [u8; 16],
}

/// ICMPv6 Neighbor Solicitation with one Source Link-Layer Address option.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout)]
struct NeighborSolicit {
    icmp_type: u8,
    code: u8,
    checksum: [u8; 2],
    reserved: [u8; 4],
    target: [u8; 16],
    option_type: u8,
    option_len: u8,
    option_lladdr: [u8; ETH_ALEN],
}

/// Pseudo-header for the ICMPv6 checksum.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout)]
struct PseudoHdr {
    src: [u8; 16],
    dst: [u8; 16],
    length: [u8; 4],
    zeros: [u8; 3],
    next_header: u8,
}

const ICMPV6: u8 = 58;
const ND_NEIGHBOR_SOLICIT: u8 = 135;

/// RFC 1071 one's-complement sum over 16-bit words.
fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [tail] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*tail, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }
    !(sum as u16)
}

/// Build an Ethernet+ARP REQUEST frame. The target hardware address is
/// zero; the Ethernet destination is the neighbor being refreshed.
pub fn build_arp_request(
    src_mac: &[u8; 6],
    src_ip: Ipv4Addr,
    dst_mac: &[u8; 6],
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let eth = EthHdr {
        dst: *dst_mac,
        src: *src_mac,
        ethertype: ETH_P_ARP.to_be_bytes(),
    };
    let arp = ArpPkt {
        hardware_type: 1u16.to_be_bytes(),
        protocol_type: 0x0800u16.to_be_bytes(),
        hardware_len: ETH_ALEN as u8,
        protocol_len: 4,
        operation: 1u16.to_be_bytes(),
        sender_hw: *src_mac,
        sender_ip: src_ip.octets(),
        target_hw: [0; ETH_ALEN],
        target_ip: target_ip.octets(),
    };

    let mut frame = Vec::with_capacity(std::mem::size_of::<EthHdr>() + std::mem::size_of::<ArpPkt>());
    frame.extend_from_slice(eth.as_bytes());
    frame.extend_from_slice(arp.as_bytes());
    frame
}

/// Build an Ethernet + IPv6 + ICMPv6 Neighbor Solicitation frame with the
/// Source Link-Layer Address option and the RFC 4443 checksum.
pub fn build_neighbor_solicitation(
    src_mac: &[u8; 6],
    src_ip: Ipv6Addr,
    dst_mac: &[u8; 6],
    target_ip: Ipv6Addr,
) -> Vec<u8> {
    let ns_len = std::mem::size_of::<NeighborSolicit>();

    let eth = EthHdr {
        dst: *dst_mac,
        src: *src_mac,
        ethertype: ETH_P_IPV6.to_be_bytes(),
    };
    let ip6 = Ipv6Hdr {
        version_tc_flow: [0x60, 0, 0, 0],
        payload_len: (ns_len as u16).to_be_bytes(),
        next_header: ICMPV6,
        // Hosts drop NS messages that did not originate on-link.
        hop_limit: 255,
        src: src_ip.octets(),
        dst: target_ip.octets(),
    };
    let mut ns = NeighborSolicit {
        icmp_type: ND_NEIGHBOR_SOLICIT,
        code: 0,
        checksum: [0; 2],
        reserved: [0; 4],
        target: target_ip.octets(),
        option_type: 1,
        option_len: 1,
        option_lladdr: *src_mac,
    };

    let pseudo = PseudoHdr {
        src: src_ip.octets(),
        dst: target_ip.octets(),
        length: (ns_len as u32).to_be_bytes(),
        zeros: [0; 3],
        next_header: ICMPV6,
    };
    let mut sum_buf = Vec::with_capacity(std::mem::size_of::<PseudoHdr>() + ns_len);
    sum_buf.extend_from_slice(pseudo.as_bytes());
    sum_buf.extend_from_slice(ns.as_bytes());
    ns.checksum = checksum(&sum_buf).to_be_bytes();

    let mut frame =
        Vec::with_capacity(std::mem::size_of::<EthHdr>() + std::mem::size_of::<Ipv6Hdr>() + ns_len);
    frame.extend_from_slice(eth.as_bytes());
    frame.extend_from_slice(ip6.as_bytes());
    frame.extend_from_slice(ns.as_bytes());
    frame
}

/// Pick the probe type for a neighbor: IPv4-mapped targets are refreshed
/// with ARP, everything else with a Neighbor Solicitation. Returns the
/// frame and its ethertype.
pub fn build_probe(
    src_mac: &[u8; 6],
    src_ip: &Ipv6Addr,
    dst_mac: &[u8; 6],
    target_ip: &Ipv6Addr,
) -> Result<(Vec<u8>, u16)> {
    match util::mapped_v4(target_ip) {
        Some(target_v4) => {
            let src_v4 = util::mapped_v4(src_ip).ok_or_else(|| {
                Error::InvalidMessage(format!(
                    "IPv4 target {target_v4} with non-IPv4 source {src_ip}"
                ))
            })?;
            Ok((
                build_arp_request(src_mac, src_v4, dst_mac, target_v4),
                ETH_P_ARP,
            ))
        }
        None => Ok((
            build_neighbor_solicitation(src_mac, *src_ip, dst_mac, *target_ip),
            ETH_P_IPV6,
        )),
    }
}

/// Raw AF_PACKET socket the probes leave through.
pub struct ProbeSocket {
    fd: OwnedFd,
}

impl ProbeSocket {
    /// Open the raw socket. Requires CAP_NET_RAW.
    pub fn new() -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                (libc::ETH_P_ALL as u16).to_be() as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Send one frame out of `ifindex` to `dst_mac`.
    pub fn send(&self, frame: &[u8], ifindex: u32, dst_mac: &[u8; 6], ethertype: u16) -> Result<()> {
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = ethertype.to_be();
        addr.sll_ifindex = ifindex as i32;
        addr.sll_halen = ETH_ALEN as u8;
        addr.sll_addr[..ETH_ALEN].copy_from_slice(dst_mac);

        let ret = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Emit a gratuitous probe for a neighbor. Failures are the caller's
    /// to log; they never take the daemon down.
    pub fn send_gratuitous(
        &self,
        link_mac: &[u8; 6],
        link_ifindex: u32,
        src_ip: &Ipv6Addr,
        neigh_mac: &[u8; 6],
        neigh_ip: &Ipv6Addr,
    ) -> Result<()> {
        let (frame, ethertype) = build_probe(link_mac, src_ip, neigh_mac, neigh_ip)?;
        self.send(&frame, link_ifindex, neigh_mac, ethertype)?;
        debug!(
            "gratuitous {} sent to {} on ifindex {link_ifindex}",
            if ethertype == ETH_P_ARP { "ARP" } else { "NS" },
            util::format_ip(neigh_ip),
        );
        Ok(())
    }
}

impl AsRawFd for ProbeSocket {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    const DST_MAC: [u8; 6] = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];

    #[test]
    fn test_arp_request_layout() {
        let frame = build_arp_request(
            &SRC_MAC,
            Ipv4Addr::new(10, 0, 0, 1),
            &DST_MAC,
            Ipv4Addr::new(10, 0, 0, 7),
        );
        assert_eq!(frame.len(), 42);

        assert_eq!(&frame[0..6], &DST_MAC);
        assert_eq!(&frame[6..12], &SRC_MAC);
        assert_eq!(&frame[12..14], &ETH_P_ARP.to_be_bytes());

        // htype=1, ptype=0x0800, hlen=6, plen=4, oper=REQUEST(1)
        assert_eq!(&frame[14..22], &[0, 1, 0x08, 0, 6, 4, 0, 1]);
        assert_eq!(&frame[22..28], &SRC_MAC); // sender hw
        assert_eq!(&frame[28..32], &[10, 0, 0, 1]); // sender ip
        assert_eq!(&frame[32..38], &[0; 6]); // target hw zeroed
        assert_eq!(&frame[38..42], &[10, 0, 0, 7]); // target ip
    }

    #[test]
    fn test_ns_layout_and_checksum() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::7".parse().unwrap();
        let frame = build_neighbor_solicitation(&SRC_MAC, src, &DST_MAC, dst);
        assert_eq!(frame.len(), 86);

        assert_eq!(&frame[12..14], &ETH_P_IPV6.to_be_bytes());
        assert_eq!(frame[14] >> 4, 6); // version
        assert_eq!(&frame[18..20], &32u16.to_be_bytes()); // payload length
        assert_eq!(frame[20], ICMPV6);
        assert_eq!(frame[21], 255); // hop limit
        assert_eq!(&frame[22..38], &src.octets());
        assert_eq!(&frame[38..54], &dst.octets());

        assert_eq!(frame[54], ND_NEIGHBOR_SOLICIT);
        assert_eq!(frame[55], 0);
        assert_eq!(&frame[62..78], &dst.octets()); // NS target
        assert_eq!(frame[78], 1); // option: source link-layer address
        assert_eq!(frame[79], 1); // length in units of 8 octets
        assert_eq!(&frame[80..86], &SRC_MAC);

        // Checksum over pseudo-header + message (including the stored
        // checksum) must fold to zero.
        let pseudo = PseudoHdr {
            src: src.octets(),
            dst: dst.octets(),
            length: 32u32.to_be_bytes(),
            zeros: [0; 3],
            next_header: ICMPV6,
        };
        let mut sum_buf = pseudo.as_bytes().to_vec();
        sum_buf.extend_from_slice(&frame[54..86]);
        assert_eq!(checksum(&sum_buf), 0);
    }

    #[test]
    fn test_checksum_known_vector() {
        // RFC 1071 example data.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), !0xddf2);
    }

    #[test]
    fn test_checksum_odd_length() {
        assert_eq!(checksum(&[0xff]), !0xff00);
    }

    #[test]
    fn test_probe_path_selection() {
        let v4_target = crate::util::canonical_ip("10.0.0.7".parse().unwrap());
        let v4_src = crate::util::canonical_ip("10.0.0.1".parse().unwrap());
        let (frame, ethertype) = build_probe(&SRC_MAC, &v4_src, &DST_MAC, &v4_target).unwrap();
        assert_eq!(ethertype, ETH_P_ARP);
        assert_eq!(frame.len(), 42);

        let v6_target: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let v6_src: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let (frame, ethertype) = build_probe(&SRC_MAC, &v6_src, &DST_MAC, &v6_target).unwrap();
        assert_eq!(ethertype, ETH_P_IPV6);
        assert_eq!(frame.len(), 86);

        // Mixed-family neighbor data cannot be probed.
        assert!(build_probe(&SRC_MAC, &v6_src, &DST_MAC, &v4_target).is_err());
    }
}
