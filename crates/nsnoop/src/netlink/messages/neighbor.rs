//! Strongly-typed neighbor message.
//!
//! Covers both neighbor-table entries (AF_INET/AF_INET6) and bridge FDB
//! entries, which the kernel delivers as RTM_NEWNEIGH with AF_BRIDGE.

use std::net::IpAddr;

use winnow::prelude::*;
use winnow::token::take;

use crate::error::{Error, Result};
use crate::netlink::parse::{PResult, attr_u16, cut, parse_ip_addr, walk_attrs};
use crate::netlink::types::{AF_BRIDGE, NdMsg, ntf};

/// Attribute IDs for NDA_* constants.
mod attr_ids {
    pub const NDA_DST: u16 = 1;
    pub const NDA_LLADDR: u16 = 2;
    pub const NDA_VLAN: u16 = 5;
}

/// Neighbor message with the attributes this daemon consumes.
#[derive(Debug, Clone, Default)]
pub struct NeighborMessage {
    /// Fixed-size header.
    pub header: NdMsg,
    /// Destination address (NDA_DST).
    pub destination: Option<IpAddr>,
    /// Link-layer address (NDA_LLADDR).
    pub lladdr: Option<Vec<u8>>,
    /// VLAN ID (NDA_VLAN, bridge FDB entries).
    pub vlan: Option<u16>,
}

impl NeighborMessage {
    /// Get the interface index.
    pub fn ifindex(&self) -> u32 {
        self.header.ndm_ifindex as u32
    }

    /// Check if this is a bridge FDB entry rather than a neighbor entry.
    pub fn is_fdb(&self) -> bool {
        self.header.ndm_family == AF_BRIDGE
    }

    /// Check if the entry was learned by an external controller.
    pub fn is_externally_learned(&self) -> bool {
        self.header.ndm_flags & ntf::EXT_LEARNED != 0
    }

    /// Link-layer address as a fixed 6-byte MAC, when it is one.
    pub fn mac(&self) -> Option<[u8; 6]> {
        let lladdr = self.lladdr.as_deref()?;
        lladdr.try_into().ok()
    }

    /// Parse from a message payload.
    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        Self::parse(&mut data).map_err(|_| Error::InvalidMessage("neighbor message".into()))
    }

    fn parse(input: &mut &[u8]) -> PResult<Self> {
        if input.len() < NdMsg::SIZE {
            return Err(cut());
        }
        let header_bytes: &[u8] = take(NdMsg::SIZE).parse_next(input)?;
        let header = *NdMsg::from_bytes(header_bytes).map_err(|_| cut())?;

        let mut msg = NeighborMessage {
            header,
            ..Default::default()
        };

        walk_attrs(input, |ty, data| match ty {
            attr_ids::NDA_DST => {
                if let Ok(addr) = parse_ip_addr(data, header.ndm_family) {
                    msg.destination = Some(addr);
                }
            }
            attr_ids::NDA_LLADDR => msg.lladdr = Some(data.to_vec()),
            attr_ids::NDA_VLAN => msg.vlan = attr_u16(data),
            _ => {}
        })?;

        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::builder::MessageBuilder;
    use crate::netlink::message::{NLMSG_HDRLEN, NlMsgType};
    use crate::netlink::types::nud;

    #[test]
    fn test_parse_reachable_neighbor() {
        let mut b = MessageBuilder::new(NlMsgType::RTM_NEWNEIGH, 0);
        let hdr = NdMsg::new()
            .with_family(libc::AF_INET as u8)
            .with_ifindex(10)
            .with_state(nud::REACHABLE);
        b.append(&hdr);
        b.append_attr(attr_ids::NDA_DST, &[10, 0, 0, 7]);
        b.append_attr(attr_ids::NDA_LLADDR, &[0, 0x11, 0x22, 0x33, 0x44, 0x55]);

        let payload = &b.finish()[NLMSG_HDRLEN..];
        let msg = NeighborMessage::from_bytes(payload).unwrap();
        assert_eq!(msg.ifindex(), 10);
        assert!(!msg.is_fdb());
        assert!(!msg.is_externally_learned());
        assert_eq!(msg.header.ndm_state, nud::REACHABLE);
        assert_eq!(
            msg.destination,
            Some("10.0.0.7".parse::<IpAddr>().unwrap())
        );
        assert_eq!(msg.mac(), Some([0, 0x11, 0x22, 0x33, 0x44, 0x55]));
    }

    #[test]
    fn test_parse_fdb_entry() {
        let mut b = MessageBuilder::new(NlMsgType::RTM_NEWNEIGH, 0);
        let mut hdr = NdMsg::new().with_family(AF_BRIDGE).with_ifindex(3);
        hdr.ndm_flags = ntf::EXT_LEARNED;
        b.append(&hdr);
        b.append_attr(attr_ids::NDA_LLADDR, &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        b.append_attr_u16(attr_ids::NDA_VLAN, 10);

        let payload = &b.finish()[NLMSG_HDRLEN..];
        let msg = NeighborMessage::from_bytes(payload).unwrap();
        assert!(msg.is_fdb());
        assert!(msg.is_externally_learned());
        assert_eq!(msg.vlan, Some(10));
        assert_eq!(msg.destination, None);
    }
}
