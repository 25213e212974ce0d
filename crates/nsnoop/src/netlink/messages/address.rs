//! Strongly-typed address message.

use std::net::IpAddr;

use winnow::prelude::*;
use winnow::token::take;

use crate::error::{Error, Result};
use crate::netlink::parse::{PResult, cut, parse_ip_addr, parse_string_from_bytes, walk_attrs};
use crate::netlink::types::IfAddrMsg;

/// Attribute IDs for IFA_* constants.
mod attr_ids {
    pub const IFA_ADDRESS: u16 = 1;
    pub const IFA_LOCAL: u16 = 2;
    pub const IFA_LABEL: u16 = 3;
}

/// Address message with the attributes the topology cache consumes.
#[derive(Debug, Clone, Default)]
pub struct AddressMessage {
    /// Fixed-size header.
    pub header: IfAddrMsg,
    /// Address (IFA_ADDRESS). For IPv4 this is the peer on ptp links.
    pub address: Option<IpAddr>,
    /// Local address (IFA_LOCAL).
    pub local: Option<IpAddr>,
    /// Interface label (IFA_LABEL).
    pub label: Option<String>,
}

impl AddressMessage {
    /// Get the interface index.
    pub fn ifindex(&self) -> u32 {
        self.header.ifa_index
    }

    /// Get the family-native prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.header.ifa_prefixlen
    }

    /// Check if this is an IPv4 address.
    pub fn is_ipv4(&self) -> bool {
        self.header.ifa_family == libc::AF_INET as u8
    }

    /// Get the host address: IFA_LOCAL when present, IFA_ADDRESS otherwise.
    pub fn primary_address(&self) -> Option<&IpAddr> {
        self.local.as_ref().or(self.address.as_ref())
    }

    /// Parse from a message payload.
    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        Self::parse(&mut data).map_err(|_| Error::InvalidMessage("address message".into()))
    }

    fn parse(input: &mut &[u8]) -> PResult<Self> {
        if input.len() < IfAddrMsg::SIZE {
            return Err(cut());
        }
        let header_bytes: &[u8] = take(IfAddrMsg::SIZE).parse_next(input)?;
        let header = *IfAddrMsg::from_bytes(header_bytes).map_err(|_| cut())?;

        let mut msg = AddressMessage {
            header,
            ..Default::default()
        };

        walk_attrs(input, |ty, data| match ty {
            attr_ids::IFA_ADDRESS => {
                if let Ok(addr) = parse_ip_addr(data, header.ifa_family) {
                    msg.address = Some(addr);
                }
            }
            attr_ids::IFA_LOCAL => {
                if let Ok(addr) = parse_ip_addr(data, header.ifa_family) {
                    msg.local = Some(addr);
                }
            }
            attr_ids::IFA_LABEL => msg.label = Some(parse_string_from_bytes(data)),
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

    #[test]
    fn test_parse_v4_address() {
        let mut b = MessageBuilder::new(NlMsgType::RTM_NEWADDR, 0);
        let hdr = IfAddrMsg {
            ifa_family: libc::AF_INET as u8,
            ifa_prefixlen: 24,
            ifa_flags: 0,
            ifa_scope: 0,
            ifa_index: 10,
        };
        b.append(&hdr);
        b.append_attr(attr_ids::IFA_ADDRESS, &[10, 0, 0, 1]);
        b.append_attr(attr_ids::IFA_LOCAL, &[10, 0, 0, 1]);
        b.append_attr_str(attr_ids::IFA_LABEL, "svi10");

        let payload = &b.finish()[NLMSG_HDRLEN..];
        let msg = AddressMessage::from_bytes(payload).unwrap();
        assert_eq!(msg.ifindex(), 10);
        assert_eq!(msg.prefix_len(), 24);
        assert!(msg.is_ipv4());
        assert_eq!(
            msg.primary_address(),
            Some(&"10.0.0.1".parse::<IpAddr>().unwrap())
        );
        assert_eq!(msg.label.as_deref(), Some("svi10"));
    }

    #[test]
    fn test_primary_prefers_local() {
        let mut msg = AddressMessage::default();
        msg.address = Some("10.0.0.2".parse().unwrap());
        assert_eq!(
            msg.primary_address(),
            Some(&"10.0.0.2".parse::<IpAddr>().unwrap())
        );
        msg.local = Some("10.0.0.1".parse().unwrap());
        assert_eq!(
            msg.primary_address(),
            Some(&"10.0.0.1".parse::<IpAddr>().unwrap())
        );
    }
}
