//! Strongly-typed link message.

use winnow::prelude::*;
use winnow::token::take;

use crate::error::{Error, Result};
use crate::netlink::parse::{
    PResult, attr_u16, attr_u16_be, cut, parse_string_from_bytes, walk_attrs,
};
use crate::netlink::types::IfInfoMsg;

/// Attribute IDs for IFLA_* constants.
mod attr_ids {
    pub const IFLA_ADDRESS: u16 = 1;
    pub const IFLA_IFNAME: u16 = 3;
    pub const IFLA_LINK: u16 = 5;
    pub const IFLA_MASTER: u16 = 10;
    pub const IFLA_LINKINFO: u16 = 18;
}

/// Nested IFLA_INFO_* attribute IDs.
mod info_ids {
    pub const IFLA_INFO_KIND: u16 = 1;
    pub const IFLA_INFO_DATA: u16 = 2;
    pub const IFLA_INFO_SLAVE_KIND: u16 = 4;
}

/// Nested IFLA_VLAN_* attribute IDs (inside IFLA_INFO_DATA of a vlan link).
mod vlan_ids {
    pub const IFLA_VLAN_ID: u16 = 1;
    pub const IFLA_VLAN_PROTOCOL: u16 = 5;
}

/// Link message with the attributes the topology cache consumes.
#[derive(Debug, Clone, Default)]
pub struct LinkMessage {
    /// Fixed-size header.
    pub header: IfInfoMsg,
    /// Interface name (IFLA_IFNAME).
    pub name: Option<String>,
    /// Hardware address (IFLA_ADDRESS).
    pub address: Option<Vec<u8>>,
    /// Parent link index for stacked devices (IFLA_LINK).
    pub link: Option<u32>,
    /// Master device index (IFLA_MASTER).
    pub master: Option<u32>,
    /// Link kind from IFLA_LINKINFO (e.g. "vlan", "bridge", "macvlan").
    pub kind: Option<String>,
    /// Slave kind for enslaved interfaces.
    pub slave_kind: Option<String>,
    /// VLAN ID for vlan links.
    pub vlan_id: Option<u16>,
    /// VLAN protocol (network order 0x8100 / 0x88a8) for vlan links.
    pub vlan_protocol: Option<u16>,
}

impl LinkMessage {
    /// Get the interface index.
    pub fn ifindex(&self) -> u32 {
        self.header.ifi_index as u32
    }

    /// Hardware address as a fixed 6-byte MAC, when it is one.
    pub fn mac(&self) -> Option<[u8; 6]> {
        let addr = self.address.as_deref()?;
        addr.try_into().ok()
    }

    /// Parse from a message payload.
    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        Self::parse(&mut data).map_err(|_| Error::InvalidMessage("link message".into()))
    }

    fn parse(input: &mut &[u8]) -> PResult<Self> {
        if input.len() < IfInfoMsg::SIZE {
            return Err(cut());
        }
        let header_bytes: &[u8] = take(IfInfoMsg::SIZE).parse_next(input)?;
        let header = *IfInfoMsg::from_bytes(header_bytes).map_err(|_| cut())?;

        let mut msg = LinkMessage {
            header,
            ..Default::default()
        };

        let mut link_info: Option<Vec<u8>> = None;
        walk_attrs(input, |ty, data| match ty {
            attr_ids::IFLA_IFNAME => msg.name = Some(parse_string_from_bytes(data)),
            attr_ids::IFLA_ADDRESS => msg.address = Some(data.to_vec()),
            attr_ids::IFLA_LINK => {
                msg.link = data
                    .get(..4)
                    .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            }
            attr_ids::IFLA_MASTER => {
                msg.master = data
                    .get(..4)
                    .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            }
            attr_ids::IFLA_LINKINFO => link_info = Some(data.to_vec()),
            _ => {}
        })?;

        if let Some(info) = link_info {
            msg.parse_link_info(&info)?;
        }

        Ok(msg)
    }

    fn parse_link_info(&mut self, info: &[u8]) -> PResult<()> {
        let mut input = info;
        let mut vlan_data: Option<Vec<u8>> = None;
        let mut kind = None;
        let mut slave_kind = None;

        walk_attrs(&mut input, |ty, data| match ty {
            info_ids::IFLA_INFO_KIND => kind = Some(parse_string_from_bytes(data)),
            info_ids::IFLA_INFO_SLAVE_KIND => slave_kind = Some(parse_string_from_bytes(data)),
            info_ids::IFLA_INFO_DATA => vlan_data = Some(data.to_vec()),
            _ => {}
        })?;

        let is_vlan = kind.as_deref() == Some("vlan");
        self.kind = kind;
        self.slave_kind = slave_kind;

        if is_vlan {
            if let Some(data) = vlan_data {
                let mut input = &data[..];
                walk_attrs(&mut input, |ty, data| match ty {
                    vlan_ids::IFLA_VLAN_ID => self.vlan_id = attr_u16(data),
                    vlan_ids::IFLA_VLAN_PROTOCOL => self.vlan_protocol = attr_u16_be(data),
                    _ => {}
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::builder::MessageBuilder;
    use crate::netlink::message::{NLMSG_HDRLEN, NlMsgType};

    fn payload_of(builder: MessageBuilder) -> Vec<u8> {
        builder.finish()[NLMSG_HDRLEN..].to_vec()
    }

    #[test]
    fn test_parse_vlan_svi() {
        let mut b = MessageBuilder::new(NlMsgType::RTM_NEWLINK, 0);
        let mut hdr = IfInfoMsg::new();
        hdr.ifi_index = 10;
        b.append(&hdr);
        b.append_attr_str(attr_ids::IFLA_IFNAME, "svi10");
        b.append_attr(attr_ids::IFLA_ADDRESS, &[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        b.append_attr_u32(attr_ids::IFLA_LINK, 2);
        let info = b.nest_start(attr_ids::IFLA_LINKINFO);
        b.append_attr_str(info_ids::IFLA_INFO_KIND, "vlan");
        let data = b.nest_start(info_ids::IFLA_INFO_DATA);
        b.append_attr_u16(vlan_ids::IFLA_VLAN_ID, 10);
        b.append_attr(vlan_ids::IFLA_VLAN_PROTOCOL, &0x8100u16.to_be_bytes());
        b.nest_end(data);
        b.nest_end(info);

        let msg = LinkMessage::from_bytes(&payload_of(b)).unwrap();
        assert_eq!(msg.ifindex(), 10);
        assert_eq!(msg.name.as_deref(), Some("svi10"));
        assert_eq!(msg.mac(), Some([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]));
        assert_eq!(msg.link, Some(2));
        assert_eq!(msg.kind.as_deref(), Some("vlan"));
        assert_eq!(msg.vlan_id, Some(10));
        assert_eq!(msg.vlan_protocol, Some(0x8100));
    }

    #[test]
    fn test_parse_plain_link() {
        let mut b = MessageBuilder::new(NlMsgType::RTM_NEWLINK, 0);
        let mut hdr = IfInfoMsg::new();
        hdr.ifi_index = 2;
        b.append(&hdr);
        b.append_attr_str(attr_ids::IFLA_IFNAME, "br0");

        let msg = LinkMessage::from_bytes(&payload_of(b)).unwrap();
        assert_eq!(msg.ifindex(), 2);
        assert_eq!(msg.kind, None);
        assert_eq!(msg.vlan_id, None);
        assert_eq!(msg.mac(), None);
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(LinkMessage::from_bytes(&[0u8; 4]).is_err());
    }
}
