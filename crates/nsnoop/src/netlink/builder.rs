//! Message builder for constructing netlink requests.

use zerocopy::{Immutable, IntoBytes};

use super::attr::{NLA_F_NESTED, NlAttr, nla_align};
use super::message::{NLMSG_HDRLEN, NlMsgHdr, nlmsg_align};

/// Token returned when starting a nested attribute; finalizes its length.
#[derive(Debug, Clone, Copy)]
pub struct NestToken {
    offset: usize,
}

/// Builder for netlink request messages.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    /// Create a new builder with the given message type and flags.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        let header = NlMsgHdr::new(msg_type, flags);
        let mut buf = vec![0u8; NLMSG_HDRLEN];
        buf[..std::mem::size_of::<NlMsgHdr>()].copy_from_slice(header.as_bytes());
        Self { buf }
    }

    /// Append a fixed-layout struct (the family-specific message header).
    pub fn append<T: IntoBytes + Immutable>(&mut self, data: &T) {
        self.buf.extend_from_slice(data.as_bytes());
        let aligned = nlmsg_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Append an attribute with a raw payload.
    pub fn append_attr(&mut self, attr_type: u16, data: &[u8]) {
        let attr = NlAttr::new(attr_type, data.len());
        self.buf.extend_from_slice(attr.as_bytes());
        self.buf.extend_from_slice(data);
        let aligned = nla_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Append a u16 attribute (native endian).
    pub fn append_attr_u16(&mut self, attr_type: u16, value: u16) {
        self.append_attr(attr_type, &value.to_ne_bytes());
    }

    /// Append a u32 attribute (native endian).
    pub fn append_attr_u32(&mut self, attr_type: u16, value: u32) {
        self.append_attr(attr_type, &value.to_ne_bytes());
    }

    /// Append a null-terminated string attribute.
    pub fn append_attr_str(&mut self, attr_type: u16, value: &str) {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        self.append_attr(attr_type, &data);
    }

    /// Start a nested attribute. Returns a token to close it with.
    pub fn nest_start(&mut self, attr_type: u16) -> NestToken {
        let offset = self.buf.len();
        let attr = NlAttr::new(attr_type | NLA_F_NESTED, 0);
        self.buf.extend_from_slice(attr.as_bytes());
        NestToken { offset }
    }

    /// Close a nested attribute started with [`nest_start`](Self::nest_start).
    pub fn nest_end(&mut self, token: NestToken) {
        let len = (self.buf.len() - token.offset) as u16;
        self.buf[token.offset..token.offset + 2].copy_from_slice(&len.to_ne_bytes());
        let aligned = nla_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Set the sequence number.
    pub fn set_seq(&mut self, seq: u32) {
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
    }

    /// Set the sender port ID.
    pub fn set_pid(&mut self, pid: u32) {
        self.buf[12..16].copy_from_slice(&pid.to_ne_bytes());
    }

    /// Finalize the total length and return the message bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::attr::AttrIter;
    use crate::netlink::message::{MessageIter, NLM_F_REQUEST, NlMsgType};

    #[test]
    fn test_header_length_finalized() {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_GETLINK, NLM_F_REQUEST);
        builder.append_attr_u32(1, 7);
        let msg = builder.finish();

        let (header, payload) = MessageIter::new(&msg).next().unwrap().unwrap();
        assert_eq!(header.nlmsg_len as usize, msg.len());
        assert_eq!(header.nlmsg_type, NlMsgType::RTM_GETLINK);
        assert_eq!(AttrIter::new(payload).next(), Some((1, &7u32.to_ne_bytes()[..])));
    }

    #[test]
    fn test_string_attr_null_terminated() {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_NEWQDISC, NLM_F_REQUEST);
        builder.append_attr_str(1, "clsact");
        let msg = builder.finish();

        let (_, payload) = MessageIter::new(&msg).next().unwrap().unwrap();
        let (_, data) = AttrIter::new(payload).next().unwrap();
        assert_eq!(data, b"clsact\0");
    }

    #[test]
    fn test_nested_attr_length() {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_NEWTFILTER, NLM_F_REQUEST);
        let nest = builder.nest_start(2);
        builder.append_attr_u32(6, 99);
        builder.nest_end(nest);
        let msg = builder.finish();

        let (_, payload) = MessageIter::new(&msg).next().unwrap().unwrap();
        let (kind, nested) = AttrIter::new(payload).next().unwrap();
        assert_eq!(kind, 2);
        assert_eq!(AttrIter::new(nested).next(), Some((6, &99u32.to_ne_bytes()[..])));
    }

    #[test]
    fn test_seq_and_pid() {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_GETADDR, NLM_F_REQUEST);
        builder.set_seq(0xAABBCCDD);
        builder.set_pid(0x11223344);
        let msg = builder.finish();

        let (header, _) = MessageIter::new(&msg).next().unwrap().unwrap();
        assert_eq!(header.nlmsg_seq, 0xAABBCCDD);
        assert_eq!(header.nlmsg_pid, 0x11223344);
    }
}
