//! Netlink attribute (rtattr/nlattr) handling.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Netlink attribute alignment.
pub const NLA_ALIGNTO: usize = 4;

/// Align a length to the NLA_ALIGNTO boundary.
#[inline]
pub const fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Size of the attribute header.
pub const NLA_HDRLEN: usize = 4;

/// Netlink attribute header (mirrors struct nlattr / struct rtattr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlAttr {
    /// Length including header.
    pub nla_len: u16,
    /// Attribute type.
    pub nla_type: u16,
}

/// Attribute type flags.
pub const NLA_F_NESTED: u16 = 1 << 15;
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

impl NlAttr {
    /// Create a new attribute header for a payload of the given length.
    pub fn new(attr_type: u16, data_len: usize) -> Self {
        Self {
            nla_len: (NLA_HDRLEN + data_len) as u16,
            nla_type: attr_type,
        }
    }

    /// Get the attribute type without flag bits.
    pub fn kind(&self) -> u16 {
        self.nla_type & NLA_TYPE_MASK
    }
}

/// Iterator over the attributes of a message payload.
pub struct AttrIter<'a> {
    data: &'a [u8],
}

impl<'a> AttrIter<'a> {
    /// Create a new attribute iterator.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    /// Yields (attribute type, payload).
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < NLA_HDRLEN {
            return None;
        }

        let (attr, _) = NlAttr::ref_from_prefix(self.data).ok()?;
        let len = attr.nla_len as usize;
        if len < NLA_HDRLEN || len > self.data.len() {
            return None;
        }

        let payload = &self.data[NLA_HDRLEN..len];
        let aligned = nla_align(len);
        self.data = if aligned >= self.data.len() {
            &[]
        } else {
            &self.data[aligned..]
        };

        Some((attr.kind(), payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iter_with_padding() {
        // u16 attribute (padded to 8) followed by a 4-byte attribute.
        let buf: &[u8] = &[
            6, 0, 5, 0, 0x0a, 0x00, 0, 0, // type 5, len 6, payload 0x000a + pad
            8, 0, 1, 0, 1, 2, 3, 4, // type 1, len 8
        ];
        let attrs: Vec<_> = AttrIter::new(buf).collect();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0], (5, &[0x0a, 0x00][..]));
        assert_eq!(attrs[1], (1, &[1, 2, 3, 4][..]));
    }

    #[test]
    fn test_iter_stops_on_truncation() {
        let buf: &[u8] = &[12, 0, 1, 0, 1, 2]; // claims 12 bytes, has 6
        assert_eq!(AttrIter::new(buf).count(), 0);
    }

    #[test]
    fn test_kind_masks_flags() {
        let attr = NlAttr::new(3 | NLA_F_NESTED, 0);
        assert_eq!(attr.kind(), 3);
    }
}
