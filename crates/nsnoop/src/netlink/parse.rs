//! Shared helpers for parsing rtnetlink message payloads.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use winnow::binary::le_u16;
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::take;

use crate::error::{Error, Result};
use crate::netlink::attr::NLA_TYPE_MASK;

/// Parser result alias for winnow-based message parsers.
pub type PResult<T> = core::result::Result<T, ErrMode<ContextError>>;

/// Hard parse failure.
pub fn cut() -> ErrMode<ContextError> {
    ErrMode::Cut(ContextError::new())
}

/// Walk the attribute stream following a fixed message header, invoking
/// `f` with each (type, payload) pair. Truncated trailing attributes end
/// the walk; unknown types are the caller's business.
pub fn walk_attrs(input: &mut &[u8], mut f: impl FnMut(u16, &[u8])) -> PResult<()> {
    while input.len() >= 4 {
        let len = le_u16.parse_next(input)? as usize;
        let attr_type = le_u16.parse_next(input)?;

        if len < 4 {
            break;
        }

        let payload_len = len - 4;
        if input.len() < payload_len {
            break;
        }
        let payload: &[u8] = take(payload_len).parse_next(input)?;

        // Skip alignment padding
        let aligned = (len + 3) & !3;
        let padding = aligned - len;
        if input.len() >= padding {
            let _: &[u8] = take(padding).parse_next(input)?;
        }

        f(attr_type & NLA_TYPE_MASK, payload);
    }
    Ok(())
}

/// Parse an IP address payload according to the message's address family.
pub fn parse_ip_addr(data: &[u8], family: u8) -> Result<IpAddr> {
    match family {
        f if f == libc::AF_INET as u8 => {
            let octets: [u8; 4] = data
                .try_into()
                .map_err(|_| Error::InvalidAttribute(format!("IPv4 len {}", data.len())))?;
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        f if f == libc::AF_INET6 as u8 => {
            let octets: [u8; 16] = data
                .try_into()
                .map_err(|_| Error::InvalidAttribute(format!("IPv6 len {}", data.len())))?;
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        other => Err(Error::InvalidAttribute(format!(
            "address in unsupported family {other}"
        ))),
    }
}

/// Parse a null-terminated string attribute, lossily.
pub fn parse_string_from_bytes(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Extract a native-endian u16 from an attribute payload.
pub fn attr_u16(data: &[u8]) -> Option<u16> {
    data.get(..2).map(|b| u16::from_ne_bytes([b[0], b[1]]))
}

/// Extract a big-endian u16 from an attribute payload.
pub fn attr_u16_be(data: &[u8]) -> Option<u16> {
    data.get(..2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Extract a native-endian u32 from an attribute payload.
pub fn attr_u32(data: &[u8]) -> Option<u32> {
    data.get(..4)
        .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_attrs_alignment() {
        // type 3 with 1-byte payload (padded), then type 7 with 4 bytes.
        let buf: &[u8] = &[5, 0, 3, 0, 0xaa, 0, 0, 0, 8, 0, 7, 0, 1, 2, 3, 4];
        let mut seen = Vec::new();
        let mut input = buf;
        walk_attrs(&mut input, |ty, data| seen.push((ty, data.to_vec()))).unwrap();
        assert_eq!(seen, vec![(3, vec![0xaa]), (7, vec![1, 2, 3, 4])]);
    }

    #[test]
    fn test_parse_ip_addr() {
        let v4 = parse_ip_addr(&[10, 0, 0, 1], libc::AF_INET as u8).unwrap();
        assert_eq!(v4, "10.0.0.1".parse::<IpAddr>().unwrap());

        let mut v6 = [0u8; 16];
        v6[15] = 1;
        assert_eq!(
            parse_ip_addr(&v6, libc::AF_INET6 as u8).unwrap(),
            "::1".parse::<IpAddr>().unwrap()
        );

        assert!(parse_ip_addr(&[10, 0, 0, 1], 0).is_err());
        assert!(parse_ip_addr(&[10, 0], libc::AF_INET as u8).is_err());
    }

    #[test]
    fn test_parse_string() {
        assert_eq!(parse_string_from_bytes(b"eth0\0junk"), "eth0");
        assert_eq!(parse_string_from_bytes(b"br0"), "br0");
    }
}
