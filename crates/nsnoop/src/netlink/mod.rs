//! Netlink protocol plumbing: wire framing, typed message parsers, the
//! kernel subscription adapter and the classifier attach helpers.

pub mod attr;
pub mod builder;
pub mod classifier;
pub mod message;
pub mod messages;
pub mod parse;
pub mod socket;
pub mod subscription;
pub mod types;

pub use attr::{AttrIter, NlAttr};
pub use builder::{MessageBuilder, NestToken};
pub use message::{MessageIter, NLMSG_HDRLEN, NlMsgHdr, NlMsgType};
pub use socket::{NetlinkSocket, rtnetlink_groups};
pub use subscription::{AddrCmd, Command, FdbCmd, LinkCmd, NeighCmd, Subscription};
