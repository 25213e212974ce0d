//! Kernel subscription adapter.
//!
//! Owns the NETLINK_ROUTE socket that is subscribed to link, address and
//! neighbor multicast groups, translates raw messages into the typed
//! [`Command`] union, performs the ordered startup dumps, and builds the
//! outbound neighbor-install requests for the TX queue.

use std::collections::VecDeque;
use std::net::Ipv6Addr;

use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::netlink::builder::MessageBuilder;
use crate::netlink::message::{
    MessageIter, NLM_F_CREATE, NLM_F_DUMP, NLM_F_REPLACE, NLM_F_REQUEST, NlMsgError, NlMsgType,
};
use crate::netlink::messages::{AddressMessage, LinkMessage, NeighborMessage};
use crate::netlink::socket::{NetlinkSocket, rtnetlink_groups::*};
use crate::netlink::types::{AF_BRIDGE, AF_INET, AF_INET6, AF_UNSPEC, IfAddrMsg, IfInfoMsg, NdMsg, nud};
use crate::util;

/// A parsed link event.
#[derive(Debug, Clone, Default)]
pub struct LinkCmd {
    pub ifindex: u32,
    /// Parent device index (IFLA_LINK); the SVI test compares this against
    /// the monitored interface.
    pub parent_ifindex: u32,
    pub name: String,
    pub mac: [u8; 6],
    pub kind: String,
    pub slave_kind: String,
    pub vlan_id: u16,
    pub vlan_protocol: u16,
    pub has_vlan: bool,
    pub is_macvlan: bool,
}

/// A parsed address event. Addresses are canonicalized to the cache's
/// IPv6 representation and carry both prefix-length scales.
#[derive(Debug, Clone)]
pub struct AddrCmd {
    pub ifindex: u32,
    /// Host address on the link.
    pub ip: Ipv6Addr,
    /// Masked network address.
    pub network: Ipv6Addr,
    /// Prefix length on the 128-bit scale (IPv4: 96 + p).
    pub prefix_len: u32,
    /// Family-native prefix length.
    pub true_prefix_len: u8,
}

/// A parsed neighbor-table event.
#[derive(Debug, Clone)]
pub struct NeighCmd {
    pub ifindex: u32,
    pub ip: Ipv6Addr,
    pub mac: [u8; 6],
    pub nud_state: u16,
    pub externally_learned: bool,
}

/// A parsed bridge FDB event.
#[derive(Debug, Clone)]
pub struct FdbCmd {
    pub ifindex: u32,
    pub mac: [u8; 6],
    pub vlan_id: u16,
    pub externally_learned: bool,
}

/// Typed command union produced by the subscription adapter.
#[derive(Debug, Clone)]
pub enum Command {
    LinkAdd(LinkCmd),
    LinkDel(LinkCmd),
    AddrAdd(AddrCmd),
    AddrDel(AddrCmd),
    NeighAdd(NeighCmd),
    NeighDel(NeighCmd),
    FdbAdd(FdbCmd),
    FdbDel(FdbCmd),
}

/// The subscribed NETLINK_ROUTE socket plus translation logic.
pub struct Subscription {
    socket: NetlinkSocket,
}

impl Subscription {
    /// Open the socket and join the link, address and neighbor groups.
    pub fn new() -> Result<Self> {
        let mut socket = NetlinkSocket::new()?;
        socket.subscribe(RTNLGRP_LINK)?;
        socket.subscribe(RTNLGRP_IPV4_IFADDR)?;
        socket.subscribe(RTNLGRP_IPV6_IFADDR)?;
        socket.subscribe(RTNLGRP_NEIGH)?;
        Ok(Self { socket })
    }

    /// Access the underlying socket.
    pub fn socket(&self) -> &NetlinkSocket {
        &self.socket
    }

    /// Receive all queued buffers (waiting for the first).
    pub async fn recv_burst(&self) -> Result<Vec<Vec<u8>>> {
        self.socket.recv_burst().await
    }

    /// Send at most one queued outbound message.
    pub async fn send_next(&self, queue: &mut VecDeque<Vec<u8>>) -> Result<()> {
        self.socket.send_next(queue).await
    }

    /// Translate one receive buffer into commands, appending to `out`.
    pub fn translate_buffer(&self, buf: &[u8], out: &mut VecDeque<Command>) {
        for result in MessageIter::new(buf) {
            let (header, payload) = match result {
                Ok(parts) => parts,
                Err(e) => {
                    debug!("skipping malformed netlink message: {e}");
                    break;
                }
            };
            if header.is_error() {
                self.log_kernel_reply(payload);
                continue;
            }
            if let Some(cmd) = translate(header.nlmsg_type, payload) {
                out.push_back(cmd);
            }
        }
    }

    /// An ERROR message on the subscription socket is the kernel's answer
    /// to an earlier neighbor install; a refusal is logged and the entry
    /// will be retried on the next capture record.
    fn log_kernel_reply(&self, payload: &[u8]) {
        match NlMsgError::from_bytes(payload) {
            Ok(err) if err.is_ack() => trace!("kernel ack seq {}", err.msg.nlmsg_seq),
            Ok(err) => warn!(
                errno = -err.error,
                "kernel refused neighbor install (seq {})", err.msg.nlmsg_seq
            ),
            Err(e) => debug!("unparseable kernel error message: {e}"),
        }
    }

    /// Dump all links. First phase of initialization.
    pub async fn dump_links(&self) -> Result<Vec<Command>> {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_GETLINK, NLM_F_REQUEST | NLM_F_DUMP);
        builder.append(&IfInfoMsg::new());
        self.dump(builder).await
    }

    /// Dump all addresses. Second phase.
    pub async fn dump_addresses(&self) -> Result<Vec<Command>> {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_GETADDR, NLM_F_REQUEST | NLM_F_DUMP);
        builder.append(&IfAddrMsg::new());
        self.dump(builder).await
    }

    /// Dump the bridge FDB. Third phase.
    pub async fn dump_fdb(&self) -> Result<Vec<Command>> {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_GETNEIGH, NLM_F_REQUEST | NLM_F_DUMP);
        builder.append(&NdMsg::new().with_family(AF_BRIDGE));
        self.dump(builder).await
    }

    /// Dump the neighbor tables. Fourth and final phase.
    pub async fn dump_neighbors(&self) -> Result<Vec<Command>> {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_GETNEIGH, NLM_F_REQUEST | NLM_F_DUMP);
        builder.append(&NdMsg::new().with_family(AF_UNSPEC));
        self.dump(builder).await
    }

    /// Run one dump request to completion. Multicast events interleaved
    /// with the dump replies are translated as well, so nothing observed
    /// during initialization is lost.
    async fn dump(&self, mut builder: MessageBuilder) -> Result<Vec<Command>> {
        let seq = self.socket.next_seq();
        builder.set_seq(seq);
        builder.set_pid(self.socket.pid());
        self.socket.send(&builder.finish()).await?;

        let mut cmds = VecDeque::new();
        'outer: loop {
            let buf = self.socket.recv().await?;
            for result in MessageIter::new(&buf) {
                let (header, payload) = result?;
                if header.is_error() {
                    let err = NlMsgError::from_bytes(payload)?;
                    if !err.is_ack() {
                        return Err(crate::error::Error::from_errno(err.error));
                    }
                    continue;
                }
                if header.nlmsg_seq == seq && header.is_done() {
                    break 'outer;
                }
                if let Some(cmd) = translate(header.nlmsg_type, payload) {
                    cmds.push_back(cmd);
                }
            }
        }
        Ok(cmds.into())
    }

    /// Build the outbound "neighbor reachable" request for a learned
    /// endpoint. The kernel's multicast echo of the resulting state change
    /// is what creates or refreshes the cache entry.
    pub fn build_reachable_neigh(&self, ifindex: u32, ip: &Ipv6Addr, mac: &[u8; 6]) -> Vec<u8> {
        let mut builder = MessageBuilder::new(
            NlMsgType::RTM_NEWNEIGH,
            NLM_F_REQUEST | NLM_F_CREATE | NLM_F_REPLACE,
        );

        let family = if util::mapped_v4(ip).is_some() {
            AF_INET
        } else {
            AF_INET6
        };
        let ndmsg = NdMsg::new()
            .with_family(family)
            .with_ifindex(ifindex as i32)
            .with_state(nud::REACHABLE);
        builder.append(&ndmsg);

        match util::mapped_v4(ip) {
            Some(v4) => builder.append_attr(NDA_DST, &v4.octets()),
            None => builder.append_attr(NDA_DST, &ip.octets()),
        }
        builder.append_attr(NDA_LLADDR, mac);

        builder.set_seq(self.socket.next_seq());
        builder.set_pid(self.socket.pid());
        builder.finish()
    }
}

const NDA_DST: u16 = 1;
const NDA_LLADDR: u16 = 2;

/// Translate one message into a command, if it is one we act on.
fn translate(msg_type: u16, payload: &[u8]) -> Option<Command> {
    match msg_type {
        NlMsgType::RTM_NEWLINK => link_cmd(payload).map(Command::LinkAdd),
        NlMsgType::RTM_DELLINK => link_cmd(payload).map(Command::LinkDel),
        NlMsgType::RTM_NEWADDR => addr_cmd(payload).map(Command::AddrAdd),
        NlMsgType::RTM_DELADDR => addr_cmd(payload).map(Command::AddrDel),
        NlMsgType::RTM_NEWNEIGH => neigh_or_fdb(payload, true),
        NlMsgType::RTM_DELNEIGH => neigh_or_fdb(payload, false),
        _ => None,
    }
}

fn link_cmd(payload: &[u8]) -> Option<LinkCmd> {
    let msg = match LinkMessage::from_bytes(payload) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("dropping link event: {e}");
            return None;
        }
    };

    let is_macvlan = matches!(msg.kind.as_deref(), Some("macvlan" | "macvtap"));
    Some(LinkCmd {
        ifindex: msg.ifindex(),
        parent_ifindex: msg.link.unwrap_or(0),
        name: msg.name.clone().unwrap_or_default(),
        mac: msg.mac().unwrap_or_default(),
        kind: msg.kind.clone().unwrap_or_default(),
        slave_kind: msg.slave_kind.clone().unwrap_or_default(),
        vlan_id: msg.vlan_id.unwrap_or(0),
        vlan_protocol: msg.vlan_protocol.unwrap_or(0),
        has_vlan: msg.vlan_id.is_some(),
        is_macvlan,
    })
}

fn addr_cmd(payload: &[u8]) -> Option<AddrCmd> {
    let msg = match AddressMessage::from_bytes(payload) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("dropping address event: {e}");
            return None;
        }
    };

    let ip = util::canonical_ip(*msg.primary_address()?);
    let prefix_len = util::advertised_prefix_len(msg.is_ipv4(), msg.prefix_len());
    Some(AddrCmd {
        ifindex: msg.ifindex(),
        ip,
        network: util::network_of(&ip, prefix_len),
        prefix_len,
        true_prefix_len: msg.prefix_len(),
    })
}

fn neigh_or_fdb(payload: &[u8], add: bool) -> Option<Command> {
    let msg = match NeighborMessage::from_bytes(payload) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("dropping neighbor event: {e}");
            return None;
        }
    };

    if msg.is_fdb() {
        let cmd = FdbCmd {
            ifindex: msg.ifindex(),
            mac: msg.mac()?,
            vlan_id: msg.vlan.unwrap_or(0),
            externally_learned: msg.is_externally_learned(),
        };
        return Some(if add {
            Command::FdbAdd(cmd)
        } else {
            Command::FdbDel(cmd)
        });
    }

    let cmd = NeighCmd {
        ifindex: msg.ifindex(),
        ip: util::canonical_ip(*msg.destination.as_ref()?),
        mac: msg.mac().unwrap_or_default(),
        nud_state: msg.header.ndm_state,
        externally_learned: msg.is_externally_learned(),
    };
    Some(if add {
        Command::NeighAdd(cmd)
    } else {
        Command::NeighDel(cmd)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::message::NLMSG_HDRLEN;

    fn payload_of(builder: MessageBuilder) -> Vec<u8> {
        builder.finish()[NLMSG_HDRLEN..].to_vec()
    }

    #[test]
    fn test_translate_addr_add_v4() {
        let mut b = MessageBuilder::new(NlMsgType::RTM_NEWADDR, 0);
        b.append(&IfAddrMsg {
            ifa_family: AF_INET,
            ifa_prefixlen: 24,
            ifa_flags: 0,
            ifa_scope: 0,
            ifa_index: 10,
        });
        b.append_attr(NDA_DST, &[10, 0, 0, 1]); // IFA_ADDRESS shares id 1

        let cmd = translate(NlMsgType::RTM_NEWADDR, &payload_of(b));
        let Some(Command::AddrAdd(cmd)) = cmd else {
            panic!("expected AddrAdd, got {cmd:?}");
        };
        assert_eq!(cmd.ifindex, 10);
        assert_eq!(cmd.prefix_len, 120);
        assert_eq!(cmd.true_prefix_len, 24);
        assert_eq!(cmd.ip, util::canonical_ip("10.0.0.1".parse().unwrap()));
        assert_eq!(cmd.network, util::canonical_ip("10.0.0.0".parse().unwrap()));
    }

    #[test]
    fn test_translate_bridge_neigh_to_fdb() {
        let mut b = MessageBuilder::new(NlMsgType::RTM_NEWNEIGH, 0);
        b.append(&NdMsg::new().with_family(AF_BRIDGE).with_ifindex(3));
        b.append_attr(NDA_LLADDR, &[1, 2, 3, 4, 5, 6]);

        let cmd = translate(NlMsgType::RTM_NEWNEIGH, &payload_of(b));
        assert!(matches!(cmd, Some(Command::FdbAdd(ref f)) if f.mac == [1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn test_translate_neigh_without_destination_dropped() {
        let mut b = MessageBuilder::new(NlMsgType::RTM_NEWNEIGH, 0);
        b.append(&NdMsg::new().with_family(AF_INET).with_ifindex(3));
        assert!(translate(NlMsgType::RTM_NEWNEIGH, &payload_of(b)).is_none());
    }

    #[tokio::test]
    async fn test_build_reachable_neigh_v4_family() {
        let sub = match Subscription::new() {
            Ok(sub) => sub,
            // Building messages needs no privileges, but opening a netlink
            // socket can fail in minimal sandboxes; skip there.
            Err(_) => return,
        };
        let ip = util::canonical_ip("10.0.0.7".parse().unwrap());
        let msg = sub.build_reachable_neigh(10, &ip, &[0, 1, 2, 3, 4, 5]);

        let (header, payload) = MessageIter::new(&msg).next().unwrap().unwrap();
        assert_eq!(header.nlmsg_type, NlMsgType::RTM_NEWNEIGH);
        assert_eq!(
            header.nlmsg_flags,
            NLM_F_REQUEST | NLM_F_CREATE | NLM_F_REPLACE
        );
        let ndmsg = NdMsg::from_bytes(payload).unwrap();
        assert_eq!(ndmsg.ndm_family, AF_INET);
        assert_eq!(ndmsg.ndm_state, nud::REACHABLE);
        assert_eq!(ndmsg.ndm_ifindex, 10);
    }
}
