//! Attach the in-kernel ARP/NA classifier to the monitored interface.
//!
//! The classifier program itself is an external collaborator: it is
//! expected pre-loaded and pinned in bpffs (see [`crate::bpf`]). This
//! module only wires its fd to the interface, either as a direct-action
//! `bpf` filter on the `clsact` ingress hook or as the link's XDP program.

use std::os::unix::io::RawFd;

use tracing::{debug, warn};

use crate::error::Result;
use crate::netlink::builder::MessageBuilder;
use crate::netlink::message::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE, NLM_F_REQUEST, NlMsgType,
};
use crate::netlink::socket::NetlinkSocket;
use crate::netlink::types::{IfInfoMsg, TcMsg};

const TCA_KIND: u16 = 1;
const TCA_OPTIONS: u16 = 2;

const TCA_BPF_FD: u16 = 6;
const TCA_BPF_NAME: u16 = 7;
const TCA_BPF_FLAGS: u16 = 8;
const TCA_BPF_FLAG_ACT_DIRECT: u32 = 1;

/// clsact qdisc handle and its ingress hook.
const TC_H_CLSACT: u32 = 0xFFFF_FFF1;
const TC_H_CLSACT_HANDLE: u32 = 0xFFFF_0000;
const TC_H_CLSACT_INGRESS: u32 = TC_H_CLSACT_HANDLE | 0xFFF2;

/// Filter priority/handle claimed by this daemon.
const FILTER_PRIORITY: u32 = 1;
const FILTER_HANDLE: u32 = 1;
const ETH_P_ALL: u16 = 0x0003;

const IFLA_XDP: u16 = 43;
const IFLA_XDP_FD: u16 = 1;
const IFLA_XDP_FLAGS: u16 = 3;
const XDP_FLAGS_UPDATE_IF_NOEXIST: u32 = 1;

/// Filter info field: priority in the high 16 bits, protocol (network
/// order) in the low 16.
fn filter_info(priority: u32) -> u32 {
    (priority << 16) | u32::from(ETH_P_ALL.to_be())
}

/// Attach the classifier on the TC ingress hook.
///
/// An existing filter at our priority is replaced unless `exclusive` is
/// set, in which case the attach fails with EEXIST.
pub async fn attach_tc(ifindex: u32, prog_fd: RawFd, exclusive: bool) -> Result<()> {
    let socket = NetlinkSocket::new()?;

    // The clsact qdisc may already exist; other tooling creates it too.
    let mut builder = MessageBuilder::new(
        NlMsgType::RTM_NEWQDISC,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE,
    );
    let mut tcm = TcMsg::new();
    tcm.tcm_ifindex = ifindex as i32;
    tcm.tcm_handle = TC_H_CLSACT_HANDLE;
    tcm.tcm_parent = TC_H_CLSACT;
    builder.append(&tcm);
    builder.append_attr_str(TCA_KIND, "clsact");
    if let Err(e) = socket.request_ack(builder).await {
        if !e.is_already_exists() {
            return Err(e);
        }
        debug!("clsact qdisc already present on ifindex {ifindex}");
    }

    let create = if exclusive {
        NLM_F_CREATE | NLM_F_EXCL
    } else {
        NLM_F_CREATE | NLM_F_REPLACE
    };
    let mut builder = MessageBuilder::new(NlMsgType::RTM_NEWTFILTER, NLM_F_REQUEST | NLM_F_ACK | create);
    let mut tcm = TcMsg::new();
    tcm.tcm_ifindex = ifindex as i32;
    tcm.tcm_handle = FILTER_HANDLE;
    tcm.tcm_parent = TC_H_CLSACT_INGRESS;
    tcm.tcm_info = filter_info(FILTER_PRIORITY);
    builder.append(&tcm);
    builder.append_attr_str(TCA_KIND, "bpf");
    let options = builder.nest_start(TCA_OPTIONS);
    builder.append_attr_u32(TCA_BPF_FD, prog_fd as u32);
    builder.append_attr_str(TCA_BPF_NAME, "nsnoopd");
    builder.append_attr_u32(TCA_BPF_FLAGS, TCA_BPF_FLAG_ACT_DIRECT);
    builder.nest_end(options);

    socket.request_ack(builder).await
}

/// Remove the daemon's ingress filter. The clsact qdisc is left in place:
/// it may predate us and may carry filters that are not ours.
pub async fn detach_tc(ifindex: u32) {
    let socket = match NetlinkSocket::new() {
        Ok(socket) => socket,
        Err(e) => {
            warn!("cannot open socket for classifier detach: {e}");
            return;
        }
    };

    let mut builder = MessageBuilder::new(NlMsgType::RTM_DELTFILTER, NLM_F_REQUEST | NLM_F_ACK);
    let mut tcm = TcMsg::new();
    tcm.tcm_ifindex = ifindex as i32;
    tcm.tcm_handle = FILTER_HANDLE;
    tcm.tcm_parent = TC_H_CLSACT_INGRESS;
    tcm.tcm_info = filter_info(FILTER_PRIORITY);
    builder.append(&tcm);
    builder.append_attr_str(TCA_KIND, "bpf");

    if let Err(e) = socket.request_ack(builder).await {
        if !e.is_not_found() {
            warn!("failed to detach ingress classifier: {e}");
        }
    }
}

/// Set the classifier as the link's XDP program.
pub async fn attach_xdp(ifindex: u32, prog_fd: RawFd, exclusive: bool) -> Result<()> {
    let socket = NetlinkSocket::new()?;
    set_xdp_fd(&socket, ifindex, prog_fd, exclusive).await
}

/// Clear the link's XDP program.
pub async fn detach_xdp(ifindex: u32) {
    let socket = match NetlinkSocket::new() {
        Ok(socket) => socket,
        Err(e) => {
            warn!("cannot open socket for XDP detach: {e}");
            return;
        }
    };
    if let Err(e) = set_xdp_fd(&socket, ifindex, -1, false).await {
        warn!("failed to detach XDP classifier: {e}");
    }
}

async fn set_xdp_fd(
    socket: &NetlinkSocket,
    ifindex: u32,
    prog_fd: RawFd,
    exclusive: bool,
) -> Result<()> {
    let mut builder = MessageBuilder::new(NlMsgType::RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
    let mut hdr = IfInfoMsg::new();
    hdr.ifi_index = ifindex as i32;
    builder.append(&hdr);

    let xdp = builder.nest_start(IFLA_XDP);
    builder.append_attr(IFLA_XDP_FD, &prog_fd.to_ne_bytes());
    if exclusive {
        builder.append_attr_u32(IFLA_XDP_FLAGS, XDP_FLAGS_UPDATE_IF_NOEXIST);
    }
    builder.nest_end(xdp);

    socket.request_ack(builder).await
}
