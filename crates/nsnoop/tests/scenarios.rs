//! End-to-end scenarios over the public API.
//!
//! These drive the cache, reply pipeline and timer wheel the way the
//! event loop does, simulating the kernel side (subscription commands in,
//! the multicast echo of a neighbor install back) without any sockets.

use std::net::Ipv6Addr;
use std::time::Duration;

use nsnoop::bpf::MemoryPrefixTable;
use nsnoop::cache::{Cache, Link, NeighKey};
use nsnoop::capture::CaptureRecord;
use nsnoop::netlink::subscription::{AddrCmd, FdbCmd, LinkCmd, NeighCmd};
use nsnoop::netlink::types::nud;
use nsnoop::pipeline::{self, InstallRequest};
use nsnoop::timer::TimerWheel;
use nsnoop::util;

const ENDPOINT_MAC: [u8; 6] = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];

fn svi_link_cmd() -> LinkCmd {
    LinkCmd {
        ifindex: 10,
        parent_ifindex: 2,
        name: "svi10".into(),
        mac: [0x02, 0, 0, 0, 0, 0x0a],
        kind: "vlan".into(),
        slave_kind: String::new(),
        vlan_id: 10,
        vlan_protocol: 0x8100,
        has_vlan: true,
        is_macvlan: false,
    }
}

fn addr_cmd(ifindex: u32, ip: &str, prefix: u8) -> AddrCmd {
    let ip = util::canonical_ip(ip.parse().unwrap());
    let is_v4 = util::mapped_v4(&ip).is_some();
    let prefix_len = util::advertised_prefix_len(is_v4, prefix);
    AddrCmd {
        ifindex,
        ip,
        network: util::network_of(&ip, prefix_len),
        prefix_len,
        true_prefix_len: prefix,
    }
}

fn capture(vlan: u16, network_id: u32, ip: &str) -> CaptureRecord {
    let ip: Ipv6Addr = util::canonical_ip(ip.parse().unwrap());
    let family = if util::mapped_v4(&ip).is_some() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    } as u8;
    CaptureRecord::new(family, vlan, network_id, ENDPOINT_MAC, ip)
}

fn fixed_delay() -> impl FnMut(&Link, bool) -> Option<Duration> {
    |_: &Link, _: bool| Some(Duration::from_secs(8))
}

/// Cold start: one SVI, one address, one reply. The reply requests an
/// install; the kernel echo creates the neighbor; the echo's REACHABLE
/// state arms a probe timer.
#[test]
fn test_cold_start_single_reply() {
    let mut cache = Cache::new();
    let mut table = MemoryPrefixTable::new();
    let mut wheel = TimerWheel::new();

    // Subscription dump: link, then address.
    cache.add_link(&svi_link_cmd());
    cache.add_network(&addr_cmd(10, "10.0.0.1", 24), &mut table).unwrap();

    // Capture record arrives.
    let install = pipeline::handle_reply(
        &mut cache,
        &mut wheel,
        &capture(10, 1, "10.0.0.7"),
        &mut fixed_delay(),
    )
    .expect("correlated reply must request an install");
    assert_eq!(
        install,
        InstallRequest {
            ifindex: 10,
            ip: util::canonical_ip("10.0.0.7".parse().unwrap()),
            mac: ENDPOINT_MAC,
        }
    );

    // Kernel echo: RTM_NEWNEIGH reachable. The loop would resolve the
    // link-network and add the neighbor.
    let ip = util::canonical_ip("10.0.0.7".parse().unwrap());
    let link_network = cache.link_network_by_addr(10, &ip).unwrap().id;
    let neigh = cache.add_neigh(
        link_network,
        &NeighCmd {
            ifindex: 10,
            ip,
            mac: ENDPOINT_MAC,
            nud_state: nud::REACHABLE,
            externally_learned: false,
        },
    );
    let key = neigh.key;
    assert_eq!(neigh.nud_state, nud::REACHABLE);

    // The follow-up capture record restarts the (now existing) entry's
    // probe clock.
    let deadline_before = wheel.next_deadline();
    assert!(deadline_before.is_none());
    pipeline::handle_reply(
        &mut cache,
        &mut wheel,
        &capture(10, 1, "10.0.0.7"),
        &mut fixed_delay(),
    )
    .unwrap();
    assert_eq!(wheel.armed_len(), 1);

    let timer = cache.get_neigh_mut(&key).unwrap().timer.unwrap();
    assert!(wheel.is_armed(timer));
}

/// FDB suppression: a reply whose (MAC, ifindex, vlan) is in the FDB is
/// externally learned; no install, no neighbor.
#[test]
fn test_fdb_suppression() {
    let mut cache = Cache::new();
    let mut table = MemoryPrefixTable::new();
    let mut wheel = TimerWheel::new();

    cache.add_link(&svi_link_cmd());
    cache.add_network(&addr_cmd(10, "10.0.0.1", 24), &mut table).unwrap();
    cache
        .add_fdb(&FdbCmd {
            ifindex: 10,
            mac: ENDPOINT_MAC,
            vlan_id: 10,
            externally_learned: true,
        })
        .unwrap();

    let install = pipeline::handle_reply(
        &mut cache,
        &mut wheel,
        &capture(10, 1, "10.0.0.7"),
        &mut fixed_delay(),
    );
    assert!(install.is_none());
    assert_eq!(cache.neighbors_len(), 0);
    assert_eq!(wheel.armed_len(), 0);
}

/// A second SVI with an address in the same prefix shares the Network;
/// replies on both VLANs correlate.
#[test]
fn test_two_svis_one_network() {
    let mut cache = Cache::new();
    let mut table = MemoryPrefixTable::new();
    let mut wheel = TimerWheel::new();

    cache.add_link(&svi_link_cmd());
    let mut second = svi_link_cmd();
    second.ifindex = 11;
    second.name = "svi11".into();
    second.vlan_id = 11;
    cache.add_link(&second);

    let network_id = cache
        .add_network(&addr_cmd(10, "10.0.0.1", 24), &mut table)
        .unwrap();
    let second_addr = addr_cmd(11, "10.0.0.2", 24);
    cache
        .add_link_network(11, network_id, second_addr.ip)
        .unwrap();

    for (vlan, ifindex) in [(10u16, 10u32), (11, 11)] {
        let install = pipeline::handle_reply(
            &mut cache,
            &mut wheel,
            &capture(vlan, network_id, "10.0.0.7"),
            &mut fixed_delay(),
        )
        .unwrap();
        assert_eq!(install.ifindex, ifindex);
    }
}

/// Address removal after the network was learned restores the pre-add
/// state, including the kernel prefix table projection.
#[test]
fn test_network_lifecycle_round_trip() {
    let mut cache = Cache::new();
    let mut table = MemoryPrefixTable::new();

    cache.add_link(&svi_link_cmd());
    let cmd = addr_cmd(10, "2001:db8::1", 64);
    cache.add_network(&cmd, &mut table).unwrap();
    assert_eq!(table.len(), 1);
    assert_eq!(cache.networks_len(), 1);

    assert!(cache.del_network(&cmd, &mut table).is_some());
    assert_eq!(table.len(), 0);
    assert_eq!(cache.networks_len(), 0);
    assert_eq!(cache.link_networks_len(), 0);

    // Removing again is a no-op.
    assert!(cache.del_network(&cmd, &mut table).is_none());
}

/// Neighbor deletion drops the timer; a timer firing for a deleted
/// neighbor must find nothing.
#[test]
fn test_neighbor_delete_cancels_probe() {
    let mut cache = Cache::new();
    let mut table = MemoryPrefixTable::new();
    let mut wheel = TimerWheel::new();

    cache.add_link(&svi_link_cmd());
    cache.add_network(&addr_cmd(10, "10.0.0.1", 24), &mut table).unwrap();

    let ip = util::canonical_ip("10.0.0.7".parse().unwrap());
    let link_network = cache.link_network_by_addr(10, &ip).unwrap().id;
    let neigh = cache.add_neigh(
        link_network,
        &NeighCmd {
            ifindex: 10,
            ip,
            mac: ENDPOINT_MAC,
            nud_state: nud::REACHABLE,
            externally_learned: false,
        },
    );
    let key = neigh.key;
    let timer = wheel.arm(tokio::time::Instant::now(), key);
    neigh.timer = Some(timer);

    let removed = cache.del_neigh(&key).unwrap();
    wheel.cancel(removed.timer.unwrap());

    assert_eq!(wheel.armed_len(), 0);
    assert!(
        wheel
            .pop_due(tokio::time::Instant::now() + Duration::from_secs(1))
            .is_none()
    );
}

/// The deny filter flags links but does not suppress capture-driven
/// installs on them; only the flag is affected.
#[test]
fn test_deny_filter_flags_but_does_not_suppress() {
    let mut cache = Cache::new();
    let mut table = MemoryPrefixTable::new();
    let mut wheel = TimerWheel::new();

    cache.add_link(&svi_link_cmd());
    cache.link_mut(10).unwrap().ignore_link = true;
    cache.add_network(&addr_cmd(10, "10.0.0.1", 24), &mut table).unwrap();

    let install = pipeline::handle_reply(
        &mut cache,
        &mut wheel,
        &capture(10, 1, "10.0.0.7"),
        &mut fixed_delay(),
    );
    assert!(install.is_some());
}

/// A neighbor whose sending link-network disappeared cannot be probed,
/// but its cache entry survives until the kernel deletes it.
#[test]
fn test_probe_source_resolution_after_network_removal() {
    let mut cache = Cache::new();
    let mut table = MemoryPrefixTable::new();

    cache.add_link(&svi_link_cmd());
    let cmd = addr_cmd(10, "10.0.0.1", 24);
    cache.add_network(&cmd, &mut table).unwrap();

    let ip = util::canonical_ip("10.0.0.7".parse().unwrap());
    let link_network = cache.link_network_by_addr(10, &ip).unwrap().id;
    cache.add_neigh(
        link_network,
        &NeighCmd {
            ifindex: 10,
            ip,
            mac: ENDPOINT_MAC,
            nud_state: nud::REACHABLE,
            externally_learned: false,
        },
    );

    cache.del_network(&cmd, &mut table);

    let key = NeighKey { ifindex: 10, ip };
    let neigh = cache.get_neigh_mut(&key).unwrap();
    let stale_edge = neigh.sending_link_network;
    assert!(cache.link_network(stale_edge).is_none());
    assert_eq!(cache.neighbors_len(), 1);
}
