//! Neighbor-reply pipeline.
//!
//! Turns one capture record into a decision: correlate it against the
//! topology cache, suppress externally learned endpoints, restart the
//! probe clock of an already-cached neighbor, and request the kernel
//! install. The kernel's multicast echo of the install is what later
//! creates or refreshes the cache entry, closing the loop.

use std::net::Ipv6Addr;
use std::time::Duration;

use tracing::debug;

use crate::cache::{Cache, FdbKey, Link, NeighKey};
use crate::capture::CaptureRecord;
use crate::timer::TimerWheel;
use crate::util;

/// An install the loop must enqueue to the kernel subscription TX queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub ifindex: u32,
    pub ip: Ipv6Addr,
    pub mac: [u8; 6],
}

/// Process one capture record.
///
/// `delay_for` supplies the probe delay for a neighbor on the given link
/// (reading the kernel's reachable-time tunable in production). When it
/// returns None the old timer stays cancelled and nothing is re-armed;
/// the next observation or neighbor update will try again.
pub fn handle_reply(
    cache: &mut Cache,
    wheel: &mut TimerWheel,
    record: &CaptureRecord,
    delay_for: &mut dyn FnMut(&Link, bool) -> Option<Duration>,
) -> Option<InstallRequest> {
    let Some(link_network) = cache.link_network_by_reply(record.network_id, record.vlan_id) else {
        debug!(
            "no SVI for network {} vlan {}; dropping reply",
            record.network_id, record.vlan_id
        );
        return None;
    };
    let ifindex = link_network.link_ifindex;

    let fdb_key = FdbKey::new(record.mac, ifindex, record.vlan_id);
    if cache.get_fdb(&fdb_key).is_some() {
        debug!(
            "reply from {} on ifindex {ifindex} is externally learned; skipping",
            util::format_mac(&record.mac)
        );
        return None;
    }

    let ip = record.ip();
    debug!(
        "reply: ip {} mac {} ifindex {ifindex}",
        util::format_ip(&ip),
        util::format_mac(&record.mac)
    );

    let key = NeighKey { ifindex, ip };
    let is_ipv4 = util::mapped_v4(&ip).is_some();
    let cached = cache.get_neigh_mut(&key).is_some();
    let delay = if cached {
        let link = cache.link(ifindex)?;
        delay_for(link, is_ipv4)
    } else {
        None
    };
    if let Some(neigh) = cache.get_neigh_mut(&key) {
        // A fresh observation restarts the probe clock.
        if let Some(timer) = neigh.timer.take() {
            wheel.cancel(timer);
        }
        if let Some(delay) = delay {
            let deadline = tokio::time::Instant::now() + delay;
            neigh.timer = Some(wheel.arm(deadline, key));
        }
    }

    Some(InstallRequest {
        ifindex,
        ip,
        mac: record.mac,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::MemoryPrefixTable;
    use crate::netlink::subscription::{AddrCmd, FdbCmd, LinkCmd, NeighCmd};

    fn fixed_delay() -> impl FnMut(&Link, bool) -> Option<Duration> {
        |_link: &Link, _v4: bool| Some(Duration::from_secs(10))
    }

    fn cache_with_svi() -> (Cache, MemoryPrefixTable) {
        let mut cache = Cache::new();
        let mut table = MemoryPrefixTable::new();
        cache.add_link(&LinkCmd {
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
        });
        let ip = util::canonical_ip("10.0.0.1".parse().unwrap());
        cache
            .add_network(
                &AddrCmd {
                    ifindex: 10,
                    ip,
                    network: util::network_of(&ip, 120),
                    prefix_len: 120,
                    true_prefix_len: 24,
                },
                &mut table,
            )
            .unwrap();
        (cache, table)
    }

    fn record(vlan: u16, network_id: u32, mac: [u8; 6], ip: &str) -> CaptureRecord {
        let ip = util::canonical_ip(ip.parse().unwrap());
        let family = if util::mapped_v4(&ip).is_some() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        } as u8;
        CaptureRecord::new(family, vlan, network_id, mac, ip)
    }

    const MAC: [u8; 6] = [0, 0x11, 0x22, 0x33, 0x44, 0x55];

    #[test]
    fn test_correlated_reply_requests_install() {
        let (mut cache, _table) = cache_with_svi();
        let mut wheel = TimerWheel::new();

        let install = handle_reply(
            &mut cache,
            &mut wheel,
            &record(10, 1, MAC, "10.0.0.7"),
            &mut fixed_delay(),
        )
        .unwrap();

        assert_eq!(
            install,
            InstallRequest {
                ifindex: 10,
                ip: util::canonical_ip("10.0.0.7".parse().unwrap()),
                mac: MAC,
            }
        );
        // No cached neighbor yet: the kernel echo creates it, no timer.
        assert_eq!(wheel.armed_len(), 0);
    }

    #[test]
    fn test_unknown_network_vlan_drops_without_mutation() {
        let (mut cache, _table) = cache_with_svi();
        let mut wheel = TimerWheel::new();

        let before = (cache.neighbors_len(), cache.fdb_len());
        assert!(
            handle_reply(
                &mut cache,
                &mut wheel,
                &record(99, 1, MAC, "10.0.0.7"),
                &mut fixed_delay(),
            )
            .is_none()
        );
        assert!(
            handle_reply(
                &mut cache,
                &mut wheel,
                &record(10, 42, MAC, "10.0.0.7"),
                &mut fixed_delay(),
            )
            .is_none()
        );
        assert_eq!(before, (cache.neighbors_len(), cache.fdb_len()));
        assert_eq!(wheel.armed_len(), 0);
    }

    #[test]
    fn test_fdb_hit_suppresses_install() {
        let (mut cache, _table) = cache_with_svi();
        let mut wheel = TimerWheel::new();
        cache
            .add_fdb(&FdbCmd {
                ifindex: 10,
                mac: MAC,
                vlan_id: 10,
                externally_learned: true,
            })
            .unwrap();

        assert!(
            handle_reply(
                &mut cache,
                &mut wheel,
                &record(10, 1, MAC, "10.0.0.7"),
                &mut fixed_delay(),
            )
            .is_none()
        );
        assert_eq!(cache.neighbors_len(), 0);
    }

    #[test]
    fn test_cached_neighbor_timer_restarts() {
        let (mut cache, _table) = cache_with_svi();
        let mut wheel = TimerWheel::new();

        let ip = util::canonical_ip("10.0.0.7".parse().unwrap());
        let ln = cache.link_network_by_reply(1, 10).unwrap().id;
        let key = NeighKey { ifindex: 10, ip };
        let old_timer = wheel.arm(tokio::time::Instant::now(), key);
        let neigh = cache.add_neigh(
            ln,
            &NeighCmd {
                ifindex: 10,
                ip,
                mac: MAC,
                nud_state: 0x02,
                externally_learned: false,
            },
        );
        neigh.timer = Some(old_timer);

        let install = handle_reply(
            &mut cache,
            &mut wheel,
            &record(10, 1, MAC, "10.0.0.7"),
            &mut fixed_delay(),
        );
        assert!(install.is_some());

        // Old timer cancelled, exactly one fresh timer armed.
        assert!(!wheel.is_armed(old_timer));
        assert_eq!(wheel.armed_len(), 1);
        let new_timer = cache.get_neigh_mut(&key).unwrap().timer.unwrap();
        assert_ne!(new_timer, old_timer);
        assert!(wheel.is_armed(new_timer));
    }

    #[test]
    fn test_unreadable_tunable_leaves_no_timer() {
        let (mut cache, _table) = cache_with_svi();
        let mut wheel = TimerWheel::new();

        let ip = util::canonical_ip("10.0.0.7".parse().unwrap());
        let ln = cache.link_network_by_reply(1, 10).unwrap().id;
        let key = NeighKey { ifindex: 10, ip };
        let old_timer = wheel.arm(tokio::time::Instant::now(), key);
        cache
            .add_neigh(
                ln,
                &NeighCmd {
                    ifindex: 10,
                    ip,
                    mac: MAC,
                    nud_state: 0x02,
                    externally_learned: false,
                },
            )
            .timer = Some(old_timer);

        let mut no_delay = |_: &Link, _: bool| None;
        let install = handle_reply(
            &mut cache,
            &mut wheel,
            &record(10, 1, MAC, "10.0.0.7"),
            &mut no_delay,
        );
        assert!(install.is_some());
        assert_eq!(wheel.armed_len(), 0);
        assert_eq!(cache.get_neigh_mut(&key).unwrap().timer, None);
    }
}
