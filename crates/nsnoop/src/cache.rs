//! Topology cache.
//!
//! A multi-index in-memory graph of links, networks, their edges, bridge
//! FDB entries and cached neighbors, reconciled against kernel state by
//! the subscription adapter. Entities live in arenas keyed by stable ids;
//! cross-references are ids, never pointers, and cascade deletes are
//! index-driven.
//!
//! Two correlation paths drive the index layout: capture records carry
//! `(network_id, vlan_id)` and resolve through the vlan/network index;
//! subscription address events carry `(address, ifindex)` and resolve
//! through the address/ifindex index.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, warn};

use crate::bpf::{PrefixKey, PrefixTable};
use crate::error::{Error, Result};
use crate::netlink::subscription::{AddrCmd, FdbCmd, LinkCmd, NeighCmd};
use crate::timer::TimerId;
use crate::util;

/// Stable id of a link-network edge.
pub type LinkNetworkId = u64;

/// Creation, update and reference timestamps kept on every entity.
#[derive(Debug, Clone, Copy)]
pub struct EntryTimes {
    pub created: SystemTime,
    pub updated: SystemTime,
    pub referenced: SystemTime,
}

impl EntryTimes {
    fn now() -> Self {
        let now = SystemTime::now();
        Self {
            created: now,
            updated: now,
            referenced: now,
        }
    }
}

/// A kernel network interface.
#[derive(Debug)]
pub struct Link {
    pub ifindex: u32,
    pub name: String,
    pub mac: [u8; 6],
    pub kind: String,
    pub slave_kind: String,
    pub vlan_id: u16,
    pub vlan_protocol: u16,
    pub has_vlan: bool,
    pub is_macvlan: bool,
    /// Parent equals the monitored interface.
    pub is_svi: bool,
    /// Matched the operator's deny filter.
    pub ignore_link: bool,
    pub parent_ifindex: u32,
    pub times: EntryTimes,
    pub reference_count: u64,
    link_networks: Vec<LinkNetworkId>,
    fdb_keys: Vec<FdbKey>,
}

/// A CIDR prefix reachable via one or more SVI links.
#[derive(Debug)]
pub struct Network {
    /// Join key with the in-kernel prefix table.
    pub id: u32,
    pub address: Ipv6Addr,
    /// Prefix length on the 128-bit scale (IPv4: 96 + p).
    pub prefix_len: u32,
    /// Family-native prefix length.
    pub true_prefix_len: u8,
    pub text: String,
    /// Number of link-networks pointing here.
    pub refcnt: u32,
    pub times: EntryTimes,
    link_networks: Vec<LinkNetworkId>,
}

/// The edge between a Link and a Network, carrying the host IP used on
/// that edge. Key material is stored verbatim so removal never needs the
/// referenced entities.
#[derive(Debug, Clone)]
pub struct LinkNetwork {
    pub id: LinkNetworkId,
    pub link_ifindex: u32,
    pub network_id: u32,
    pub vlan_id: u16,
    pub network_addr: Ipv6Addr,
    /// Host IP on this link; probes originate from it.
    pub ip: Ipv6Addr,
}

/// Key of a bridge FDB entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdbKey {
    pub mac: [u8; 6],
    pub ifindex: u32,
    pub vlan_id: u16,
}

impl FdbKey {
    pub fn new(mac: [u8; 6], ifindex: u32, vlan_id: u16) -> Self {
        Self {
            mac,
            ifindex,
            vlan_id,
        }
    }
}

/// A locally present (MAC, port, VLAN) triple. Pure suppression set: a
/// capture record matching an entry here was learned externally.
#[derive(Debug)]
pub struct FdbEntry {
    pub key: FdbKey,
    pub times: EntryTimes,
    pub reference_count: u64,
}

/// Key of a cached neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NeighKey {
    pub ifindex: u32,
    pub ip: Ipv6Addr,
}

/// A learned endpoint the kernel holds a neighbor entry for.
#[derive(Debug)]
pub struct Neighbor {
    pub key: NeighKey,
    pub mac: [u8; 6],
    pub nud_state: u16,
    /// The edge whose link and host IP originate probes for this entry.
    pub sending_link_network: LinkNetworkId,
    /// Live probe timer, at most one.
    pub timer: Option<TimerId>,
    pub times: EntryTimes,
    pub update_count: u64,
    pub id: u64,
}

/// Timers that must be cancelled after a cascade delete.
#[derive(Debug, Default)]
pub struct CancelledTimers(pub Vec<TimerId>);

/// The cache proper.
#[derive(Debug, Default)]
pub struct Cache {
    links: HashMap<u32, Link>,
    networks: HashMap<u32, Network>,
    network_by_addr: HashMap<Ipv6Addr, u32>,
    link_networks: HashMap<LinkNetworkId, LinkNetwork>,
    ln_by_vlan_network: HashMap<(u32, u16), LinkNetworkId>,
    ln_by_addr_ifindex: HashMap<(Ipv6Addr, u32), LinkNetworkId>,
    fdb: HashMap<FdbKey, FdbEntry>,
    neighbors: HashMap<NeighKey, Neighbor>,
    next_network_id: u32,
    next_link_network_id: LinkNetworkId,
    next_neigh_id: u64,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            next_network_id: 1,
            next_link_network_id: 1,
            next_neigh_id: 1,
            ..Self::default()
        }
    }

    // ========================================================================
    // Links
    // ========================================================================

    /// Insert a new link. The caller decides `is_svi` and `ignore_link`
    /// afterwards; both default to false.
    pub fn add_link(&mut self, cmd: &LinkCmd) -> &mut Link {
        let link = Link {
            ifindex: cmd.ifindex,
            name: cmd.name.clone(),
            mac: cmd.mac,
            kind: cmd.kind.clone(),
            slave_kind: cmd.slave_kind.clone(),
            vlan_id: cmd.vlan_id,
            vlan_protocol: cmd.vlan_protocol,
            has_vlan: cmd.has_vlan,
            is_macvlan: cmd.is_macvlan,
            is_svi: false,
            ignore_link: false,
            parent_ifindex: cmd.parent_ifindex,
            times: EntryTimes::now(),
            reference_count: 0,
            link_networks: Vec::new(),
            fdb_keys: Vec::new(),
        };
        self.links.entry(cmd.ifindex).insert_entry(link).into_mut()
    }

    /// Overwrite the mutable fields of a cached link. The update timestamp
    /// moves only when at least one field differed.
    pub fn update_link(&mut self, cmd: &LinkCmd) -> bool {
        let Some(link) = self.links.get_mut(&cmd.ifindex) else {
            return false;
        };
        let mut updated = false;

        if link.parent_ifindex != cmd.parent_ifindex {
            debug!(
                "link {}: parent {} -> {}",
                link.name, link.parent_ifindex, cmd.parent_ifindex
            );
            link.parent_ifindex = cmd.parent_ifindex;
            updated = true;
        }
        if link.name != cmd.name {
            debug!("link {}: renamed to {}", link.name, cmd.name);
            link.name = cmd.name.clone();
            updated = true;
        }
        if link.mac != cmd.mac {
            debug!("link {}: MAC changed to {}", link.name, util::format_mac(&cmd.mac));
            link.mac = cmd.mac;
            updated = true;
        }
        if link.kind != cmd.kind {
            debug!("link {}: kind {} -> {}", link.name, link.kind, cmd.kind);
            link.kind = cmd.kind.clone();
            updated = true;
        }
        if link.slave_kind != cmd.slave_kind {
            debug!(
                "link {}: slave kind {} -> {}",
                link.name, link.slave_kind, cmd.slave_kind
            );
            link.slave_kind = cmd.slave_kind.clone();
            updated = true;
        }
        if link.vlan_protocol != cmd.vlan_protocol {
            debug!(
                "link {}: vlan protocol {:#06x} -> {:#06x}",
                link.name, link.vlan_protocol, cmd.vlan_protocol
            );
            link.vlan_protocol = cmd.vlan_protocol;
            updated = true;
        }
        if link.vlan_id != cmd.vlan_id {
            debug!("link {}: vlan {} -> {}", link.name, link.vlan_id, cmd.vlan_id);
            link.vlan_id = cmd.vlan_id;
            updated = true;
        }
        if link.has_vlan != cmd.has_vlan {
            link.has_vlan = cmd.has_vlan;
            updated = true;
        }
        if link.is_macvlan != cmd.is_macvlan {
            link.is_macvlan = cmd.is_macvlan;
            updated = true;
        }

        if updated {
            link.times.updated = SystemTime::now();
        }
        updated
    }

    /// Look up a link, bumping its reference counter and timestamp.
    pub fn get_link(&mut self, ifindex: u32) -> Option<&Link> {
        let link = self.links.get_mut(&ifindex)?;
        link.reference_count += 1;
        link.times.referenced = SystemTime::now();
        Some(link)
    }

    /// Look up a link without reference accounting.
    pub fn link(&self, ifindex: u32) -> Option<&Link> {
        self.links.get(&ifindex)
    }

    /// Mutable link access for flag updates.
    pub fn link_mut(&mut self, ifindex: u32) -> Option<&mut Link> {
        self.links.get_mut(&ifindex)
    }

    /// Delete a link, cascading over its link-networks, FDB entries and
    /// neighbors. Unknown links are not an error. Returns the probe
    /// timers the caller must cancel, or None when nothing was removed.
    pub fn del_link(&mut self, ifindex: u32) -> Option<CancelledTimers> {
        let link = self.links.remove(&ifindex)?;

        for id in link.link_networks.clone() {
            self.remove_link_network(id);
        }
        for key in &link.fdb_keys {
            self.fdb.remove(key);
        }

        let neigh_keys: Vec<NeighKey> = self
            .neighbors
            .keys()
            .filter(|key| key.ifindex == ifindex)
            .copied()
            .collect();
        let mut cancelled = CancelledTimers::default();
        for key in neigh_keys {
            if let Some(neigh) = self.neighbors.remove(&key) {
                cancelled.0.extend(neigh.timer);
            }
        }
        Some(cancelled)
    }

    // ========================================================================
    // Networks and link-networks
    // ========================================================================

    /// Create a network from an address event, together with its initial
    /// link-network and the kernel prefix-table entry. Any failure
    /// reverses all partial effects.
    pub fn add_network(&mut self, cmd: &AddrCmd, table: &mut dyn PrefixTable) -> Result<u32> {
        if !self.links.contains_key(&cmd.ifindex) {
            return Err(Error::LinkNotCached {
                ifindex: cmd.ifindex,
            });
        }
        if let Some(&existing) = self.network_by_addr.get(&cmd.network) {
            // The address index is ifindex-independent; one address cannot
            // name two different networks.
            let existing_prefix_len = self.networks[&existing].prefix_len;
            return Err(Error::DuplicateNetwork {
                address: cmd.network,
                existing_prefix_len,
            });
        }

        let id = self.next_network_id;
        self.next_network_id += 1;

        let network = Network {
            id,
            address: cmd.network,
            prefix_len: cmd.prefix_len,
            true_prefix_len: cmd.true_prefix_len,
            text: util::format_cidr(&cmd.network, cmd.true_prefix_len),
            refcnt: 0,
            times: EntryTimes::now(),
            link_networks: Vec::new(),
        };
        self.networks.insert(id, network);
        self.network_by_addr.insert(cmd.network, id);

        let link_network = match self.add_link_network(cmd.ifindex, id, cmd.ip) {
            Ok(link_network) => link_network,
            Err(e) => {
                self.network_by_addr.remove(&cmd.network);
                self.networks.remove(&id);
                return Err(e);
            }
        };

        let key = PrefixKey::new(cmd.prefix_len, &cmd.network);
        if let Err(e) = table.insert(key, id) {
            self.remove_link_network(link_network);
            self.network_by_addr.remove(&cmd.network);
            self.networks.remove(&id);
            return Err(e);
        }

        Ok(id)
    }

    /// Bind an existing network to a link (second and later SVIs).
    pub fn add_link_network(
        &mut self,
        ifindex: u32,
        network_id: u32,
        host_ip: Ipv6Addr,
    ) -> Result<LinkNetworkId> {
        if !self.networks.contains_key(&network_id) {
            return Err(Error::NetworkNotCached { id: network_id });
        }
        let Some(link) = self.links.get_mut(&ifindex) else {
            return Err(Error::LinkNotCached { ifindex });
        };
        let vlan_id = link.vlan_id;
        let id = self.next_link_network_id;
        self.next_link_network_id += 1;
        link.link_networks.push(id);

        let network = self.networks.get_mut(&network_id).unwrap();
        network.link_networks.push(id);
        network.refcnt += 1;
        let network_addr = network.address;

        self.ln_by_vlan_network.insert((network_id, vlan_id), id);
        self.ln_by_addr_ifindex.insert((network_addr, ifindex), id);
        self.link_networks.insert(
            id,
            LinkNetwork {
                id,
                link_ifindex: ifindex,
                network_id,
                vlan_id,
                network_addr,
                ip: host_ip,
            },
        );
        Ok(id)
    }

    /// Remove one link-network edge and its index entries, dropping the
    /// network's refcount. Tolerates entities already removed upstream of
    /// a cascade.
    fn remove_link_network(&mut self, id: LinkNetworkId) {
        let Some(ln) = self.link_networks.remove(&id) else {
            return;
        };
        self.ln_by_vlan_network.remove(&(ln.network_id, ln.vlan_id));
        self.ln_by_addr_ifindex
            .remove(&(ln.network_addr, ln.link_ifindex));

        if let Some(network) = self.networks.get_mut(&ln.network_id) {
            network.link_networks.retain(|x| *x != id);
            network.refcnt = network.refcnt.saturating_sub(1);
        }
        if let Some(link) = self.links.get_mut(&ln.link_ifindex) {
            link.link_networks.retain(|x| *x != id);
        }
    }

    /// Delete the network an address event names, located via the link's
    /// link-network list by (network address, prefix length). Absence is
    /// not an error.
    pub fn del_network(&mut self, cmd: &AddrCmd, table: &mut dyn PrefixTable) -> Option<u32> {
        let link = self.links.get(&cmd.ifindex)?;

        let network_id = link.link_networks.iter().find_map(|id| {
            let ln = self.link_networks.get(id)?;
            let network = self.networks.get(&ln.network_id)?;
            (network.address == cmd.network && network.prefix_len == cmd.prefix_len)
                .then_some(network.id)
        })?;

        let edges = self.networks[&network_id].link_networks.clone();
        for id in edges {
            self.remove_link_network(id);
        }

        let network = self.networks.remove(&network_id)?;
        self.network_by_addr.remove(&network.address);

        let key = PrefixKey::new(network.prefix_len, &network.address);
        if let Err(e) = table.remove(&key) {
            warn!("prefix table delete for {} failed: {e}", network.text);
        }

        Some(network_id)
    }

    /// Look up a network by address alone.
    pub fn network_by_addr(&self, addr: &Ipv6Addr) -> Option<&Network> {
        let id = self.network_by_addr.get(addr)?;
        self.networks.get(id)
    }

    /// Look up a network by id, bumping its reference timestamp.
    pub fn get_network_by_id(&mut self, id: u32) -> Option<&Network> {
        let network = self.networks.get_mut(&id)?;
        network.times.referenced = SystemTime::now();
        Some(network)
    }

    /// Resolve a capture record's (network_id, vlan_id) to its edge.
    pub fn link_network_by_reply(&self, network_id: u32, vlan_id: u16) -> Option<&LinkNetwork> {
        let id = self.ln_by_vlan_network.get(&(network_id, vlan_id))?;
        self.link_networks.get(id)
    }

    /// Resolve an address event's (network address, ifindex) to its edge.
    pub fn link_network_by_key(&self, network: &Ipv6Addr, ifindex: u32) -> Option<&LinkNetwork> {
        let id = self.ln_by_addr_ifindex.get(&(*network, ifindex))?;
        self.link_networks.get(id)
    }

    /// Find the edge of `ifindex` whose network contains `ip`.
    pub fn link_network_by_addr(&self, ifindex: u32, ip: &Ipv6Addr) -> Option<&LinkNetwork> {
        let link = self.links.get(&ifindex)?;
        link.link_networks.iter().find_map(|id| {
            let ln = self.link_networks.get(id)?;
            let network = self.networks.get(&ln.network_id)?;
            (util::network_of(ip, network.prefix_len) == network.address).then_some(ln)
        })
    }

    /// Access an edge by id.
    pub fn link_network(&self, id: LinkNetworkId) -> Option<&LinkNetwork> {
        self.link_networks.get(&id)
    }

    // ========================================================================
    // FDB
    // ========================================================================

    /// Insert an FDB entry; requires its link to be cached.
    pub fn add_fdb(&mut self, cmd: &FdbCmd) -> Result<()> {
        let Some(link) = self.links.get_mut(&cmd.ifindex) else {
            return Err(Error::LinkNotCached {
                ifindex: cmd.ifindex,
            });
        };
        let key = FdbKey::new(cmd.mac, cmd.ifindex, cmd.vlan_id);
        if self.fdb.contains_key(&key) {
            return Ok(());
        }
        link.fdb_keys.push(key);
        self.fdb.insert(
            key,
            FdbEntry {
                key,
                times: EntryTimes::now(),
                reference_count: 0,
            },
        );
        Ok(())
    }

    /// Look up an FDB entry, bumping reference accounting.
    pub fn get_fdb(&mut self, key: &FdbKey) -> Option<&FdbEntry> {
        let entry = self.fdb.get_mut(key)?;
        entry.reference_count += 1;
        entry.times.referenced = SystemTime::now();
        Some(entry)
    }

    /// Remove an FDB entry. Absence is not an error.
    pub fn del_fdb(&mut self, key: &FdbKey) -> bool {
        if self.fdb.remove(key).is_none() {
            return false;
        }
        if let Some(link) = self.links.get_mut(&key.ifindex) {
            link.fdb_keys.retain(|k| k != key);
        }
        true
    }

    // ========================================================================
    // Neighbors
    // ========================================================================

    /// Insert a neighbor learned through `link_network`.
    pub fn add_neigh(&mut self, link_network: LinkNetworkId, cmd: &NeighCmd) -> &mut Neighbor {
        let key = NeighKey {
            ifindex: cmd.ifindex,
            ip: cmd.ip,
        };
        let id = self.next_neigh_id;
        self.next_neigh_id += 1;
        let neigh = Neighbor {
            key,
            mac: cmd.mac,
            nud_state: cmd.nud_state,
            sending_link_network: link_network,
            timer: None,
            times: EntryTimes::now(),
            update_count: 0,
            id,
        };
        self.neighbors.entry(key).insert_entry(neigh).into_mut()
    }

    /// Apply a neighbor event to a cached entry. The MAC updates
    /// silently; a NUD state change moves the update timestamp and the
    /// update counter. Returns None when the neighbor is not cached.
    pub fn update_neigh(&mut self, cmd: &NeighCmd) -> Option<bool> {
        let key = NeighKey {
            ifindex: cmd.ifindex,
            ip: cmd.ip,
        };
        let neigh = self.neighbors.get_mut(&key)?;

        if neigh.mac != cmd.mac {
            neigh.mac = cmd.mac;
        }

        if neigh.nud_state != cmd.nud_state {
            neigh.nud_state = cmd.nud_state;
            let now = SystemTime::now();
            neigh.times.updated = now;
            neigh.times.referenced = now;
            neigh.update_count += 1;
            return Some(true);
        }
        Some(false)
    }

    /// Look up a neighbor, bumping its reference timestamp.
    pub fn get_neigh_mut(&mut self, key: &NeighKey) -> Option<&mut Neighbor> {
        let neigh = self.neighbors.get_mut(key)?;
        neigh.times.referenced = SystemTime::now();
        Some(neigh)
    }

    /// Remove a neighbor, returning it so the caller can cancel its timer.
    pub fn del_neigh(&mut self, key: &NeighKey) -> Option<Neighbor> {
        self.neighbors.remove(key)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn links_len(&self) -> usize {
        self.links.len()
    }

    pub fn networks_len(&self) -> usize {
        self.networks.len()
    }

    pub fn link_networks_len(&self) -> usize {
        self.link_networks.len()
    }

    pub fn fdb_len(&self) -> usize {
        self.fdb.len()
    }

    pub fn neighbors_len(&self) -> usize {
        self.neighbors.len()
    }

    /// Remove everything, cascading link by link. The key set is
    /// snapshotted first; the cascade mutates the table being walked.
    pub fn clear(&mut self) -> CancelledTimers {
        let ifindexes: Vec<u32> = self.links.keys().copied().collect();
        let mut cancelled = CancelledTimers::default();
        for ifindex in ifindexes {
            if let Some(mut timers) = self.del_link(ifindex) {
                cancelled.0.append(&mut timers.0);
            }
        }
        self.networks.clear();
        self.network_by_addr.clear();
        self.neighbors.clear();
        cancelled
    }

    /// Serializable snapshot for the statistics exporter.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            links: self
                .links
                .values()
                .map(|link| LinkSnapshot {
                    ifindex: link.ifindex,
                    name: link.name.clone(),
                    mac: util::format_mac(&link.mac),
                    kind: link.kind.clone(),
                    vlan_id: link.vlan_id,
                    is_svi: link.is_svi,
                    ignore_link: link.ignore_link,
                    networks: link.link_networks.len(),
                })
                .collect(),
            networks: self
                .networks
                .values()
                .map(|network| NetworkSnapshot {
                    id: network.id,
                    network: network.text.clone(),
                    refcnt: network.refcnt,
                })
                .collect(),
            neighbors: self
                .neighbors
                .values()
                .map(|neigh| NeighborSnapshot {
                    ifindex: neigh.key.ifindex,
                    ip: util::format_ip(&neigh.key.ip),
                    mac: util::format_mac(&neigh.mac),
                    nud_state: crate::netlink::types::nud_state_name(neigh.nud_state).to_string(),
                    update_count: neigh.update_count,
                    timer_armed: neigh.timer.is_some(),
                })
                .collect(),
            fdb_entries: self.fdb.len(),
            link_networks: self.link_networks.len(),
        }
    }
}

/// Cache snapshot served over the statistics socket.
#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub links: Vec<LinkSnapshot>,
    pub networks: Vec<NetworkSnapshot>,
    pub neighbors: Vec<NeighborSnapshot>,
    pub fdb_entries: usize,
    pub link_networks: usize,
}

#[derive(Debug, Serialize)]
pub struct LinkSnapshot {
    pub ifindex: u32,
    pub name: String,
    pub mac: String,
    pub kind: String,
    pub vlan_id: u16,
    pub is_svi: bool,
    pub ignore_link: bool,
    pub networks: usize,
}

#[derive(Debug, Serialize)]
pub struct NetworkSnapshot {
    pub id: u32,
    pub network: String,
    pub refcnt: u32,
}

#[derive(Debug, Serialize)]
pub struct NeighborSnapshot {
    pub ifindex: u32,
    pub ip: String,
    pub mac: String,
    pub nud_state: String,
    pub update_count: u64,
    pub timer_armed: bool,
}

#[cfg(test)]
impl Cache {
    /// Assert every structural invariant of the index design.
    pub fn assert_consistent(&self) {
        for network in self.networks.values() {
            assert_eq!(
                network.refcnt as usize,
                network.link_networks.len(),
                "network {} refcnt vs edge list",
                network.id
            );
            let pointing = self
                .link_networks
                .values()
                .filter(|ln| ln.network_id == network.id)
                .count();
            assert_eq!(network.refcnt as usize, pointing, "network {} refcnt", network.id);
        }

        for ln in self.link_networks.values() {
            assert_eq!(
                self.ln_by_vlan_network.get(&(ln.network_id, ln.vlan_id)),
                Some(&ln.id),
                "vlan/network index for edge {}",
                ln.id
            );
            assert_eq!(
                self.ln_by_addr_ifindex
                    .get(&(ln.network_addr, ln.link_ifindex)),
                Some(&ln.id),
                "addr/ifindex index for edge {}",
                ln.id
            );
        }
        assert_eq!(self.ln_by_vlan_network.len(), self.link_networks.len());
        assert_eq!(self.ln_by_addr_ifindex.len(), self.link_networks.len());

        for neigh in self.neighbors.values() {
            if let Some(ln) = self.link_networks.get(&neigh.sending_link_network) {
                assert_eq!(
                    ln.link_ifindex, neigh.key.ifindex,
                    "neighbor {} sending link agreement",
                    neigh.id
                );
            }
        }
    }

    /// Check that `table` is exactly the projection of the network set.
    pub fn assert_prefix_projection(&self, table: &crate::bpf::MemoryPrefixTable) {
        assert_eq!(table.len(), self.networks.len());
        for network in self.networks.values() {
            let key = PrefixKey::new(network.prefix_len, &network.address);
            assert_eq!(table.get(&key), Some(network.id), "projection of {}", network.text);
        }
    }
}
