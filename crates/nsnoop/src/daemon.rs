//! Daemon bootstrap and the event loop.
//!
//! Single-threaded cooperative scheduling: one `biased` select is the
//! sole multiplexer, and its arm order is the event priority. Within a
//! wakeup, the subscription FIFO is dispatched to completion before
//! capture records are correlated, so a capture racing an address-add
//! always sees the post-add cache; at most one outbound kernel command
//! leaves per tick.

use std::collections::VecDeque;
use std::os::fd::AsRawFd;

use tokio::signal::unix::{SignalKind, signal};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bpf::{self, BpfPrefixTable, PrefixTable};
use crate::cache::{Cache, FdbKey, Link, NeighKey};
use crate::capture::{CaptureRecord, CaptureRing};
use crate::config::Config;
use crate::error::Result;
use crate::netlink::classifier;
use crate::netlink::subscription::{AddrCmd, Command, FdbCmd, LinkCmd, NeighCmd, Subscription};
use crate::netlink::types::nud;
use crate::pipeline;
use crate::probe::ProbeSocket;
use crate::stats::{StatsClient, StatsServer};
use crate::timer::{self, TimerWheel};
use crate::util;

/// Everything the loop owns. Initialized once at startup, torn down in
/// reverse on exit.
pub struct Daemon {
    config: Config,
    cache: Cache,
    prefix_table: Box<dyn PrefixTable>,
    sub: Subscription,
    capture: CaptureRing,
    probe: ProbeSocket,
    wheel: TimerWheel,
    txq: VecDeque<Vec<u8>>,
    fifo: VecDeque<Command>,
    stats: StatsServer,
    stats_client: Option<StatsClient>,
    remaining: Option<u64>,
    has_links: bool,
    has_networks: bool,
    has_fdb: bool,
}

impl Daemon {
    /// Set up every component and run the initial kernel sync.
    ///
    /// Order matters: the probe socket and cache first, then the
    /// subscription (so no event is lost while attaching), then the
    /// classifier and its ring, then the statistics endpoint.
    pub async fn new(config: Config) -> Result<Self> {
        let probe = ProbeSocket::new()?;
        let cache = Cache::new();
        let prefix_table = Box::new(BpfPrefixTable::open()?);
        let sub = Subscription::new()?;

        let prog_pin = if config.use_xdp {
            bpf::PIN_PROG_XDP
        } else {
            bpf::PIN_PROG_TC
        };
        let prog = bpf::obj_get(&bpf::pin_path(prog_pin))?;
        if config.use_xdp {
            classifier::attach_xdp(
                config.ifindex_mon,
                prog.as_raw_fd(),
                config.keep_existing_filter,
            )
            .await?;
        } else {
            classifier::attach_tc(
                config.ifindex_mon,
                prog.as_raw_fd(),
                config.keep_existing_filter,
            )
            .await?;
        }

        let ring = bpf::obj_get(&bpf::pin_path(bpf::PIN_MAP_RING))?;
        let capture = CaptureRing::new(ring)?;
        let stats = StatsServer::bind()?;

        let remaining = config.count;
        let mut daemon = Self {
            config,
            cache,
            prefix_table,
            sub,
            capture,
            probe,
            wheel: TimerWheel::new(),
            txq: VecDeque::new(),
            fifo: VecDeque::new(),
            stats,
            stats_client: None,
            remaining,
            has_links: false,
            has_networks: false,
            has_fdb: false,
        };
        daemon.initial_sync().await?;
        Ok(daemon)
    }

    /// Synchronous startup dumps, in dependency order. The gate flags
    /// keep dependent events parked until their prerequisites exist.
    async fn initial_sync(&mut self) -> Result<()> {
        for cmd in self.sub.dump_links().await? {
            self.apply(cmd);
        }
        self.has_links = true;

        for cmd in self.sub.dump_addresses().await? {
            self.apply(cmd);
        }
        self.has_networks = true;

        for cmd in self.sub.dump_fdb().await? {
            self.apply(cmd);
        }
        self.has_fdb = true;

        for cmd in self.sub.dump_neighbors().await? {
            self.apply(cmd);
        }
        Ok(())
    }

    /// The event loop. Returns on SIGINT/SIGTERM, when the `--count`
    /// limit is spent, or on a fatal socket error.
    pub async fn run(&mut self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut last_round = false;

        loop {
            if self.remaining == Some(0) {
                // One more full pass after the count hits zero.
                if last_round {
                    break;
                }
                last_round = true;
            }

            let deadline = self.wheel.next_deadline();
            let tx_pending = !self.txq.is_empty();

            tokio::select! {
                biased;

                _ = sigint.recv() => {
                    info!("received SIGINT, exiting");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, exiting");
                    break;
                }
                _ = sleep_until_opt(deadline) => {
                    self.fire_due_timers();
                }
                result = self.sub.recv_burst() => {
                    self.handle_subscription(result?);
                }
                result = self.capture.next_burst(self.config.family) => {
                    self.handle_capture(result?);
                }
                result = self.sub.send_next(&mut self.txq), if tx_pending => {
                    result?;
                }
                result = self.stats.accept(), if self.stats_client.is_none() => {
                    self.accept_stats(result);
                }
                _ = client_writable(&self.stats_client) => {
                    self.serve_stats();
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    // ========================================================================
    // Timers and probes
    // ========================================================================

    /// Fire every due timer: one gratuitous probe each, handle cleared,
    /// no re-arm (the kernel's neighbor update re-arms via the pipeline).
    /// Timers of deleted neighbors are dropped silently.
    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some((timer, key)) = self.wheel.pop_due(now) {
            let Some(neigh) = self.cache.get_neigh_mut(&key) else {
                continue;
            };
            if neigh.timer != Some(timer) {
                continue;
            }
            neigh.timer = None;
            self.send_probe_for(&key);
        }
    }

    /// Emit one gratuitous probe for a cached neighbor.
    fn send_probe_for(&mut self, key: &NeighKey) {
        let Some(neigh) = self.cache.get_neigh_mut(key) else {
            return;
        };
        let mac = neigh.mac;
        let link_network = neigh.sending_link_network;

        let Some(ln) = self.cache.link_network(link_network) else {
            debug!(
                "probe for {} skipped: its network is gone",
                util::format_ip(&key.ip)
            );
            return;
        };
        let src_ip = ln.ip;
        let ifindex = ln.link_ifindex;
        let Some(link) = self.cache.link(ifindex) else {
            return;
        };

        if let Err(e) = self
            .probe
            .send_gratuitous(&link.mac, ifindex, &src_ip, &mac, &key.ip)
        {
            warn!("probe for {} failed: {e}", util::format_ip(&key.ip));
        }
    }

    /// Arm the probe timer for a neighbor, replacing any existing one.
    fn arm_probe_timer(&mut self, key: &NeighKey) {
        let is_ipv4 = util::mapped_v4(&key.ip).is_some();
        let Some(neigh) = self.cache.get_neigh_mut(key) else {
            return;
        };
        let link_network = neigh.sending_link_network;
        let Some(ln) = self.cache.link_network(link_network) else {
            return;
        };
        let Some(link) = self.cache.link(ln.link_ifindex) else {
            return;
        };

        let delay = match timer::probe_delay(&link.name, is_ipv4) {
            Ok(delay) => delay,
            Err(e) => {
                warn!(
                    "cannot schedule probe for {}: {e}",
                    util::format_ip(&key.ip)
                );
                return;
            }
        };

        let id = self.wheel.arm(Instant::now() + delay, *key);
        if let Some(neigh) = self.cache.get_neigh_mut(key) {
            if let Some(old) = neigh.timer.take() {
                self.wheel.cancel(old);
            }
            neigh.timer = Some(id);
        }
        debug!(
            "probe for {} scheduled in {delay:?}",
            util::format_ip(&key.ip)
        );
    }

    // ========================================================================
    // Subscription events
    // ========================================================================

    fn handle_subscription(&mut self, bufs: Vec<Vec<u8>>) {
        for buf in &bufs {
            self.sub.translate_buffer(buf, &mut self.fifo);
        }
        while let Some(cmd) = self.fifo.pop_front() {
            self.apply(cmd);
        }
    }

    fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::LinkAdd(cmd) => self.handle_link_add(&cmd),
            Command::LinkDel(cmd) => self.handle_link_del(&cmd),
            Command::AddrAdd(cmd) => self.handle_addr_add(&cmd),
            Command::AddrDel(cmd) => self.handle_addr_del(&cmd),
            Command::NeighAdd(cmd) => self.handle_neigh_add(&cmd),
            Command::NeighDel(cmd) => self.handle_neigh_del(&cmd),
            Command::FdbAdd(cmd) => self.handle_fdb_add(&cmd),
            Command::FdbDel(cmd) => self.handle_fdb_del(&cmd),
        }
    }

    fn handle_link_add(&mut self, cmd: &LinkCmd) {
        if self.cache.link(cmd.ifindex).is_some() {
            debug!("link {} ({}) already cached", cmd.ifindex, cmd.name);
            self.cache.update_link(cmd);
            return;
        }

        let is_svi = cmd.parent_ifindex == self.config.ifindex_mon;
        let denied = self.config.is_denied(&cmd.name);

        let link = self.cache.add_link(cmd);
        link.is_svi = is_svi;
        if denied {
            debug!("link {} matches deny filter", cmd.name);
            link.ignore_link = true;
        }

        if is_svi {
            info!("cache: added NIC {} with vlan {}", cmd.name, cmd.vlan_id);
        } else {
            debug!("cache: added NIC {} with vlan {}", cmd.name, cmd.vlan_id);
        }
    }

    fn handle_link_del(&mut self, cmd: &LinkCmd) {
        let Some(link) = self.cache.link(cmd.ifindex) else {
            debug!("link {} not cached, nothing to remove", cmd.name);
            return;
        };
        let name = link.name.clone();
        if let Some(cancelled) = self.cache.del_link(cmd.ifindex) {
            for timer in cancelled.0 {
                self.wheel.cancel(timer);
            }
            info!("cache: removed link {name}");
        }
    }

    fn handle_addr_add(&mut self, cmd: &AddrCmd) {
        if !self.has_links {
            return;
        }
        if !self.config.learn_link_local && util::is_link_local(&cmd.ip) {
            return;
        }

        let Some(link) = self.cache.get_link(cmd.ifindex) else {
            debug!("address-add on unknown ifindex {}", cmd.ifindex);
            return;
        };
        if !link.is_svi {
            debug!("link {} is not an SVI connected to the bridge", link.name);
            return;
        }
        let link_name = link.name.clone();
        let cidr = util::format_cidr(&cmd.network, cmd.true_prefix_len);

        let existing = self
            .cache
            .network_by_addr(&cmd.network)
            .map(|network| (network.id, network.prefix_len, network.text.clone()));
        let network_id = match existing {
            Some((_, prefix_len, text)) if prefix_len != cmd.prefix_len => {
                // One address cannot name two distinct networks.
                warn!("address {cidr} conflicts with cached network {text}; dropped");
                return;
            }
            Some((id, _, _)) => id,
            None => match self.cache.add_network(cmd, self.prefix_table.as_mut()) {
                Ok(id) => {
                    info!("cache: added network({id}) {cidr} with link {link_name}");
                    id
                }
                Err(e) => {
                    warn!("failed to add network {cidr}: {e}");
                    return;
                }
            },
        };

        // Second and later SVIs bind to the shared network.
        if self.cache.link_network_by_key(&cmd.network, cmd.ifindex).is_none() {
            match self.cache.add_link_network(cmd.ifindex, network_id, cmd.ip) {
                Ok(_) => info!("cache: network {cidr} bound to link {link_name}"),
                Err(e) => warn!("failed to bind {cidr} to {link_name}: {e}"),
            }
        }
    }

    fn handle_addr_del(&mut self, cmd: &AddrCmd) {
        let Some(network) = self.cache.network_by_addr(&cmd.network) else {
            debug!(
                "network {} not cached, nothing to remove",
                util::format_cidr(&cmd.network, cmd.true_prefix_len)
            );
            return;
        };
        let text = network.text.clone();
        if self.cache.del_network(cmd, self.prefix_table.as_mut()).is_some() {
            info!("cache: removed network {text}");
        }
    }

    fn handle_neigh_add(&mut self, cmd: &NeighCmd) {
        // Park neighbor events until links, networks and fdb are in.
        if !(self.has_links && self.has_networks && self.has_fdb) {
            return;
        }
        if cmd.ifindex == 0 {
            return;
        }
        // Incomplete entries have no MAC yet.
        if cmd.mac == [0u8; 6] {
            return;
        }
        if cmd.externally_learned {
            debug!(
                "neighbor {} is externally learned",
                util::format_ip(&cmd.ip)
            );
            return;
        }

        if self.cache.get_link(cmd.ifindex).is_none() {
            debug!("neighbor event on unknown ifindex {}", cmd.ifindex);
            return;
        }

        // Only endpoints inside a target network are interesting.
        let Some(ln) = self.cache.link_network_by_addr(cmd.ifindex, &cmd.ip) else {
            return;
        };
        let link_network = ln.id;

        let key = NeighKey {
            ifindex: cmd.ifindex,
            ip: cmd.ip,
        };
        if self.cache.get_neigh_mut(&key).is_some() {
            self.cache.update_neigh(cmd);
        } else {
            self.cache.add_neigh(link_network, cmd);
            info!(
                "neighbor {} {} added to cache",
                util::format_ip(&cmd.ip),
                util::format_mac(&cmd.mac)
            );
        }

        let Some(neigh) = self.cache.get_neigh_mut(&key) else {
            return;
        };
        let nud_state = neigh.nud_state;
        let has_timer = neigh.timer.is_some();

        if nud_state == nud::REACHABLE && !has_timer {
            self.arm_probe_timer(&key);
        } else if nud_state == nud::REACHABLE {
            debug!("neighbor {} already has a timer", util::format_ip(&key.ip));
        }

        // A stale entry gets probed right away to confirm the endpoint.
        if nud_state == nud::STALE {
            self.send_probe_for(&key);
        }
    }

    fn handle_neigh_del(&mut self, cmd: &NeighCmd) {
        let key = NeighKey {
            ifindex: cmd.ifindex,
            ip: cmd.ip,
        };
        if let Some(neigh) = self.cache.del_neigh(&key) {
            if let Some(timer) = neigh.timer {
                self.wheel.cancel(timer);
            }
        }
    }

    fn handle_fdb_add(&mut self, cmd: &FdbCmd) {
        if !(self.has_links && self.has_networks) {
            return;
        }
        if cmd.ifindex == 0 {
            return;
        }
        if self.cache.get_link(cmd.ifindex).is_none() {
            debug!("fdb event on unknown ifindex {}", cmd.ifindex);
            return;
        }
        if let Err(e) = self.cache.add_fdb(cmd) {
            warn!("failed to cache fdb {}: {e}", util::format_mac(&cmd.mac));
        }
    }

    fn handle_fdb_del(&mut self, cmd: &FdbCmd) {
        self.cache
            .del_fdb(&FdbKey::new(cmd.mac, cmd.ifindex, cmd.vlan_id));
    }

    // ========================================================================
    // Capture records
    // ========================================================================

    fn handle_capture(&mut self, records: Vec<CaptureRecord>) {
        for record in records {
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining = remaining.saturating_sub(1);
            }

            let mut delay_for = |link: &Link, is_ipv4: bool| match timer::probe_delay(
                &link.name, is_ipv4,
            ) {
                Ok(delay) => Some(delay),
                Err(e) => {
                    warn!("cannot schedule probe on {}: {e}", link.name);
                    None
                }
            };

            if let Some(install) =
                pipeline::handle_reply(&mut self.cache, &mut self.wheel, &record, &mut delay_for)
            {
                let msg =
                    self.sub
                        .build_reachable_neigh(install.ifindex, &install.ip, &install.mac);
                self.txq.push_back(msg);
                debug!(
                    "requesting neighbor install: {} {} on ifindex {}",
                    util::format_ip(&install.ip),
                    util::format_mac(&install.mac),
                    install.ifindex
                );
            }
        }
    }

    // ========================================================================
    // Statistics clients
    // ========================================================================

    fn accept_stats(&mut self, result: Result<tokio::net::UnixStream>) {
        match result {
            Ok(stream) => match StatsClient::new(stream, &self.cache.snapshot()) {
                Ok(client) => self.stats_client = Some(client),
                Err(e) => warn!("cannot render statistics snapshot: {e}"),
            },
            Err(e) => warn!("statistics accept failed: {e}"),
        }
    }

    fn serve_stats(&mut self) {
        if let Some(client) = self.stats_client.as_mut() {
            if client.write_chunk() {
                self.stats_client = None;
            }
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Tear down in reverse setup order, best effort.
    async fn shutdown(&mut self) {
        self.stats_client = None;
        if self.config.use_xdp {
            classifier::detach_xdp(self.config.ifindex_mon).await;
        } else {
            classifier::detach_tc(self.config.ifindex_mon).await;
        }
        let cancelled = self.cache.clear();
        for timer in cancelled.0 {
            self.wheel.cancel(timer);
        }
    }
}

/// Sleep until the deadline, or forever when no timer is armed.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Wait for the active stats client to become writable; pending when no
/// client is connected.
async fn client_writable(client: &Option<StatsClient>) {
    match client {
        Some(client) => {
            // A wait error surfaces on the following write attempt.
            let _ = client.writable().await;
        }
        None => std::future::pending().await,
    }
}
