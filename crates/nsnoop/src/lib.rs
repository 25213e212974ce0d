//! Neighbor discovery snooping for Linux bridge/SVI hosts.
//!
//! `nsnoop` watches ARP replies and IPv6 Neighbor Advertisements that an
//! in-kernel classifier extracts from a monitored bridge interface. Every
//! observation that maps to a locally configured SVI network becomes a
//! kernel neighbor entry, and a per-neighbor timer keeps the entry from
//! decaying to STALE by sending gratuitous ARP requests or Neighbor
//! Solicitations ahead of the kernel's reachable-time deadline.
//!
//! The crate is organized around four cores:
//!
//! - [`cache`]: the multi-index topology cache of links, networks,
//!   link-network edges, bridge FDB entries and learned neighbors,
//!   reconciled with kernel state.
//! - [`pipeline`]: the decision logic correlating capture records
//!   against the cache.
//! - [`timer`] and [`probe`]: the gratuitous probe scheduler and the
//!   frames it emits.
//! - [`daemon`]: the single-threaded event loop multiplexing signals,
//!   timers, the netlink subscription, the capture ring and the
//!   statistics endpoint with a fixed priority order.
//!
//! Everything is single-threaded by construction; the only suspension
//! points are the readiness awaits inside the loop.

pub mod bpf;
pub mod cache;
pub mod capture;
pub mod config;
pub mod daemon;
pub mod error;
pub mod netlink;
pub mod pipeline;
pub mod probe;
pub mod stats;
pub mod timer;
pub mod util;

pub use config::{Config, Family};
pub use daemon::Daemon;
pub use error::{Error, Result};
