//! Runtime configuration assembled from the command line.

use regex::Regex;

/// Restrict handling to one address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
}

/// Process-wide configuration, built once at startup and passed by
/// reference to every component.
#[derive(Debug)]
pub struct Config {
    /// Kernel index of the monitored bridge/SVI parent interface.
    pub ifindex_mon: u32,
    /// Name of the monitored interface.
    pub ifname_mon: String,
    /// Only handle this family, when set.
    pub family: Option<Family>,
    /// Stop after this many replies (debug aid).
    pub count: Option<u64>,
    /// Interfaces matching this pattern are flagged `ignore_link`.
    pub deny_filter: Option<Regex>,
    /// Disable the default IPv6 link-local filter on address-add.
    pub learn_link_local: bool,
    /// Fail instead of replacing a pre-existing ingress classifier.
    pub keep_existing_filter: bool,
    /// Attach the classifier at XDP instead of TC ingress.
    pub use_xdp: bool,
}

impl Config {
    /// Check an interface name against the deny filter.
    pub fn is_denied(&self, ifname: &str) -> bool {
        self.deny_filter
            .as_ref()
            .is_some_and(|re| re.is_match(ifname))
    }
}
