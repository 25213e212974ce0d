//! Per-neighbor probe timers.
//!
//! One cancellable, fire-once timer per cached neighbor. The wheel is a
//! binary heap of deadlines with lazy cancellation; the event loop arms a
//! single `sleep_until` for the earliest live deadline and pops due
//! entries when it fires.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::cache::NeighKey;
use crate::error::{Error, Result};

/// Upper bound of the uniform jitter added to every probe deadline.
const JITTER_MS: u64 = 2000;

/// Handle of an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

/// Deadline-ordered timer wheel keyed to cached neighbors.
#[derive(Debug, Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    armed: HashMap<TimerId, NeighKey>,
    next_id: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer. The caller stores the returned handle on the neighbor.
    pub fn arm(&mut self, deadline: Instant, key: NeighKey) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.armed.insert(id, key);
        id
    }

    /// Cancel an armed timer. Cancelling twice is harmless.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.armed.remove(&id).is_some()
    }

    /// Earliest live deadline. Discards cancelled heap entries on the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.armed.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop one timer that is due at `now`, if any.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, NeighKey)> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                return None;
            }
            self.heap.pop();
            if let Some(key) = self.armed.remove(&id) {
                return Some((id, key));
            }
        }
        None
    }

    /// Number of live timers.
    pub fn armed_len(&self) -> usize {
        self.armed.len()
    }

    /// Whether a handle is still armed.
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.armed.contains_key(&id)
    }
}

/// Delay until the next gratuitous probe for a neighbor on `ifname`.
///
/// Reads the kernel's per-interface tunable for the matching family at
/// scheduling time, so runtime sysctl changes take effect on the next
/// probe. The aim is to probe well before the kernel demotes the entry to
/// STALE, so the delay is a quarter of the reachable time; the jitter
/// spreads probes of neighbors learned in one burst.
pub fn probe_delay(ifname: &str, is_ipv4: bool) -> Result<Duration> {
    let family = if is_ipv4 { "ipv4" } else { "ipv6" };
    let path = format!("/proc/sys/net/{family}/neigh/{ifname}/base_reachable_time_ms");
    let text = std::fs::read_to_string(&path)?;
    let base_ms: u64 = text
        .trim()
        .parse()
        .map_err(|_| Error::InvalidMessage(format!("{path}: {:?}", text.trim())))?;

    Ok(delay_from(base_ms, rand::thread_rng().gen_range(0..JITTER_MS)))
}

/// Deadline rule: `base_reachable_time_ms / 4` plus uniform jitter.
pub fn delay_from(base_reachable_ms: u64, jitter_ms: u64) -> Duration {
    Duration::from_millis(base_reachable_ms / 4 + jitter_ms)
}
