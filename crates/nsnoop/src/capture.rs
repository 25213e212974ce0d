//! Packet-capture consumer.
//!
//! The in-kernel classifier extracts one fixed-layout record per observed
//! ARP reply / neighbor advertisement into a BPF ring buffer. This module
//! maps that ring and drains it: the consumer page is mapped read-write
//! (we own the consumer position), the producer page and the doubled data
//! area read-only. Readiness comes from epoll on the map fd.

use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::bpf;
use crate::config::Family;
use crate::error::{Error, Result};

/// One observation from the classifier. Layout is shared with the
/// in-kernel producer: host-endian integers, big-endian IP, IPv4 carried
/// in IPv4-mapped form.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CaptureRecord {
    pub in_family: u8,
    _pad0: u8,
    pub vlan_id: u16,
    pub network_id: u32,
    pub mac: [u8; 6],
    ip: [u8; 16],
    _pad1: [u8; 2],
}

impl CaptureRecord {
    /// Size of the shared record.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// The observed IP in the cache's canonical representation.
    pub fn ip(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.ip)
    }

    /// Apply the operator's family restriction.
    pub fn matches_family(&self, only: Option<Family>) -> bool {
        match only {
            None => true,
            Some(Family::Ipv4) => self.in_family == libc::AF_INET as u8,
            Some(Family::Ipv6) => self.in_family == libc::AF_INET6 as u8,
        }
    }

    /// Construct a record, as the in-kernel producer would.
    pub fn new(in_family: u8, vlan_id: u16, network_id: u32, mac: [u8; 6], ip: Ipv6Addr) -> Self {
        Self {
            in_family,
            _pad0: 0,
            vlan_id,
            network_id,
            mac,
            ip: ip.octets(),
            _pad1: [0; 2],
        }
    }
}

// Ring buffer record header bits.
const RINGBUF_BUSY_BIT: u32 = 1 << 31;
const RINGBUF_DISCARD_BIT: u32 = 1 << 30;
const RINGBUF_HDR_SZ: u64 = 8;

/// Consumer side of the classifier's ring buffer.
pub struct CaptureRing {
    fd: AsyncFd<OwnedFd>,
    mask: u64,
    consumer: *mut u8,
    consumer_len: usize,
    producer: *const u8,
    producer_len: usize,
    page_size: usize,
}

// Single-threaded daemon; the raw pointers never cross threads.
unsafe impl Send for CaptureRing {}

impl CaptureRing {
    /// Map the pinned ring-buffer map for consumption.
    pub fn new(fd: OwnedFd) -> Result<Self> {
        let info = bpf::map_info(fd.as_raw_fd())?;
        let max_entries = u64::from(info.max_entries);
        if max_entries == 0 || !max_entries.is_power_of_two() {
            return Err(Error::setup(format!(
                "ring buffer size {max_entries} is not a power of two"
            )));
        }

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

        let consumer_len = page_size;
        let consumer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                consumer_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if consumer == libc::MAP_FAILED {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        // Producer page plus data area; the data area is mapped twice so
        // records never appear split at the wrap point.
        let producer_len = page_size + 2 * max_entries as usize;
        let producer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                producer_len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                page_size as libc::off_t,
            )
        };
        if producer == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe { libc::munmap(consumer, consumer_len) };
            return Err(Error::Io(err));
        }

        Ok(Self {
            fd: AsyncFd::with_interest(fd, Interest::READABLE)?,
            mask: max_entries - 1,
            consumer: consumer as *mut u8,
            consumer_len,
            producer: producer as *const u8,
            producer_len,
            page_size,
        })
    }

    fn consumer_pos(&self) -> &AtomicU64 {
        unsafe { &*(self.consumer as *const AtomicU64) }
    }

    fn producer_pos(&self) -> &AtomicU64 {
        unsafe { &*(self.producer as *const AtomicU64) }
    }

    fn data(&self) -> *const u8 {
        unsafe { self.producer.add(self.page_size) }
    }

    /// Drain every completed record currently in the ring.
    pub fn drain(&mut self, out: &mut Vec<CaptureRecord>) {
        let mut cons = self.consumer_pos().load(Ordering::Acquire);

        loop {
            let prod = self.producer_pos().load(Ordering::Acquire);
            if cons >= prod {
                break;
            }

            let hdr = unsafe { self.data().add((cons & self.mask) as usize) };
            let len = unsafe { &*(hdr as *const AtomicU32) }.load(Ordering::Acquire);
            if len & RINGBUF_BUSY_BIT != 0 {
                break;
            }

            let sample_len = (len & !(RINGBUF_BUSY_BIT | RINGBUF_DISCARD_BIT)) as usize;
            if len & RINGBUF_DISCARD_BIT == 0 {
                let sample =
                    unsafe { std::slice::from_raw_parts(hdr.add(RINGBUF_HDR_SZ as usize), sample_len) };
                match CaptureRecord::read_from_bytes(sample) {
                    Ok(record) => out.push(record),
                    Err(_) => tracing::warn!(
                        "capture record of {sample_len} bytes does not match the shared layout"
                    ),
                }
            }

            // Records are 8-byte aligned including their header.
            cons += (sample_len as u64 + RINGBUF_HDR_SZ + 7) & !7;
            self.consumer_pos().store(cons, Ordering::Release);
        }
    }

    /// Wait for records and return everything available. Records for the
    /// unselected family are dropped here, before correlation.
    pub async fn next_burst(&mut self, only: Option<Family>) -> Result<Vec<CaptureRecord>> {
        loop {
            let mut records = Vec::new();
            self.drain(&mut records);
            records.retain(|r| r.matches_family(only));
            if !records.is_empty() {
                return Ok(records);
            }

            let mut guard = self.fd.readable().await?;
            guard.clear_ready();
        }
    }
}

impl Drop for CaptureRing {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.consumer as *mut libc::c_void, self.consumer_len);
            libc::munmap(self.producer as *mut libc::c_void, self.producer_len);
        }
    }
}
