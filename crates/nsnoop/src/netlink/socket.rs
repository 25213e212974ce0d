//! Async NETLINK_ROUTE socket.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::BytesMut;
use netlink_sys::{Socket, SocketAddr, protocols};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use crate::error::{Error, Result};
use crate::netlink::builder::MessageBuilder;
use crate::netlink::message::{MessageIter, NlMsgError};

/// Receive buffer size. Dump replies for large neighbor tables arrive in
/// several buffers of this size.
const RECV_BUF_LEN: usize = 32768;

/// Async rtnetlink socket with multicast membership and sequence numbers.
pub struct NetlinkSocket {
    fd: AsyncFd<Socket>,
    seq: AtomicU32,
    pid: u32,
}

impl NetlinkSocket {
    /// Create and bind a NETLINK_ROUTE socket.
    pub fn new() -> Result<Self> {
        let mut socket = Socket::new(protocols::NETLINK_ROUTE)?;
        socket.set_non_blocking(true)?;

        let mut addr = SocketAddr::new(0, 0);
        socket.bind(&addr)?;
        socket.get_address(&mut addr)?;
        let pid = addr.port_number();

        Ok(Self {
            fd: AsyncFd::new(socket)?,
            seq: AtomicU32::new(1),
            pid,
        })
    }

    /// Get the next request sequence number.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Get the kernel-assigned port ID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Join an rtnetlink multicast group.
    pub fn subscribe(&mut self, group: u32) -> Result<()> {
        self.fd.get_mut().add_membership(group)?;
        Ok(())
    }

    /// Send one message, waiting for the socket to become writable.
    pub async fn send(&self, msg: &[u8]) -> Result<()> {
        loop {
            let mut guard = self.fd.ready(Interest::WRITABLE).await?;
            match guard.try_io(|inner| inner.get_ref().send(msg, 0)) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one buffer of messages, waiting for readability.
    pub async fn recv(&self) -> Result<Vec<u8>> {
        loop {
            let mut guard = self.fd.ready(Interest::READABLE).await?;
            let mut buf = BytesMut::with_capacity(RECV_BUF_LEN);
            match guard.try_io(|inner| inner.get_ref().recv(&mut buf, 0)) {
                Ok(result) => {
                    result?;
                    return Ok(buf.to_vec());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive every buffer currently queued on the socket. Waits for the
    /// first buffer, then drains without blocking so a loop tick observes
    /// all messages that have already arrived.
    pub async fn recv_burst(&self) -> Result<Vec<Vec<u8>>> {
        let mut bufs = Vec::new();
        loop {
            let mut guard = self.fd.ready(Interest::READABLE).await?;
            loop {
                let mut buf = BytesMut::with_capacity(RECV_BUF_LEN);
                match guard.try_io(|inner| inner.get_ref().recv(&mut buf, 0)) {
                    Ok(Ok(_)) => bufs.push(buf.to_vec()),
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_would_block) => break,
                }
            }
            if !bufs.is_empty() {
                return Ok(bufs);
            }
        }
    }

    /// Send the front of a queue, popping it on success. At most one
    /// message leaves per call; a full socket buffer leaves the queue
    /// untouched for the next tick.
    pub async fn send_next(&self, queue: &mut std::collections::VecDeque<Vec<u8>>) -> Result<()> {
        let Some(msg) = queue.front() else {
            return Ok(());
        };
        let mut guard = self.fd.ready(Interest::WRITABLE).await?;
        match guard.try_io(|inner| inner.get_ref().send(msg, 0)) {
            Ok(result) => {
                result?;
                queue.pop_front();
                Ok(())
            }
            Err(_would_block) => Ok(()),
        }
    }

    /// Send a request and wait for its ACK. Multicast traffic arriving
    /// in between is ignored; use this only on dedicated request sockets.
    pub async fn request_ack(&self, mut builder: MessageBuilder) -> Result<()> {
        let seq = self.next_seq();
        builder.set_seq(seq);
        builder.set_pid(self.pid);
        self.send(&builder.finish()).await?;

        loop {
            let response = self.recv().await?;
            for result in MessageIter::new(&response) {
                let (header, payload) = result?;
                if header.nlmsg_seq != seq {
                    continue;
                }
                if header.is_error() {
                    let err = NlMsgError::from_bytes(payload)?;
                    if err.is_ack() {
                        return Ok(());
                    }
                    return Err(Error::from_errno(err.error));
                }
            }
        }
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

/// rtnetlink multicast groups this daemon subscribes to.
pub mod rtnetlink_groups {
    pub const RTNLGRP_LINK: u32 = 1;
    pub const RTNLGRP_NEIGH: u32 = 3;
    pub const RTNLGRP_IPV4_IFADDR: u32 = 5;
    pub const RTNLGRP_IPV6_IFADDR: u32 = 9;
}
