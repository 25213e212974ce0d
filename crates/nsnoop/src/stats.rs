//! Statistics exporter.
//!
//! A Unix stream socket at a fixed path. Each accepted client gets one
//! JSON snapshot of the cache, rendered up front and then streamed with
//! non-blocking writes so a slow reader never stalls the event loop. One
//! client is served at a time.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::cache::Snapshot;
use crate::error::Result;

/// Where clients connect.
pub const SOCKET_PATH: &str = "/run/nsnoopd.sock";

/// The listening side of the statistics endpoint.
pub struct StatsServer {
    listener: UnixListener,
    path: PathBuf,
}

impl StatsServer {
    /// Bind the fixed statistics socket.
    pub fn bind() -> Result<Self> {
        Self::bind_at(Path::new(SOCKET_PATH))
    }

    /// Bind at an explicit path. A stale socket file left by a previous
    /// run is removed first.
    pub fn bind_at(path: &Path) -> Result<Self> {
        let _ = fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Wait for the next client.
    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }
}

impl Drop for StatsServer {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Serving state of one connected client: the rendered snapshot and how
/// far into it we are.
pub struct StatsClient {
    stream: UnixStream,
    buf: Vec<u8>,
    offset: usize,
}

impl StatsClient {
    /// Render the snapshot for a fresh client.
    pub fn new(stream: UnixStream, snapshot: &Snapshot) -> Result<Self> {
        let mut buf = serde_json::to_vec_pretty(snapshot)?;
        buf.push(b'\n');
        Ok(Self {
            stream,
            buf,
            offset: 0,
        })
    }

    /// Wait until the client socket accepts more data.
    pub async fn writable(&self) -> io::Result<()> {
        self.stream.writable().await
    }

    /// Write as much as the socket takes right now. Returns true when the
    /// client is done: everything sent, or the peer hung up.
    pub fn write_chunk(&mut self) -> bool {
        match self.stream.try_write(&self.buf[self.offset..]) {
            Ok(0) => true,
            Ok(n) => {
                self.offset += n;
                self.offset == self.buf.len()
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => {
                debug!("stats client dropped mid-transfer: {e}");
                true
            }
        }
    }
}
