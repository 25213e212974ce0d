//! Error types shared across the daemon.

use std::io;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by netlink plumbing, BPF plumbing and cache mutation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket or mmap operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error (statistics snapshot).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The kernel rejected a request.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// A wire message or shared-memory record was shorter than its header
    /// claims.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected length.
        expected: usize,
        /// Actual bytes available.
        actual: usize,
    },

    /// Invalid netlink message format.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid netlink attribute format.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    /// A cache mutation referenced an interface that is not cached.
    #[error("interface {ifindex} not cached")]
    LinkNotCached {
        /// The missing interface index.
        ifindex: u32,
    },

    /// A cache mutation referenced a network that is not cached.
    #[error("network {id} not cached")]
    NetworkNotCached {
        /// The missing network id.
        id: u32,
    },

    /// Two distinct networks cannot share one network address.
    #[error("network address {address} already cached with prefix length {existing_prefix_len}")]
    DuplicateNetwork {
        /// The conflicting network address.
        address: std::net::Ipv6Addr,
        /// Prefix length of the cached network.
        existing_prefix_len: u32,
    },

    /// Startup failed before the event loop was entered.
    #[error("setup failed: {0}")]
    Setup(String),
}

impl Error {
    /// Create a kernel error from a (negative) errno value.
    pub fn from_errno(errno: i32) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::Kernel {
            errno: -errno,
            message,
        }
    }

    /// Create a setup error with a message.
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }

    /// Check if this is a "not found" error (ENOENT, ENODEV).
    pub fn is_not_found(&self) -> bool {
        matches!(self.errno(), Some(2 | 19))
    }

    /// Check if this is an "already exists" error (EEXIST).
    pub fn is_already_exists(&self) -> bool {
        self.errno() == Some(17)
    }

    /// Check if this is a permission error (EPERM, EACCES).
    pub fn is_permission_denied(&self) -> bool {
        matches!(self.errno(), Some(1 | 13))
    }

    /// Get the errno value if this is a kernel or I/O error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } => Some(*errno),
            Self::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
