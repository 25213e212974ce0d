//! Minimal `bpf(2)` plumbing.
//!
//! The ARP/NA classifier is built and pinned out of band; this daemon only
//! opens the pinned objects and drives two maps: the prefix table that
//! tells the classifier which networks to report on, and the ring buffer
//! it reports into.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use zerocopy::{Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

/// bpffs directory holding the pinned classifier objects.
pub const PIN_DIR: &str = "/sys/fs/bpf/nsnoopd";

/// Pinned object names under [`PIN_DIR`].
pub const PIN_PROG_TC: &str = "classifier_tc";
pub const PIN_PROG_XDP: &str = "classifier_xdp";
pub const PIN_MAP_NETWORKS: &str = "target_networks";
pub const PIN_MAP_RING: &str = "capture_ring";

// bpf(2) command numbers.
const BPF_MAP_UPDATE_ELEM: libc::c_int = 2;
const BPF_MAP_DELETE_ELEM: libc::c_int = 3;
const BPF_OBJ_GET: libc::c_int = 7;
const BPF_OBJ_GET_INFO_BY_FD: libc::c_int = 15;

/// BPF_ANY: create or update.
const BPF_ANY: u64 = 0;

unsafe fn sys_bpf<T>(cmd: libc::c_int, attr: &mut T) -> io::Result<libc::c_int> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut T as *mut libc::c_void,
            std::mem::size_of::<T>(),
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as libc::c_int)
    }
}

/// Open an object pinned in bpffs.
pub fn obj_get(path: &Path) -> Result<OwnedFd> {
    let cpath = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::setup(format!("pin path {} contains NUL", path.display())))?;

    #[repr(C)]
    struct ObjAttr {
        pathname: u64,
        bpf_fd: u32,
        file_flags: u32,
    }
    let mut attr = ObjAttr {
        pathname: cpath.as_ptr() as u64,
        bpf_fd: 0,
        file_flags: 0,
    };

    let fd = unsafe { sys_bpf(BPF_OBJ_GET, &mut attr) }
        .map_err(|e| Error::setup(format!("cannot open pinned object {}: {e}", path.display())))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[repr(C)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

fn map_update_elem(fd: RawFd, key: &[u8], value: &[u8]) -> io::Result<()> {
    let mut attr = MapElemAttr {
        map_fd: fd as u32,
        _pad: 0,
        key: key.as_ptr() as u64,
        value: value.as_ptr() as u64,
        flags: BPF_ANY,
    };
    unsafe { sys_bpf(BPF_MAP_UPDATE_ELEM, &mut attr) }.map(|_| ())
}

fn map_delete_elem(fd: RawFd, key: &[u8]) -> io::Result<()> {
    let mut attr = MapElemAttr {
        map_fd: fd as u32,
        _pad: 0,
        key: key.as_ptr() as u64,
        value: 0,
        flags: 0,
    };
    unsafe { sys_bpf(BPF_MAP_DELETE_ELEM, &mut attr) }.map(|_| ())
}

/// The subset of `struct bpf_map_info` this daemon reads.
#[repr(C)]
#[derive(Default)]
pub struct MapInfo {
    pub map_type: u32,
    pub id: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    pub name: [u8; 16],
}

/// Query map metadata (ring size discovery).
pub fn map_info(fd: RawFd) -> Result<MapInfo> {
    let mut info = MapInfo::default();

    #[repr(C)]
    struct InfoAttr {
        bpf_fd: u32,
        info_len: u32,
        info: u64,
    }
    let mut attr = InfoAttr {
        bpf_fd: fd as u32,
        info_len: std::mem::size_of::<MapInfo>() as u32,
        info: &mut info as *mut MapInfo as u64,
    };

    unsafe { sys_bpf(BPF_OBJ_GET_INFO_BY_FD, &mut attr) }?;
    Ok(info)
}

/// Key of the in-kernel prefix table: host-endian prefix length on the
/// 128-bit scale, big-endian network address.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoBytes, Immutable, KnownLayout)]
pub struct PrefixKey {
    pub prefix_len: u32,
    pub network: [u8; 16],
}

impl PrefixKey {
    pub fn new(prefix_len: u32, network: &Ipv6Addr) -> Self {
        Self {
            prefix_len,
            network: network.octets(),
        }
    }
}

/// The kernel-visible projection of the Network set. Mutated only by the
/// cache's network add/remove operations, atomically with them.
pub trait PrefixTable {
    /// Insert or update `key → network_id`.
    fn insert(&mut self, key: PrefixKey, network_id: u32) -> Result<()>;

    /// Remove `key`. Removing an absent key is an error.
    fn remove(&mut self, key: &PrefixKey) -> Result<()>;
}

/// Production table: the pinned classifier map.
pub struct BpfPrefixTable {
    fd: OwnedFd,
}

impl BpfPrefixTable {
    /// Open the pinned prefix table.
    pub fn open() -> Result<Self> {
        let fd = obj_get(&Path::new(PIN_DIR).join(PIN_MAP_NETWORKS))?;
        Ok(Self { fd })
    }
}

impl PrefixTable for BpfPrefixTable {
    fn insert(&mut self, key: PrefixKey, network_id: u32) -> Result<()> {
        map_update_elem(self.fd.as_raw_fd(), key.as_bytes(), &network_id.to_ne_bytes())?;
        Ok(())
    }

    fn remove(&mut self, key: &PrefixKey) -> Result<()> {
        map_delete_elem(self.fd.as_raw_fd(), key.as_bytes())?;
        Ok(())
    }
}

/// In-memory table for hermetic tests.
#[derive(Debug, Default)]
pub struct MemoryPrefixTable {
    entries: HashMap<PrefixKey, u32>,
    /// When set, the next insert fails; exercises mutation unwind paths.
    pub fail_next_insert: bool,
}

impl MemoryPrefixTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &PrefixKey) -> Option<u32> {
        self.entries.get(key).copied()
    }
}

impl PrefixTable for MemoryPrefixTable {
    fn insert(&mut self, key: PrefixKey, network_id: u32) -> Result<()> {
        if self.fail_next_insert {
            self.fail_next_insert = false;
            return Err(Error::from_errno(-libc::ENOSPC));
        }
        self.entries.insert(key, network_id);
        Ok(())
    }

    fn remove(&mut self, key: &PrefixKey) -> Result<()> {
        self.entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::from_errno(-libc::ENOENT))
    }
}

/// Path of a pinned object by name.
pub fn pin_path(name: &str) -> std::path::PathBuf {
    Path::new(PIN_DIR).join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_key_layout() {
        let addr: Ipv6Addr = "::ffff:10.0.0.0".parse().unwrap();
        let key = PrefixKey::new(120, &addr);
        let bytes = key.as_bytes();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[..4], &120u32.to_ne_bytes());
        assert_eq!(&bytes[4..], &addr.octets());
    }

    #[test]
    fn test_memory_table_roundtrip() {
        let mut table = MemoryPrefixTable::new();
        let key = PrefixKey::new(64, &"fd00::".parse().unwrap());
        table.insert(key, 7).unwrap();
        assert_eq!(table.get(&key), Some(7));
        table.remove(&key).unwrap();
        assert!(table.remove(&key).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_memory_table_injected_failure() {
        let mut table = MemoryPrefixTable::new();
        table.fail_next_insert = true;
        let key = PrefixKey::new(64, &"fd00::".parse().unwrap());
        assert!(table.insert(key, 1).is_err());
        // Failure is one-shot
        table.insert(key, 1).unwrap();
    }
}
