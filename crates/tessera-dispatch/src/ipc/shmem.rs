//! Shared memory discovery segment.
//!
//! The dispatcher publishes a fixed 4096-byte POSIX shared memory object:
//! a `binrw` header (`"TSDS"`, version, two lengths) followed by the
//! database directory and the shadow base path as UTF-8. Clients map it
//! read-only and validate every length against the mapped size before
//! slicing.

use std::ffi::CString;
use std::fs::File;
use std::io::Cursor;
use std::os::fd::FromRawFd;
use std::path::PathBuf;

use binrw::{BinRead, BinWrite};
use libc::{O_CREAT, O_RDONLY, O_RDWR, S_IRGRP, S_IROTH, S_IRUSR, S_IWUSR};
use libc::{c_uint, mode_t};
use memmap2::{Mmap, MmapMut};
use tracing::debug;

use crate::{DispatchError, Result};

/// Size of the discovery segment.
pub const DISCOVERY_SIZE: usize = 4096;

/// Discovery layout version.
pub const DISCOVERY_VERSION: u32 = 1;

const HEADER_SIZE: usize = 16;

#[derive(Debug, BinRead, BinWrite)]
#[brw(little, magic = b"TSDS")]
struct DiscoveryHeader {
    version: u32,
    db_dir_len: u32,
    shadow_len: u32,
}

/// What a client needs to find the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryBlock {
    /// Database directory, which also holds the socket.
    pub db_dir: PathBuf,
    /// Base path of the shadow marker and lock files.
    pub shadow_name: PathBuf,
}

impl DiscoveryBlock {
    /// Serialize into a full segment image.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let db_dir = utf8(&self.db_dir)?;
        let shadow = utf8(&self.shadow_name)?;
        if HEADER_SIZE + db_dir.len() + shadow.len() > DISCOVERY_SIZE {
            return Err(DispatchError::SharedMemory(format!(
                "paths too long for the {DISCOVERY_SIZE}-byte discovery segment"
            )));
        }

        let header = DiscoveryHeader {
            version: DISCOVERY_VERSION,
            db_dir_len: db_dir.len() as u32,
            shadow_len: shadow.len() as u32,
        };
        let mut cursor = Cursor::new(Vec::with_capacity(DISCOVERY_SIZE));
        header
            .write(&mut cursor)
            .map_err(|e| DispatchError::SharedMemory(format!("discovery header: {e}")))?;
        let mut bytes = cursor.into_inner();
        bytes.extend_from_slice(db_dir.as_bytes());
        bytes.extend_from_slice(shadow.as_bytes());
        bytes.resize(DISCOVERY_SIZE, 0);
        Ok(bytes)
    }

    /// Parse a mapped segment.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(DispatchError::SharedMemory(format!(
                "discovery segment too small: {} bytes",
                bytes.len()
            )));
        }
        let header = DiscoveryHeader::read(&mut Cursor::new(bytes))
            .map_err(|e| DispatchError::SharedMemory(format!("discovery header: {e}")))?;
        if header.version != DISCOVERY_VERSION {
            return Err(DispatchError::SharedMemory(format!(
                "unsupported discovery version {}",
                header.version
            )));
        }

        let db_end = HEADER_SIZE + header.db_dir_len as usize;
        let shadow_end = db_end + header.shadow_len as usize;
        if shadow_end > bytes.len() {
            return Err(DispatchError::SharedMemory(format!(
                "discovery strings end at {shadow_end}, segment has {} bytes",
                bytes.len()
            )));
        }

        let text = |range: std::ops::Range<usize>| {
            std::str::from_utf8(&bytes[range])
                .map(PathBuf::from)
                .map_err(|e| DispatchError::SharedMemory(format!("discovery path: {e}")))
        };
        Ok(Self {
            db_dir: text(HEADER_SIZE..db_end)?,
            shadow_name: text(db_end..shadow_end)?,
        })
    }
}

fn utf8(path: &std::path::Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        DispatchError::SharedMemory(format!("{} is not valid UTF-8", path.display()))
    })
}

/// The published segment; unlinked on drop.
pub struct SharedSegment {
    name: String,
    _map: MmapMut,
}

impl SharedSegment {
    /// Create or overwrite the segment `name` with `block`.
    pub fn publish(name: &str, block: &DiscoveryBlock) -> Result<Self> {
        let bytes = block.to_bytes()?;
        let file = open_shm(name, O_CREAT | O_RDWR, S_IRUSR | S_IWUSR | S_IRGRP | S_IROTH)?;
        file.set_len(DISCOVERY_SIZE as u64)
            .map_err(|e| DispatchError::SharedMemory(format!("ftruncate {name}: {e}")))?;

        // SAFETY: the object was sized above; readers only map it read-only.
        #[allow(unsafe_code)]
        let mut map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| DispatchError::SharedMemory(format!("mmap {name}: {e}")))?;
        map.copy_from_slice(&bytes);
        map.flush()
            .map_err(|e| DispatchError::SharedMemory(format!("msync {name}: {e}")))?;

        debug!("Published discovery segment {name}");
        Ok(Self {
            name: name.to_string(),
            _map: map,
        })
    }

    /// Map the segment `name` read-only and parse it.
    pub fn read(name: &str) -> Result<DiscoveryBlock> {
        let file = open_shm(name, O_RDONLY, 0)?;
        // SAFETY: read-only mapping; the contents are validated before use.
        #[allow(unsafe_code)]
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| DispatchError::SharedMemory(format!("mmap {name}: {e}")))?;
        DiscoveryBlock::parse(&map)
    }

    /// POSIX name of the segment.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SharedSegment {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        if let Ok(c_name) = posix_name(&self.name) {
            unsafe {
                libc::shm_unlink(c_name.as_ptr());
            }
        }
    }
}

fn posix_name(name: &str) -> Result<CString> {
    let name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    CString::new(name).map_err(|e| DispatchError::SharedMemory(format!("invalid shm name: {e}")))
}

#[allow(unsafe_code)]
fn open_shm(name: &str, flags: i32, mode: mode_t) -> Result<File> {
    let c_name = posix_name(name)?;
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, mode as c_uint) };
    if fd == -1 {
        return Err(DispatchError::SharedMemory(format!(
            "shm_open failed for {name}: {}",
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: `fd` was just returned by shm_open and is owned by nobody else.
    Ok(unsafe { File::from_raw_fd(fd) })
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn sample() -> DiscoveryBlock {
        DiscoveryBlock {
            db_dir: PathBuf::from("/srv/osm/db"),
            shadow_name: PathBuf::from("/srv/osm/db/osm_base.shadow"),
        }
    }

    #[test]
    fn test_layout() {
        let bytes = sample().to_bytes().expect("serialize");
        assert_eq!(bytes.len(), DISCOVERY_SIZE);
        assert_eq!(&bytes[..4], b"TSDS");
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &11u32.to_le_bytes());
        assert_eq!(&bytes[16..27], b"/srv/osm/db");
        assert_eq!(DiscoveryBlock::parse(&bytes).expect("parse"), sample());
    }

    #[test]
    fn test_lengths_validated() {
        let mut bytes = sample().to_bytes().expect("serialize");
        bytes[12..16].copy_from_slice(&5000u32.to_le_bytes());
        assert!(DiscoveryBlock::parse(&bytes).is_err());

        assert!(DiscoveryBlock::parse(&bytes[..8]).is_err());

        let mut bad_magic = sample().to_bytes().expect("serialize");
        bad_magic[0] = b'X';
        assert!(DiscoveryBlock::parse(&bad_magic).is_err());
    }

    #[test]
    fn test_oversized_paths() {
        let block = DiscoveryBlock {
            db_dir: PathBuf::from("/".repeat(4090)),
            shadow_name: PathBuf::from("/x"),
        };
        assert!(block.to_bytes().is_err());
    }

    #[test]
    fn test_publish_and_read() {
        let name = format!("/tessera_test_{}", std::process::id());
        match SharedSegment::publish(&name, &sample()) {
            Ok(segment) => {
                assert_eq!(segment.name(), name);
                let block = SharedSegment::read(&name).expect("read back");
                assert_eq!(block, sample());
                drop(segment);
                assert!(SharedSegment::read(&name).is_err());
            }
            Err(e) => {
                // shm_open may fail in CI containers without /dev/shm
                eprintln!("skipping shmem test (not available): {e}");
            }
        }
    }
}
