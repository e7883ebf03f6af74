//! Inter-process plumbing between the dispatcher and its clients.
//!
//! Clients find the dispatcher through a shared memory segment that names
//! its database directory, then talk to it over a Unix socket in that
//! directory using 32-bit little-endian words.

pub mod protocol;
pub mod shmem;

pub use protocol::Command;
pub use shmem::{DiscoveryBlock, SharedSegment};

use std::path::{Path, PathBuf};

/// Socket of the dispatcher published under `shared_name`.
pub fn socket_path(db_dir: &Path, shared_name: &str) -> PathBuf {
    db_dir.join(shared_name.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path() {
        assert_eq!(
            socket_path(Path::new("/srv/db"), "/osm_base"),
            PathBuf::from("/srv/db/osm_base")
        );
    }
}
