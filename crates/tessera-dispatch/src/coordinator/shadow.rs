//! Shadow copies of the controlled index files.
//!
//! A write transaction owns `<shadow_name>.lock`, whose content is the
//! writer's pid. At start every controlled `<trunk>.bin.idx` is copied to
//! `<trunk>.bin.idx.shadow` and the blocks it leaves unreferenced are
//! written to `<trunk>.bin.idx.empty`. The writer only touches the shadow
//! index and those blocks, so readers on the main index never see its
//! work.
//!
//! Promotion creates the `<shadow_name>` marker first, copies every shadow
//! over its main file, then removes shadows, lock and marker. A marker
//! left behind by a crash means the copy step must be redone.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tessera_blocks::FileNames;
use tessera_blocks::files::with_suffix;
use tessera_blocks::index::{RawIndex, write_atomic};
use tracing::{debug, info, warn};

use super::footprint::Footprint;
use crate::{DispatchError, Result};

/// Lock file suffix.
pub const LOCK_SUFFIX: &str = ".lock";

/// Status dump suffix.
pub const STATUS_SUFFIX: &str = ".status";

/// What startup found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// No transaction was in flight.
    Clean,
    /// A half-finished commit was completed.
    Promoted,
    /// A transaction without commit was discarded.
    RolledBack,
}

/// The controlled files of one database directory.
#[derive(Debug, Clone)]
pub struct ShadowFiles {
    db_dir: PathBuf,
    shadow_name: PathBuf,
    trunks: Vec<String>,
}

impl ShadowFiles {
    /// Controlled `trunks` in `db_dir`.
    pub fn new(
        db_dir: impl Into<PathBuf>,
        shadow_name: impl Into<PathBuf>,
        trunks: &[String],
    ) -> Self {
        Self {
            db_dir: db_dir.into(),
            shadow_name: shadow_name.into(),
            trunks: trunks.to_vec(),
        }
    }

    /// Database directory.
    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    /// Commit marker.
    pub fn barrier_path(&self) -> &Path {
        &self.shadow_name
    }

    /// Write lock.
    pub fn lock_path(&self) -> PathBuf {
        with_suffix(&self.shadow_name, LOCK_SUFFIX)
    }

    /// Status dump.
    pub fn status_path(&self) -> PathBuf {
        with_suffix(&self.shadow_name, STATUS_SUFFIX)
    }

    fn names(&self) -> impl Iterator<Item = FileNames> + '_ {
        self.trunks
            .iter()
            .map(|trunk| FileNames::new(&self.db_dir, trunk.as_str()))
    }

    /// Pid recorded in the lock file, if any.
    pub fn lock_holder(&self) -> Result<Option<u32>> {
        let path = self.lock_path();
        match fs::read_to_string(&path) {
            Ok(text) => text.trim().parse().map(Some).map_err(|e| {
                let text = text.trim();
                DispatchError::Protocol(format!("{}: bad pid '{text}': {e}", path.display()))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DispatchError::io("read_lock", &path)(e)),
        }
    }

    /// Take the write lock for `pid`. Returns `false` when `pid` already
    /// held it.
    pub fn lock(&self, pid: u32) -> Result<bool> {
        let path = self.lock_path();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{pid}").map_err(DispatchError::io("write_lock", &path))?;
                file.sync_all().map_err(DispatchError::io("sync_lock", &path))?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => match self.lock_holder()? {
                Some(holder) if holder == pid => Ok(false),
                Some(holder) => Err(DispatchError::LockHeld { pid: holder }),
                None => Err(DispatchError::LockHeld { pid: 0 }),
            },
            Err(e) => Err(DispatchError::io("create_lock", &path)(e)),
        }
    }

    /// Release the write lock.
    pub fn unlock(&self) -> Result<()> {
        remove_if_exists(&self.lock_path(), "remove_lock")
    }

    /// Blocks referenced by the main indexes.
    pub fn footprint(&self) -> Result<Footprint> {
        let mut footprint = Footprint::default();
        for names in self.names() {
            let main = names.index();
            if main.exists() {
                footprint.insert(names.trunk(), RawIndex::read_from(&main)?.used_blocks());
            }
        }
        Ok(footprint)
    }

    /// Copy each main index to its shadow and record the blocks the writer
    /// may reuse: those neither the main index nor `held` references.
    pub fn snapshot(&self, held: &Footprint) -> Result<()> {
        for names in self.names() {
            let shadow = names.shadow_index();
            let empty = names.empty_index();
            remove_if_exists(&shadow, "remove_stale_shadow")?;
            remove_if_exists(&empty, "remove_stale_empty")?;

            let main = names.index();
            if !main.exists() {
                debug!("No index for {}, writer starts empty", names.trunk());
                continue;
            }
            let bytes = fs::read(&main).map_err(DispatchError::io("read_index", &main))?;
            let raw = RawIndex::parse(&bytes)?;
            write_atomic(&shadow, &bytes)?;
            let mut reusable = raw.empty_blocks();
            reusable.exclude(held.used(names.trunk()));
            reusable.write_to(&empty)?;
            debug!(
                "Shadowed {} ({} entries, {} reusable blocks)",
                names.trunk(),
                raw.entries.len(),
                reusable.total_blocks()
            );
        }
        Ok(())
    }

    /// Make the shadows the main files.
    pub fn promote(&self) -> Result<()> {
        let barrier = self.barrier_path();
        let mut marker =
            File::create(barrier).map_err(DispatchError::io("create_barrier", barrier))?;
        marker
            .sync_all()
            .map_err(DispatchError::io("sync_barrier", barrier))?;
        drop(marker);

        self.copy_shadows()?;
        self.remove_shadows()?;
        self.unlock()?;
        remove_if_exists(barrier, "remove_barrier")?;
        info!("Promoted shadow files in {}", self.db_dir.display());
        Ok(())
    }

    /// Transaction files still on disk: shadows, empty indexes, lock and
    /// commit marker.
    pub fn leftovers(&self) -> Vec<PathBuf> {
        let mut left: Vec<PathBuf> = self
            .names()
            .flat_map(|names| [names.shadow_index(), names.empty_index()])
            .collect();
        left.push(self.lock_path());
        left.push(self.barrier_path().to_path_buf());
        left.retain(|path| path.exists());
        left
    }

    /// Drop the shadows and the lock without promotion.
    pub fn discard(&self) -> Result<()> {
        self.remove_shadows()?;
        self.unlock()?;
        info!("Discarded shadow files in {}", self.db_dir.display());
        Ok(())
    }

    /// Finish or undo whatever a previous run left behind.
    pub fn recover(&self) -> Result<Recovery> {
        if self.barrier_path().exists() {
            warn!("Commit marker {} found, resuming promotion", self.barrier_path().display());
            self.promote()?;
            return Ok(Recovery::Promoted);
        }
        if self.lock_path().exists() {
            warn!("Stale write lock {} found, rolling back", self.lock_path().display());
            self.discard()?;
            return Ok(Recovery::RolledBack);
        }
        Ok(Recovery::Clean)
    }

    fn copy_shadows(&self) -> Result<()> {
        for names in self.names() {
            let shadow = names.shadow_index();
            if !shadow.exists() {
                continue;
            }
            let bytes = fs::read(&shadow).map_err(DispatchError::io("read_shadow", &shadow))?;
            write_atomic(&names.index(), &bytes)?;
        }
        Ok(())
    }

    fn remove_shadows(&self) -> Result<()> {
        for names in self.names() {
            remove_if_exists(&names.shadow_index(), "remove_shadow")?;
            remove_if_exists(&names.empty_index(), "remove_empty")?;
        }
        Ok(())
    }
}

fn remove_if_exists(path: &Path, origin: &'static str) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DispatchError::io(origin, path)(e)),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};
    use tessera_blocks::index::EmptyBlocks;
    use tessera_blocks::{BlockStore, StoreConfig};

    fn setup() -> (TempDir, ShadowFiles) {
        let dir = tempdir().expect("tempdir");
        let files = ShadowFiles::new(
            dir.path(),
            dir.path().join("osm.shadow"),
            &["nodes".to_string(), "ways".to_string()],
        );
        (dir, files)
    }

    fn seed(dir: &Path, trunk: &str, keys: &[u32]) {
        let mut store =
            BlockStore::<u32>::open(dir, trunk, StoreConfig::new(256)).expect("open store");
        for &key in keys {
            store.insert_block(key, b"value", 0).expect("insert");
        }
        store.persist().expect("persist");
    }

    #[test]
    fn test_lock_is_exclusive_and_reentrant() {
        let (_dir, files) = setup();
        assert!(files.lock(10).expect("lock"));
        assert_eq!(files.lock_holder().expect("holder"), Some(10));
        assert!(!files.lock(10).expect("reentrant"));
        assert!(matches!(
            files.lock(11),
            Err(DispatchError::LockHeld { pid: 10 })
        ));
        files.unlock().expect("unlock");
        assert_eq!(files.lock_holder().expect("holder"), None);
    }

    #[test]
    fn test_snapshot_writes_shadow_and_empty() {
        let (dir, files) = setup();
        seed(dir.path(), "nodes", &[1, 2, 3]);
        files.snapshot(&Footprint::default()).expect("snapshot");

        let names = FileNames::new(dir.path(), "nodes");
        assert_eq!(
            fs::read(names.shadow_index()).expect("shadow"),
            fs::read(names.index()).expect("main")
        );
        assert!(names.empty_index().exists());
        // ways has no index yet
        assert!(!FileNames::new(dir.path(), "ways").shadow_index().exists());
    }

    #[test]
    fn test_snapshot_keeps_held_blocks_out_of_reuse() {
        let (dir, files) = setup();
        seed(dir.path(), "nodes", &[1, 2, 3]);
        let before = files.footprint().expect("footprint");
        assert_eq!(before.used("nodes"), &[(0, 1), (1, 1), (2, 1)]);

        // Key 2 goes away in a commit while a reader still holds `before`
        files.lock(42).expect("lock");
        files.snapshot(&Footprint::default()).expect("snapshot");
        let config = StoreConfig::new(256);
        let mut writer =
            BlockStore::<u32>::open_shadow(dir.path(), "nodes", config.clone()).expect("shadow");
        let id = writer.index().find(&2).expect("key 2").id();
        writer.erase_block(&id).expect("erase");
        writer.persist().expect("persist");
        drop(writer);
        files.promote().expect("promote");

        let names = FileNames::new(dir.path(), "nodes");
        files.lock(43).expect("lock");
        files.snapshot(&Footprint::default()).expect("snapshot");
        let free = EmptyBlocks::read_from(&names.empty_index()).expect("empty");
        assert_eq!(free.gaps, vec![(1, 1)]);
        files.discard().expect("discard");

        files.lock(43).expect("lock");
        files.snapshot(&before).expect("snapshot");
        let held = EmptyBlocks::read_from(&names.empty_index()).expect("empty");
        assert!(held.gaps.is_empty());
        assert_eq!(held.block_count, 3);
    }

    #[test]
    fn test_writer_commit_reaches_main_index() {
        let (dir, files) = setup();
        seed(dir.path(), "nodes", &[1, 2]);
        files.lock(42).expect("lock");
        files.snapshot(&Footprint::default()).expect("snapshot");

        let config = StoreConfig::new(256);
        let mut writer =
            BlockStore::<u32>::open_shadow(dir.path(), "nodes", config.clone()).expect("shadow");
        writer.insert_block(3, b"new", 0).expect("insert");
        writer.persist().expect("persist");

        let reader = BlockStore::<u32>::open(dir.path(), "nodes", config.clone()).expect("main");
        assert_eq!(reader.index().len(), 2);

        files.promote().expect("promote");
        let reader = BlockStore::<u32>::open(dir.path(), "nodes", config).expect("main");
        assert_eq!(reader.index().len(), 3);
        assert!(!files.lock_path().exists());
        assert!(!files.barrier_path().exists());
        assert!(!FileNames::new(dir.path(), "nodes").shadow_index().exists());
    }

    #[test]
    fn test_recover_resumes_promotion() {
        let (dir, files) = setup();
        seed(dir.path(), "nodes", &[1]);
        files.lock(42).expect("lock");
        files.snapshot(&Footprint::default()).expect("snapshot");
        let names = FileNames::new(dir.path(), "nodes");
        fs::write(names.shadow_index(), b"promoted").expect("fake shadow");
        File::create(files.barrier_path()).expect("barrier");

        assert_eq!(files.recover().expect("recover"), Recovery::Promoted);
        assert_eq!(fs::read(names.index()).expect("main"), b"promoted");
        assert!(!files.lock_path().exists());
        assert!(!files.barrier_path().exists());
    }

    #[test]
    fn test_recover_rolls_back_uncommitted() {
        let (dir, files) = setup();
        seed(dir.path(), "nodes", &[1]);
        let names = FileNames::new(dir.path(), "nodes");
        let before = fs::read(names.index()).expect("main");
        files.lock(42).expect("lock");
        files.snapshot(&Footprint::default()).expect("snapshot");
        fs::write(names.shadow_index(), b"never committed").expect("fake shadow");

        assert_eq!(files.recover().expect("recover"), Recovery::RolledBack);
        assert_eq!(fs::read(names.index()).expect("main"), before);
        assert!(!names.shadow_index().exists());
        assert_eq!(files.recover().expect("again"), Recovery::Clean);
    }
}
