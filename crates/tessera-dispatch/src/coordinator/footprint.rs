//! Index versions pinned by readers.
//!
//! A reader keeps using the blocks of the index it loaded until it reports
//! `READ_FINISHED` or goes away, even after later commits release them.
//! Every commit starts a new version. An admitted reader pins the version
//! that was current at admission, and a writer may only reuse blocks that
//! no pinned version references.

use std::collections::BTreeMap;

/// Referenced block ranges of the controlled trunks in one index version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Footprint {
    used: BTreeMap<String, Vec<(u32, u32)>>,
}

impl Footprint {
    /// Record `ranges` as used in `trunk`.
    pub fn insert(
        &mut self,
        trunk: impl Into<String>,
        ranges: impl IntoIterator<Item = (u32, u32)>,
    ) {
        self.used.entry(trunk.into()).or_default().extend(ranges);
    }

    /// Used ranges of `trunk`, unordered.
    pub fn used(&self, trunk: &str) -> &[(u32, u32)] {
        self.used.get(trunk).map_or(&[][..], Vec::as_slice)
    }

    /// Add every range of `other`.
    pub fn merge(&mut self, other: &Self) {
        for (trunk, ranges) in &other.used {
            self.insert(trunk.as_str(), ranges.iter().copied());
        }
    }

    /// Whether no block is referenced.
    pub fn is_empty(&self) -> bool {
        self.used.values().all(Vec::is_empty)
    }
}

#[derive(Debug)]
struct Pinned {
    footprint: Footprint,
    readers: usize,
}

/// Version counter plus the footprints readers still hold.
#[derive(Debug, Default)]
pub struct VersionPins {
    version: u64,
    current: Option<Footprint>,
    pinned: BTreeMap<u64, Pinned>,
    by_pid: BTreeMap<u32, u64>,
}

impl VersionPins {
    /// Start at version zero with the footprint of the main indexes.
    pub fn new(current: Option<Footprint>) -> Self {
        Self {
            current,
            ..Self::default()
        }
    }

    /// Current version.
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Whether the current footprint is known.
    pub const fn has_current(&self) -> bool {
        self.current.is_some()
    }

    /// Cache the footprint of the current version.
    pub fn set_current(&mut self, footprint: Footprint) {
        self.current = Some(footprint);
    }

    /// A commit replaced the main indexes.
    pub fn advance(&mut self, current: Option<Footprint>) {
        self.version += 1;
        self.current = current;
    }

    /// Pin the current version for `pid`. Returns `false` when the
    /// current footprint is unknown.
    pub fn pin(&mut self, pid: u32) -> bool {
        if self.by_pid.contains_key(&pid) {
            return true;
        }
        let Some(current) = &self.current else {
            return false;
        };
        self.pinned
            .entry(self.version)
            .or_insert_with(|| Pinned {
                footprint: current.clone(),
                readers: 0,
            })
            .readers += 1;
        self.by_pid.insert(pid, self.version);
        true
    }

    /// Drop the pin of `pid`, if any.
    pub fn unpin(&mut self, pid: u32) {
        let Some(version) = self.by_pid.remove(&pid) else {
            return;
        };
        if let Some(pinned) = self.pinned.get_mut(&version) {
            pinned.readers -= 1;
            if pinned.readers == 0 {
                self.pinned.remove(&version);
            }
        }
    }

    /// Version pinned by `pid`.
    pub fn version_of(&self, pid: u32) -> Option<u64> {
        self.by_pid.get(&pid).copied()
    }

    /// Number of versions with at least one reader.
    pub fn pinned_versions(&self) -> usize {
        self.pinned.len()
    }

    /// Union of all pinned footprints.
    pub fn held(&self) -> Footprint {
        let mut held = Footprint::default();
        for pinned in self.pinned.values() {
            held.merge(&pinned.footprint);
        }
        held
    }
}
