//! Names of the files that make up one block store.

use std::path::{Path, PathBuf};

/// Data file suffix.
pub const DATA_SUFFIX: &str = ".bin";
/// Index file suffix, appended to the data file name.
pub const INDEX_SUFFIX: &str = ".idx";
/// Writer's private index copy.
pub const SHADOW_SUFFIX: &str = ".shadow";
/// Empty-block index computed when a write starts.
pub const EMPTY_SUFFIX: &str = ".empty";

/// Paths of one store's files inside a database directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNames {
    dir: PathBuf,
    trunk: String,
}

impl FileNames {
    /// Files for `trunk` inside `dir`.
    pub fn new(dir: impl AsRef<Path>, trunk: impl Into<String>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            trunk: trunk.into(),
        }
    }

    /// Database directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store name without suffixes.
    pub fn trunk(&self) -> &str {
        &self.trunk
    }

    /// `<trunk>.bin`
    pub fn data(&self) -> PathBuf {
        self.dir.join(format!("{}{DATA_SUFFIX}", self.trunk))
    }

    /// `<trunk>.bin.idx`
    pub fn index(&self) -> PathBuf {
        self.dir
            .join(format!("{}{DATA_SUFFIX}{INDEX_SUFFIX}", self.trunk))
    }

    /// `<trunk>.bin.idx.shadow`
    pub fn shadow_index(&self) -> PathBuf {
        self.dir.join(format!(
            "{}{DATA_SUFFIX}{INDEX_SUFFIX}{SHADOW_SUFFIX}",
            self.trunk
        ))
    }

    /// `<trunk>.bin.idx.empty`
    pub fn empty_index(&self) -> PathBuf {
        self.dir.join(format!(
            "{}{DATA_SUFFIX}{INDEX_SUFFIX}{EMPTY_SUFFIX}",
            self.trunk
        ))
    }

    /// Index the writer works on: the shadow in shadow mode, else the main one.
    pub fn active_index(&self, shadow: bool) -> PathBuf {
        if shadow {
            self.shadow_index()
        } else {
            self.index()
        }
    }
}

/// Sibling path with `suffix` appended.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let names = FileNames::new("/db", "ways");
        assert_eq!(names.data(), PathBuf::from("/db/ways.bin"));
        assert_eq!(names.index(), PathBuf::from("/db/ways.bin.idx"));
        assert_eq!(names.shadow_index(), PathBuf::from("/db/ways.bin.idx.shadow"));
        assert_eq!(names.empty_index(), PathBuf::from("/db/ways.bin.idx.empty"));
        assert_eq!(names.active_index(true), names.shadow_index());
    }

    #[test]
    fn test_with_suffix() {
        assert_eq!(
            with_suffix(Path::new("/db/ways.bin.idx"), ".tmp"),
            PathBuf::from("/db/ways.bin.idx.tmp")
        );
    }
}
