//! Test fixtures.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A temporary directory of definition documents, removed on drop.
#[derive(Debug)]
pub struct DefinitionDir {
    dir: TempDir,
}

impl DefinitionDir {
    /// Creates an empty directory.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create temp dir"),
        }
    }

    /// The directory, for use as a search path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes `file_name` (e.g. `ebook.yaml`) and returns its path.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    pub fn write(&self, file_name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(file_name);
        fs::write(&path, content).expect("write definition");
        path
    }
}

impl Default for DefinitionDir {
    fn default() -> Self {
        Self::new()
    }
}
