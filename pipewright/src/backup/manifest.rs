//! Backup manifest and sidecar record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use sysinfo::System;

use super::BackupKind;

/// File name of the manifest inside every archive.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Host details captured at backup time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Host name.
    pub hostname: String,
    /// OS name.
    pub os_name: Option<String>,
    /// OS version.
    pub os_version: Option<String>,
    /// Kernel version.
    pub kernel_version: Option<String>,
    /// Logical CPUs.
    pub cpus: usize,
}

impl SystemInfo {
    /// Collects details for the current host.
    #[must_use]
    pub fn collect() -> Self {
        Self {
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            os_name: System::name(),
            os_version: System::os_version(),
            kernel_version: System::kernel_version(),
            cpus: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
        }
    }
}

/// Whether a category was a single file or a directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// A single file.
    File,
    /// A directory tree.
    Directory,
}

/// One category included in a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryEntry {
    /// Category name.
    pub name: String,
    /// Live path the content was taken from.
    pub source: PathBuf,
    /// File or directory.
    pub kind: EntryKind,
    /// Number of files.
    pub files: u64,
    /// Total bytes.
    pub bytes: u64,
}

/// A category that could not be included or restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryFailure {
    /// Category name.
    pub name: String,
    /// What went wrong.
    pub error: String,
}

/// What a backup contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Backup ID.
    pub id: String,
    /// Backup kind.
    pub kind: BackupKind,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Crate version that wrote the backup.
    pub version: String,
    /// Host details.
    pub system: SystemInfo,
    /// Included categories.
    pub categories: Vec<CategoryEntry>,
    /// Configured categories whose source did not exist.
    pub missing: Vec<String>,
    /// Categories that failed to stage.
    pub failed: Vec<CategoryFailure>,
}

impl Manifest {
    /// Looks up an included category.
    #[must_use]
    pub fn category(&self, name: &str) -> Option<&CategoryEntry> {
        self.categories.iter().find(|c| c.name == name)
    }
}

/// The `<id>.json` sidecar stored next to each archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// The archive's manifest.
    pub manifest: Manifest,
    /// Archive size in bytes.
    pub archive_size: u64,
    /// Hex SHA-256 of the archive.
    pub sha256: String,
}
