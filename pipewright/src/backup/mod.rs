//! Backup and restore of pipeline state.
//!
//! A backup stages each configured [`BackupSource`] into a scratch
//! directory, writes a [`Manifest`], compresses everything into
//! `<id>.tar.gz` and records a `<id>.json` sidecar with the archive's size
//! and SHA-256. Archives are optionally replicated to an [`ObjectStore`].
//!
//! Missing or failing categories are recorded in the manifest and never
//! abort the backup. Restores rename live paths aside instead of deleting
//! them, so every restore has its own way back.
//!
//! The manager takes no pipeline lock. Callers must not run a backup
//! concurrently with a restore of the same target.

mod archive;
mod manifest;
mod offsite;
mod retention;

pub use archive::{copy_tree, create_archive, extract_archive, sha256_file, stage_source};
pub use manifest::{
    BackupRecord, CategoryEntry, CategoryFailure, EntryKind, Manifest, SystemInfo, MANIFEST_FILE,
};
#[cfg(feature = "s3")]
pub use offsite::HttpObjectStore;
pub use offsite::{DirectoryStore, ObjectStore};
pub use retention::expired;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{BackupConfig, OffsiteConfig};
use crate::definition::is_valid_identifier;
use crate::errors::{NotFoundError, PipewrightError, Result};

const ID_TIMESTAMP: &str = "%Y%m%dT%H%M%S%.6fZ";
const ASIDE_TIMESTAMP: &str = "%Y%m%dT%H%M%SZ";

/// Backup kind; each kind has its own retention count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// Scheduled hourly.
    Hourly,
    /// Scheduled daily.
    Daily,
    /// Scheduled weekly.
    Weekly,
    /// Scheduled monthly.
    Monthly,
    /// Taken on request.
    Manual,
    /// Safety backup taken before a restore.
    PreRestore,
}

impl BackupKind {
    /// All kinds.
    pub const ALL: [Self; 6] = [
        Self::Hourly,
        Self::Daily,
        Self::Weekly,
        Self::Monthly,
        Self::Manual,
        Self::PreRestore,
    ];

    /// The kind's identifier as used in backup IDs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Manual => "manual",
            Self::PreRestore => "pre_restore",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = PipewrightError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| PipewrightError::Config(format!("unknown backup kind '{s}'")))
    }
}

/// A named content root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSource {
    /// Category name.
    pub name: String,
    /// File or directory to back up.
    pub path: PathBuf,
}

impl BackupSource {
    /// Creates a source.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Per-call backup options.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Replaces the configured sources for this backup.
    pub sources: Option<Vec<BackupSource>>,
    /// Replicate to the off-box store when one is configured.
    pub upload: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            sources: None,
            upload: true,
        }
    }
}

/// Outcome of [`BackupManager::create_backup`].
#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    /// Backup ID.
    pub id: String,
    /// Local archive path.
    pub archive_path: PathBuf,
    /// Archive size in bytes.
    pub size: u64,
    /// Hex SHA-256 of the archive.
    pub sha256: String,
    /// The archive's manifest.
    pub manifest: Manifest,
    /// Whether the archive reached the off-box store.
    pub uploaded: bool,
    /// Why the upload failed, if it did.
    pub upload_error: Option<String>,
    /// IDs removed by retention.
    pub pruned: Vec<String>,
}

/// Per-call restore options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreOptions {
    /// Restore into `<target_root>/<category>` instead of live locations.
    pub target_root: Option<PathBuf>,
    /// Only restore these categories.
    pub categories: Option<Vec<String>>,
    /// Take a `pre_restore` backup first. Ignored with `target_root`.
    pub safety_backup: bool,
    /// Check the archive against its recorded SHA-256.
    pub verify_checksum: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            target_root: None,
            categories: None,
            safety_backup: true,
            verify_checksum: true,
        }
    }
}

/// Where a backup was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupLocation {
    /// Only in the local backup directory.
    Local,
    /// Only in the off-box store.
    Offsite,
    /// In both.
    Both,
}

impl BackupLocation {
    fn has_local(self) -> bool {
        matches!(self, Self::Local | Self::Both)
    }

    fn has_offsite(self) -> bool {
        matches!(self, Self::Offsite | Self::Both)
    }
}

/// A restored category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoredCategory {
    /// Category name.
    pub name: String,
    /// Where the content was written.
    pub destination: PathBuf,
    /// Where the previous content was moved, if anything was there.
    pub aside: Option<PathBuf>,
}

/// A category that failed to restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreFailure {
    /// Category name.
    pub name: String,
    /// What went wrong.
    pub error: String,
    /// The renamed-aside previous content, left intact for manual recovery.
    pub aside: Option<PathBuf>,
}

/// Outcome of [`BackupManager::restore_backup`].
#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    /// Restored backup ID.
    pub id: String,
    /// Where the archive came from.
    pub source: BackupLocation,
    /// ID of the safety backup taken first.
    pub safety_backup: Option<String>,
    /// Restored categories.
    pub restored: Vec<RestoredCategory>,
    /// Requested categories absent from the manifest.
    pub skipped: Vec<String>,
    /// Categories that failed.
    pub failed: Vec<RestoreFailure>,
}

impl RestoreResult {
    /// True when every selected category was restored.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    /// Backup ID.
    pub id: String,
    /// Backup kind.
    pub kind: BackupKind,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Archive size, when a local sidecar is available.
    pub size: Option<u64>,
    /// Where the backup lives.
    pub location: BackupLocation,
}

/// Filter for [`BackupManager::list_backups`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Only this kind.
    pub kind: Option<BackupKind>,
    /// Only backups created at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Only backups present at this location (`Both` matches only `Both`).
    pub location: Option<BackupLocation>,
}

impl ListFilter {
    /// Filter on `kind`.
    #[must_use]
    pub fn kind(kind: BackupKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    fn matches(&self, info: &BackupInfo) -> bool {
        self.kind.map_or(true, |k| k == info.kind)
            && self.since.map_or(true, |s| info.created_at >= s)
            && self.location.map_or(true, |l| match l {
                BackupLocation::Local => info.location.has_local(),
                BackupLocation::Offsite => info.location.has_offsite(),
                BackupLocation::Both => info.location == BackupLocation::Both,
            })
    }
}

/// Splits a backup ID into its kind and timestamp.
#[must_use]
pub fn parse_backup_id(id: &str) -> Option<(BackupKind, DateTime<Utc>)> {
    BackupKind::ALL.into_iter().find_map(|kind| {
        let rest = id.strip_prefix(kind.as_str())?.strip_prefix('-')?;
        let stamp = rest.get(..23)?;
        let naive = NaiveDateTime::parse_from_str(stamp.strip_suffix('Z')?, "%Y%m%dT%H%M%S%.6f").ok()?;
        Some((kind, naive.and_utc()))
    })
}

/// Collision counter of a backup ID: `0` for the base ID, `N` for `-N`.
#[must_use]
pub fn id_sequence(id: &str) -> u32 {
    BackupKind::ALL
        .into_iter()
        .find_map(|kind| {
            let rest = id.strip_prefix(kind.as_str())?.strip_prefix('-')?;
            rest.get(23..)
        })
        .and_then(|tail| tail.strip_prefix('-'))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn is_valid_backup_id(id: &str) -> bool {
    !id.is_empty()
        && !id.contains("..")
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn blocking_err(e: tokio::task::JoinError) -> PipewrightError {
    PipewrightError::Archive(e.to_string())
}

/// Creates, restores, lists and prunes backups.
pub struct BackupManager {
    config: BackupConfig,
    store: Option<Arc<dyn ObjectStore>>,
    prefix: String,
}

impl fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupManager")
            .field("backup_dir", &self.config.backup_dir)
            .field("store", &self.store.as_ref().map(|s| s.describe()))
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl BackupManager {
    /// Manager for `config`. An off-box section with an endpoint uses the
    /// HTTP store (feature `s3`); without one the bucket is a directory.
    pub fn new(config: BackupConfig) -> Result<Self> {
        let mut store: Option<Arc<dyn ObjectStore>> = None;
        let mut prefix = String::new();
        if let Some(offsite) = &config.offsite {
            store = Some(Self::store_for(offsite)?);
            prefix.clone_from(&offsite.prefix);
        }
        Ok(Self {
            config,
            store,
            prefix,
        })
    }

    fn store_for(offsite: &OffsiteConfig) -> Result<Arc<dyn ObjectStore>> {
        match &offsite.endpoint {
            None => Ok(Arc::new(DirectoryStore::new(&offsite.bucket))),
            #[cfg(feature = "s3")]
            Some(endpoint) => Ok(Arc::new(HttpObjectStore::new(
                endpoint,
                offsite.bucket.clone(),
                offsite.token.clone(),
            )?)),
            #[cfg(not(feature = "s3"))]
            Some(_) => Err(PipewrightError::Config(
                "backup.offsite.endpoint requires the `s3` feature".to_string(),
            )),
        }
    }

    /// Replaces the off-box store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        self.store = Some(store);
        self.prefix = prefix.into();
        self
    }

    /// The local backup directory.
    #[must_use]
    pub fn backup_dir(&self) -> &Path {
        &self.config.backup_dir
    }

    fn archive_path(&self, id: &str) -> PathBuf {
        self.config.backup_dir.join(format!("{id}.tar.gz"))
    }

    fn sidecar_path(&self, id: &str) -> PathBuf {
        self.config.backup_dir.join(format!("{id}.json"))
    }

    fn object_key(&self, file: &str) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            file.to_string()
        } else {
            format!("{prefix}/{file}")
        }
    }

    fn list_prefix(&self) -> String {
        self.object_key("")
    }

    fn partial_path(&self, id: &str) -> PathBuf {
        self.config.backup_dir.join(format!("{id}.tar.gz.partial"))
    }

    /// Picks a free ID and claims it by creating its `.partial` file, so
    /// concurrent backups of one kind never share an ID.
    fn claim_id(&self, kind: BackupKind, now: DateTime<Utc>) -> Result<String> {
        let base = format!("{kind}-{}", now.format(ID_TIMESTAMP));
        let mut id = base.clone();
        let mut n = 0u32;
        loop {
            if !self.archive_path(&id).exists() && !self.sidecar_path(&id).exists() {
                match std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(self.partial_path(&id))
                {
                    Ok(_) => return Ok(id),
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(e.into()),
                }
            }
            n += 1;
            id = format!("{base}-{n}");
        }
    }

    /// Creates a backup of `kind`, uploads it when possible and applies
    /// retention for `kind`.
    pub async fn create_backup(&self, kind: BackupKind, options: BackupOptions) -> Result<BackupResult> {
        tokio::fs::create_dir_all(&self.config.backup_dir).await?;

        let now = Utc::now();
        let id = self.claim_id(kind, now)?;
        let sources = options.sources.unwrap_or_else(|| self.config.sources.clone());
        let archive_path = self.archive_path(&id);
        let partial = self.partial_path(&id);
        let claimed = partial.clone();

        info!(backup = %id, sources = sources.len(), "Creating backup");

        let blocking_id = id.clone();
        let blocking_archive = archive_path.clone();
        let built = tokio::task::spawn_blocking(move || -> Result<_> {
            let staging = tempfile::Builder::new().prefix("pipewright-backup-").tempdir()?;

            let mut manifest = Manifest {
                id: blocking_id,
                kind,
                created_at: now,
                version: env!("CARGO_PKG_VERSION").to_string(),
                system: SystemInfo::collect(),
                categories: Vec::new(),
                missing: Vec::new(),
                failed: Vec::new(),
            };

            for source in &sources {
                match stage_source(source, staging.path()) {
                    Ok(Some(entry)) => {
                        debug!(category = %entry.name, files = entry.files, bytes = entry.bytes, "Category staged");
                        manifest.categories.push(entry);
                    }
                    Ok(None) => {
                        warn!(category = %source.name, path = %source.path.display(), "Backup source missing");
                        manifest.missing.push(source.name.clone());
                    }
                    Err(e) => {
                        warn!(category = %source.name, error = %e, "Backup source failed");
                        let _ = std::fs::remove_dir_all(staging.path().join(&source.name));
                        manifest.failed.push(CategoryFailure {
                            name: source.name.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }

            std::fs::write(
                staging.path().join(MANIFEST_FILE),
                serde_json::to_vec_pretty(&manifest)?,
            )?;

            create_archive(staging.path(), &partial).map_err(|e| PipewrightError::Archive(e.to_string()))?;
            std::fs::rename(&partial, &blocking_archive)?;

            let size = std::fs::metadata(&blocking_archive)?.len();
            let sha256 = sha256_file(&blocking_archive)?;
            Ok((manifest, size, sha256))
        })
        .await
        .map_err(blocking_err)
        .and_then(|built| built);
        if built.is_err() {
            let _ = tokio::fs::remove_file(&claimed).await;
        }
        let (manifest, size, sha256) = built?;

        let record = BackupRecord {
            manifest: manifest.clone(),
            archive_size: size,
            sha256: sha256.clone(),
        };
        let sidecar = self.sidecar_path(&id);
        tokio::fs::write(&sidecar, serde_json::to_vec_pretty(&record)?).await?;

        let (uploaded, upload_error) = match (&self.store, options.upload) {
            (Some(store), true) => match self.upload(store.as_ref(), &id, &archive_path, &sidecar).await {
                Ok(()) => (true, None),
                Err(e) => {
                    warn!(backup = %id, store = %store.describe(), error = %e, "Off-box upload failed");
                    (false, Some(e.to_string()))
                }
            },
            _ => (false, None),
        };

        let pruned = match self.prune(kind).await {
            Ok(pruned) => pruned,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Retention pruning failed");
                Vec::new()
            }
        };

        info!(
            backup = %id,
            size,
            categories = manifest.categories.len(),
            missing = manifest.missing.len(),
            uploaded,
            "Backup created"
        );

        Ok(BackupResult {
            id,
            archive_path,
            size,
            sha256,
            manifest,
            uploaded,
            upload_error,
            pruned,
        })
    }

    async fn upload(&self, store: &dyn ObjectStore, id: &str, archive: &Path, sidecar: &Path) -> Result<()> {
        store.put(&self.object_key(&format!("{id}.tar.gz")), archive).await?;
        store.put(&self.object_key(&format!("{id}.json")), sidecar).await
    }

    async fn read_record(path: &Path) -> Option<BackupRecord> {
        let bytes = tokio::fs::read(path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Ignoring unreadable sidecar");
                None
            }
        }
    }

    async fn local_records(&self) -> Result<Vec<BackupRecord>> {
        let mut records = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.config.backup_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = Self::read_record(&path).await {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Lists local and off-box backups, newest first.
    pub async fn list_backups(&self, filter: &ListFilter) -> Result<Vec<BackupInfo>> {
        let mut merged: BTreeMap<String, BackupInfo> = BTreeMap::new();

        for record in self.local_records().await? {
            let manifest = record.manifest;
            merged.insert(
                manifest.id.clone(),
                BackupInfo {
                    id: manifest.id,
                    kind: manifest.kind,
                    created_at: manifest.created_at,
                    size: Some(record.archive_size),
                    location: BackupLocation::Local,
                },
            );
        }

        if let Some(store) = &self.store {
            match store.list(&self.list_prefix()).await {
                Ok(keys) => {
                    for key in keys {
                        let file = key.rsplit('/').next().unwrap_or(&key);
                        let Some(id) = file.strip_suffix(".json") else {
                            continue;
                        };
                        if let Some(info) = merged.get_mut(id) {
                            info.location = BackupLocation::Both;
                        } else if let Some((kind, created_at)) = parse_backup_id(id) {
                            merged.insert(
                                id.to_string(),
                                BackupInfo {
                                    id: id.to_string(),
                                    kind,
                                    created_at,
                                    size: None,
                                    location: BackupLocation::Offsite,
                                },
                            );
                        }
                    }
                }
                Err(e) => warn!(store = %store.describe(), error = %e, "Off-box listing failed"),
            }
        }

        let mut backups: Vec<_> = merged.into_values().filter(|b| filter.matches(b)).collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(backups)
    }

    /// Keeps the newest N backups of `kind` and deletes the rest locally
    /// and off-box. Returns the deleted IDs.
    pub async fn prune(&self, kind: BackupKind) -> Result<Vec<String>> {
        let keep = self.config.retention.keep(kind);
        let backups = self.list_backups(&ListFilter::kind(kind)).await?;

        let mut pruned = Vec::new();
        for backup in expired(backups, keep) {
            if backup.location.has_local() {
                for path in [self.archive_path(&backup.id), self.sidecar_path(&backup.id)] {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            if let Some(store) = &self.store {
                store.delete(&self.object_key(&format!("{}.tar.gz", backup.id))).await?;
                store.delete(&self.object_key(&format!("{}.json", backup.id))).await?;
            }
            debug!(backup = %backup.id, "Backup pruned");
            pruned.push(backup.id);
        }

        if !pruned.is_empty() {
            info!(kind = %kind, keep, pruned = pruned.len(), "Retention applied");
        }
        Ok(pruned)
    }

    /// Recomputes a local archive's SHA-256 and compares it with its sidecar.
    pub async fn verify_backup(&self, id: &str) -> Result<bool> {
        let archive = self.archive_path(id);
        let sidecar = self.sidecar_path(id);
        if !is_valid_backup_id(id) || !archive.exists() {
            return Err(NotFoundError::new("backup", id)
                .with_searched(vec![self.config.backup_dir.display().to_string()])
                .into());
        }
        let record = Self::read_record(&sidecar)
            .await
            .ok_or_else(|| PipewrightError::Archive(format!("no readable sidecar for backup '{id}'")))?;
        let actual = tokio::task::spawn_blocking(move || sha256_file(&archive))
            .await
            .map_err(blocking_err)??;
        Ok(actual == record.sha256)
    }

    /// Finds the archive locally, then off-box (downloading into `scratch`).
    async fn locate(&self, id: &str, scratch: &Path) -> Result<(PathBuf, Option<BackupRecord>, BackupLocation)> {
        let local = self.archive_path(id);
        if tokio::fs::try_exists(&local).await? {
            let record = Self::read_record(&self.sidecar_path(id)).await;
            return Ok((local, record, BackupLocation::Local));
        }

        let mut searched = vec![self.config.backup_dir.display().to_string()];
        if let Some(store) = &self.store {
            searched.push(store.describe());
            let archive = scratch.join(format!("{id}.tar.gz"));
            match store.get(&self.object_key(&format!("{id}.tar.gz")), &archive).await {
                Ok(()) => {
                    let sidecar = scratch.join(format!("{id}.json"));
                    let record = match store.get(&self.object_key(&format!("{id}.json")), &sidecar).await {
                        Ok(()) => Self::read_record(&sidecar).await,
                        Err(e) => {
                            debug!(backup = %id, error = %e, "Off-box sidecar unavailable");
                            None
                        }
                    };
                    info!(backup = %id, store = %store.describe(), "Archive downloaded");
                    return Ok((archive, record, BackupLocation::Offsite));
                }
                Err(PipewrightError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Err(NotFoundError::new("backup", id).with_searched(searched).into())
    }

    /// Restores backup `id`.
    ///
    /// Every live path that would be overwritten is first renamed to
    /// `<path>.pre-restore-<timestamp>`. A failing safety backup aborts the
    /// restore before anything is touched.
    pub async fn restore_backup(&self, id: &str, options: RestoreOptions) -> Result<RestoreResult> {
        if !is_valid_backup_id(id) {
            return Err(NotFoundError::new("backup", id).into());
        }

        let scratch = tempfile::Builder::new().prefix("pipewright-restore-").tempdir()?;
        let (archive, record, source) = self.locate(id, scratch.path()).await?;

        if options.verify_checksum {
            match &record {
                Some(record) => {
                    let path = archive.clone();
                    let actual = tokio::task::spawn_blocking(move || sha256_file(&path))
                        .await
                        .map_err(blocking_err)??;
                    if actual != record.sha256 {
                        error!(backup = %id, expected = %record.sha256, actual = %actual, "Checksum mismatch");
                        return Err(PipewrightError::Archive(format!(
                            "checksum mismatch for backup '{id}': expected {}, found {actual}",
                            record.sha256
                        )));
                    }
                }
                None => warn!(backup = %id, "No sidecar found, skipping checksum verification"),
            }
        }

        let safety_backup = if options.safety_backup && options.target_root.is_none() {
            let safety = self
                .create_backup(BackupKind::PreRestore, BackupOptions::default())
                .await
                .map_err(|e| {
                    error!(backup = %id, error = %e, "Safety backup failed, restore aborted");
                    e
                })?;
            Some(safety.id)
        } else {
            None
        };

        let extract_dir = scratch.path().join("extract");
        let blocking_archive = archive.clone();
        let blocking_extract = extract_dir.clone();
        tokio::task::spawn_blocking(move || extract_archive(&blocking_archive, &blocking_extract))
            .await
            .map_err(blocking_err)?
            .map_err(|e| PipewrightError::Archive(e.to_string()))?;

        let manifest: Manifest = serde_json::from_slice(&tokio::fs::read(extract_dir.join(MANIFEST_FILE)).await?)?;

        let selected: Vec<CategoryEntry> = match &options.categories {
            Some(names) => manifest
                .categories
                .iter()
                .filter(|c| names.contains(&c.name))
                .cloned()
                .collect(),
            None => manifest.categories.clone(),
        };
        let skipped: Vec<String> = options
            .categories
            .iter()
            .flatten()
            .filter(|name| manifest.category(name).is_none())
            .cloned()
            .collect();
        for name in &skipped {
            warn!(backup = %id, category = %name, "Requested category not in backup");
        }

        let target_root = options.target_root.clone();
        let stamp = Utc::now().format(ASIDE_TIMESTAMP).to_string();
        let (restored, failed) = tokio::task::spawn_blocking(move || {
            let mut restored = Vec::new();
            let mut failed = Vec::new();
            for entry in selected {
                match restore_category(&entry, &extract_dir, target_root.as_deref(), &stamp) {
                    Ok(done) => restored.push(done),
                    Err(failure) => failed.push(failure),
                }
            }
            (restored, failed)
        })
        .await
        .map_err(blocking_err)?;

        for failure in &failed {
            error!(
                backup = %id,
                category = %failure.name,
                error = %failure.error,
                aside = ?failure.aside,
                "Category restore failed"
            );
        }
        info!(backup = %id, restored = restored.len(), failed = failed.len(), "Restore finished");

        Ok(RestoreResult {
            id: id.to_string(),
            source,
            safety_backup,
            restored,
            skipped,
            failed,
        })
    }
}

/// Restores one category from an extracted archive. Blocking.
fn restore_category(
    entry: &CategoryEntry,
    extract_dir: &Path,
    target_root: Option<&Path>,
    stamp: &str,
) -> std::result::Result<RestoredCategory, RestoreFailure> {
    let fail = |error: String, aside: Option<PathBuf>| RestoreFailure {
        name: entry.name.clone(),
        error,
        aside,
    };
    if !is_valid_identifier(&entry.name) {
        return Err(fail(format!("invalid category name '{}'", entry.name), None));
    }
    let staged_dir = extract_dir.join(&entry.name);

    let (staged, destination) = match entry.kind {
        EntryKind::Directory => {
            let dest = target_root.map_or_else(|| entry.source.clone(), |root| root.join(&entry.name));
            (staged_dir, dest)
        }
        EntryKind::File => {
            let Some(file_name) = entry.source.file_name() else {
                return Err(fail(format!("{} has no file name", entry.source.display()), None));
            };
            let dest = target_root.map_or_else(
                || entry.source.clone(),
                |root| root.join(&entry.name).join(file_name),
            );
            (staged_dir.join(file_name), dest)
        }
    };

    let aside = if destination.symlink_metadata().is_ok() {
        let mut aside_name = destination.clone().into_os_string();
        aside_name.push(format!(".pre-restore-{stamp}"));
        let aside = PathBuf::from(aside_name);
        std::fs::rename(&destination, &aside).map_err(|e| fail(format!("rename aside: {e}"), None))?;
        Some(aside)
    } else {
        None
    };

    let copied = match entry.kind {
        EntryKind::Directory => copy_tree(&staged, &destination).map(|_| ()),
        EntryKind::File => destination
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| std::fs::copy(&staged, &destination).map(|_| ())),
    };

    match copied {
        Ok(()) => {
            debug!(category = %entry.name, destination = %destination.display(), "Category restored");
            Ok(RestoredCategory {
                name: entry.name.clone(),
                destination,
                aside,
            })
        }
        Err(e) => Err(fail(e.to_string(), aside)),
    }
}
