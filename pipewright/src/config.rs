//! Configuration management.
//!
//! Configuration is layered, later sources winning:
//! - built-in defaults
//! - `$XDG_CONFIG_HOME/pipewright/config.toml`
//! - `./pipewright.toml`
//! - an explicit file passed to [`PipewrightConfig::from_file`]
//! - `PIPEWRIGHT_*` environment variables
//!
//! The resulting config is used once at start-up to build the loader,
//! cache, lock manager and backup manager, which are then passed around
//! explicitly.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::backup::{BackupKind, BackupSource};
use crate::errors::{PipewrightError, Result};
use crate::lock::LockOptions;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipewrightConfig {
    /// Definition lookup.
    #[serde(default)]
    pub definitions: DefinitionsConfig,
    /// Layered cache.
    #[serde(default)]
    pub cache: CacheConfig,
    /// File locks.
    #[serde(default)]
    pub lock: LockOptions,
    /// Backups.
    #[serde(default)]
    pub backup: BackupConfig,
}

/// Where definition documents are looked up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionsConfig {
    /// Directories probed in order.
    #[serde(default = "default_search_paths")]
    pub search_paths: Vec<PathBuf>,
}

impl Default for DefinitionsConfig {
    fn default() -> Self {
        Self {
            search_paths: default_search_paths(),
        }
    }
}

fn default_search_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("pipelines"),
        PipewrightConfig::config_dir().join("pipelines"),
    ]
}

/// Layered cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Prefix applied to every key.
    pub namespace: String,
    /// Maximum entries in the in-process tier.
    pub local_capacity: u64,
    /// Upper bound on in-process entry lifetime.
    pub local_max_ttl_secs: u64,
    /// TTL used when the caller gives none.
    pub default_ttl_secs: u64,
    /// Remote tier URL; `None` disables the remote tier.
    pub redis_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "pipewright".to_string(),
            local_capacity: 10_000,
            local_max_ttl_secs: 300,
            default_ttl_secs: 3_600,
            redis_url: None,
        }
    }
}

impl CacheConfig {
    /// Default TTL as a duration.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Local lifetime cap as a duration.
    #[must_use]
    pub fn local_max_ttl(&self) -> Duration {
        Duration::from_secs(self.local_max_ttl_secs)
    }
}

/// Backups kept per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Hourly backups kept.
    pub hourly: usize,
    /// Daily backups kept.
    pub daily: usize,
    /// Weekly backups kept.
    pub weekly: usize,
    /// Monthly backups kept.
    pub monthly: usize,
    /// Manual backups kept.
    pub manual: usize,
    /// Safety backups taken before a restore.
    pub pre_restore: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            hourly: 24,
            daily: 7,
            weekly: 4,
            monthly: 12,
            manual: 10,
            pre_restore: 5,
        }
    }
}

impl RetentionConfig {
    /// Number of backups of `kind` to keep.
    #[must_use]
    pub fn keep(&self, kind: BackupKind) -> usize {
        match kind {
            BackupKind::Hourly => self.hourly,
            BackupKind::Daily => self.daily,
            BackupKind::Weekly => self.weekly,
            BackupKind::Monthly => self.monthly,
            BackupKind::Manual => self.manual,
            BackupKind::PreRestore => self.pre_restore,
        }
    }
}

/// Off-box object storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsiteConfig {
    /// Bucket name, or a directory path when no endpoint is set.
    pub bucket: String,
    /// Key prefix inside the bucket.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// S3-compatible endpoint URL (requires the `s3` feature).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Bearer token sent to the endpoint.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_prefix() -> String {
    "pipewright-backups".to_string()
}

impl OffsiteConfig {
    /// Off-box settings for `bucket` with default prefix and no endpoint.
    #[must_use]
    pub fn for_bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: default_prefix(),
            endpoint: None,
            token: None,
        }
    }
}

/// Backup settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Where archives and sidecars are written.
    pub backup_dir: PathBuf,
    /// Content roots, each a named category.
    pub sources: Vec<BackupSource>,
    /// Per-kind retention.
    pub retention: RetentionConfig,
    /// Off-box replication.
    pub offsite: Option<OffsiteConfig>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: PipewrightConfig::data_dir().join("backups"),
            sources: vec![
                BackupSource::new("artifacts", "output"),
                BackupSource::new("state", "pipeline-state.json"),
                BackupSource::new("config", "config"),
                BackupSource::new("database", "data"),
            ],
            retention: RetentionConfig::default(),
            offsite: None,
        }
    }
}

impl PipewrightConfig {
    /// Loads configuration from the default locations. Never fails:
    /// unreadable files are logged and skipped.
    pub fn load() -> Self {
        let mut config = Self::default();

        for path in [
            Self::config_dir().join("config.toml"),
            PathBuf::from("pipewright.toml"),
        ] {
            if !path.exists() {
                continue;
            }
            match Self::load_partial_from_path(&path) {
                Ok(partial) => {
                    debug!(path = %path.display(), "Loaded configuration file");
                    config.apply_partial(partial);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Ignoring unreadable configuration file"),
            }
        }

        config.apply_env_overrides();
        config
    }

    /// Loads defaults, then the default locations, then `path`, then the
    /// environment. Fails if `path` cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config = Self::load();
        let partial = Self::load_partial_from_path(path)?;
        config.apply_partial(partial);
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parses a TOML document on top of the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config = Self::default();
        let partial: PartialConfig =
            toml::from_str(content).map_err(|e| PipewrightError::Config(e.to_string()))?;
        config.apply_partial(partial);
        Ok(config)
    }

    /// The per-user data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("pipewright"))
            .unwrap_or_else(|| PathBuf::from(".pipewright"))
    }

    /// The per-user config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("pipewright"))
            .unwrap_or_else(|| PathBuf::from(".pipewright"))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(paths) = lookup("PIPEWRIGHT_DEFINITIONS_PATH") {
            self.definitions.search_paths = std::env::split_paths(&paths).collect();
        }
        if let Some(url) = lookup("PIPEWRIGHT_REDIS_URL") {
            self.cache.redis_url = (!url.is_empty()).then_some(url);
        }
        if let Some(ns) = lookup("PIPEWRIGHT_CACHE_NAMESPACE") {
            self.cache.namespace = ns;
        }
        if let Some(secs) = lookup("PIPEWRIGHT_LOCK_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(parsed) => self.lock.timeout_secs = parsed,
                Err(_) => warn!(value = %secs, "Ignoring invalid PIPEWRIGHT_LOCK_TIMEOUT_SECS"),
            }
        }
        if let Some(retries) = lookup("PIPEWRIGHT_LOCK_MAX_RETRIES") {
            match retries.parse::<u32>() {
                Ok(parsed) => self.lock.max_retries = parsed,
                Err(_) => warn!(value = %retries, "Ignoring invalid PIPEWRIGHT_LOCK_MAX_RETRIES"),
            }
        }
        if let Some(dir) = lookup("PIPEWRIGHT_BACKUP_DIR") {
            self.backup.backup_dir = PathBuf::from(dir);
        }
        if let Some(bucket) = lookup("PIPEWRIGHT_BACKUP_BUCKET") {
            match &mut self.backup.offsite {
                Some(offsite) => offsite.bucket = bucket,
                None => self.backup.offsite = Some(OffsiteConfig::for_bucket(bucket)),
            }
        }
    }

    fn load_partial_from_path(path: &Path) -> Result<PartialConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PipewrightError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| PipewrightError::Config(format!("{}: {e}", path.display())))
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(definitions) = partial.definitions {
            self.definitions = definitions;
        }
        if let Some(cache) = partial.cache {
            self.cache = cache;
        }
        if let Some(lock) = partial.lock {
            self.lock = lock;
        }
        if let Some(backup) = partial.backup {
            self.backup = backup;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartialConfig {
    definitions: Option<DefinitionsConfig>,
    cache: Option<CacheConfig>,
    lock: Option<LockOptions>,
    backup: Option<BackupConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = PipewrightConfig::default();
        assert_eq!(config.cache.namespace, "pipewright");
        assert_eq!(config.cache.local_capacity, 10_000);
        assert_eq!(config.cache.local_max_ttl(), Duration::from_secs(300));
        assert_eq!(config.backup.retention.keep(BackupKind::Hourly), 24);
        assert_eq!(config.backup.retention.keep(BackupKind::PreRestore), 5);
        let names: Vec<_> = config.backup.sources.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["artifacts", "state", "config", "database"]);
        assert!(config.backup.offsite.is_none());
    }

    #[test]
    fn test_toml_sections_with_partial_fields() {
        let config = PipewrightConfig::from_toml_str(
            r#"
[cache]
namespace = "books"
redis_url = "redis://127.0.0.1/"

[lock]
timeout_secs = 5
strict = true

[backup]
backup_dir = "/srv/backups"
retention = { daily = 3 }

[[backup.sources]]
name = "artifacts"
path = "/srv/out"
"#,
        )
        .unwrap();

        assert_eq!(config.cache.namespace, "books");
        assert_eq!(config.cache.local_capacity, 10_000);
        assert_eq!(config.lock.timeout_secs, 5);
        assert!(config.lock.strict);
        assert_eq!(config.lock.max_retries, LockOptions::default().max_retries);
        assert_eq!(config.backup.backup_dir, PathBuf::from("/srv/backups"));
        assert_eq!(config.backup.retention.daily, 3);
        assert_eq!(config.backup.retention.hourly, 24);
        assert_eq!(config.backup.sources.len(), 1);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PIPEWRIGHT_REDIS_URL", "redis://cache:6379"),
            ("PIPEWRIGHT_CACHE_NAMESPACE", "ns"),
            ("PIPEWRIGHT_LOCK_TIMEOUT_SECS", "90"),
            ("PIPEWRIGHT_LOCK_MAX_RETRIES", "not-a-number"),
            ("PIPEWRIGHT_BACKUP_DIR", "/tmp/b"),
            ("PIPEWRIGHT_BACKUP_BUCKET", "my-bucket"),
        ]
        .into_iter()
        .collect();

        let mut config = PipewrightConfig::default();
        config.apply_overrides_from(|k| env.get(k).map(ToString::to_string));

        assert_eq!(config.cache.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.cache.namespace, "ns");
        assert_eq!(config.lock.timeout_secs, 90);
        assert_eq!(config.lock.max_retries, LockOptions::default().max_retries);
        assert_eq!(config.backup.backup_dir, PathBuf::from("/tmp/b"));
        assert_eq!(config.backup.offsite.unwrap().bucket, "my-bucket");
    }

    #[test]
    fn test_from_file_errors_on_broken_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[cache\nnamespace = ").unwrap();
        assert!(matches!(
            PipewrightConfig::from_file(&path),
            Err(PipewrightError::Config(_))
        ));
        assert!(matches!(
            PipewrightConfig::from_file(&dir.path().join("absent.toml")),
            Err(PipewrightError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_section_is_rejected() {
        assert!(PipewrightConfig::from_toml_str("[cahce]\nnamespace = 'x'\n").is_err());
    }
}
