//! Off-box object storage for backup archives.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::errors::{NotFoundError, PipewrightError, Result};

/// Object store addressed by `/`-separated keys.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Uploads the file at `source` under `key`.
    async fn put(&self, key: &str, source: &Path) -> Result<()>;

    /// Downloads `key` into `dest`. A missing key is a [`NotFoundError`].
    async fn get(&self, key: &str, dest: &Path) -> Result<()>;

    /// Deletes `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lists keys starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Object store backed by a directory (mounted storage, tests).
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let clean = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(PipewrightError::Storage(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for DirectoryStore {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn put(&self, key: &str, source: &Path) -> Result<()> {
        let dest = self.object_path(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut partial = dest.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);
        tokio::fs::copy(source, &partial).await?;
        tokio::fs::rename(&partial, &dest).await?;
        debug!(key, store = %self.root.display(), "Object stored");
        Ok(())
    }

    async fn get(&self, key: &str, dest: &Path) -> Result<()> {
        let src = self.object_path(key)?;
        match tokio::fs::copy(&src, dest).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(NotFoundError::new("object", key)
                .with_searched(vec![self.describe()])
                .into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(|e| PipewrightError::Storage(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix) && !key.ends_with(".partial") {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| PipewrightError::Storage(e.to_string()))?
    }
}

#[cfg(feature = "s3")]
pub use http::HttpObjectStore;

#[cfg(feature = "s3")]
mod http {
    use super::{NotFoundError, ObjectStore, PipewrightError, Result};
    use async_trait::async_trait;
    use regex::Regex;
    use reqwest::{Client, RequestBuilder, Response, StatusCode};
    use std::path::Path;
    use std::sync::OnceLock;
    use std::time::Duration;
    use tracing::debug;

    const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

    fn key_pattern() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"<Key>([^<]*)</Key>").expect("valid regex"))
    }

    fn continuation_pattern() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| {
            Regex::new(r"<NextContinuationToken>([^<]*)</NextContinuationToken>").expect("valid regex")
        })
    }

    fn unescape_xml(s: &str) -> String {
        s.replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&apos;", "'")
            .replace("&amp;", "&")
    }

    fn storage_err(e: impl std::fmt::Display) -> PipewrightError {
        PipewrightError::Storage(e.to_string())
    }

    /// Path-style S3-compatible REST store.
    #[derive(Debug, Clone)]
    pub struct HttpObjectStore {
        client: Client,
        endpoint: String,
        bucket: String,
        token: Option<String>,
    }

    impl HttpObjectStore {
        /// Store for `bucket` at `endpoint`.
        pub fn new(endpoint: &str, bucket: impl Into<String>, token: Option<String>) -> Result<Self> {
            let client = Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(storage_err)?;
            Ok(Self {
                client,
                endpoint: endpoint.trim_end_matches('/').to_string(),
                bucket: bucket.into(),
                token,
            })
        }

        fn url(&self, key: &str) -> String {
            format!("{}/{}/{}", self.endpoint, self.bucket, key)
        }

        fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
            match &self.token {
                Some(token) => request.bearer_auth(token),
                None => request,
            }
        }

        async fn send(&self, request: RequestBuilder) -> Result<Response> {
            self.authorize(request).send().await.map_err(storage_err)
        }
    }

    #[async_trait]
    impl ObjectStore for HttpObjectStore {
        fn describe(&self) -> String {
            format!("{}/{}", self.endpoint, self.bucket)
        }

        async fn put(&self, key: &str, source: &Path) -> Result<()> {
            let body = tokio::fs::read(source).await?;
            let response = self.send(self.client.put(self.url(key)).body(body)).await?;
            response.error_for_status().map_err(storage_err)?;
            debug!(key, store = %self.describe(), "Object uploaded");
            Ok(())
        }

        async fn get(&self, key: &str, dest: &Path) -> Result<()> {
            let response = self.send(self.client.get(self.url(key))).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Err(NotFoundError::new("object", key)
                    .with_searched(vec![self.describe()])
                    .into());
            }
            let bytes = response
                .error_for_status()
                .map_err(storage_err)?
                .bytes()
                .await
                .map_err(storage_err)?;
            tokio::fs::write(dest, &bytes).await?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            let response = self.send(self.client.delete(self.url(key))).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(());
            }
            response.error_for_status().map_err(storage_err)?;
            Ok(())
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            let url = format!("{}/{}", self.endpoint, self.bucket);
            let mut keys = Vec::new();
            let mut token: Option<String> = None;

            loop {
                let mut query = vec![("list-type", "2".to_string()), ("prefix", prefix.to_string())];
                if let Some(t) = &token {
                    query.push(("continuation-token", t.clone()));
                }
                let response = self.send(self.client.get(&url).query(&query)).await?;
                let body = response
                    .error_for_status()
                    .map_err(storage_err)?
                    .text()
                    .await
                    .map_err(storage_err)?;

                keys.extend(key_pattern().captures_iter(&body).map(|c| unescape_xml(&c[1])));

                token = continuation_pattern()
                    .captures(&body)
                    .map(|c| unescape_xml(&c[1]));
                if token.is_none() {
                    break;
                }
            }

            keys.sort();
            Ok(keys)
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_directory_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path().join("bucket"));
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"archive").unwrap();

        store.put("prefix/a.tar.gz", &src).await.unwrap();
        store.put("prefix/a.json", &src).await.unwrap();
        store.put("other/b.json", &src).await.unwrap();

        let keys = store.list("prefix/").await.unwrap();
        assert_eq!(keys, vec!["prefix/a.json", "prefix/a.tar.gz"]);

        let dest = dir.path().join("out.bin");
        store.get("prefix/a.tar.gz", &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"archive");

        store.delete("prefix/a.tar.gz").await.unwrap();
        store.delete("prefix/a.tar.gz").await.unwrap();
        assert_eq!(store.list("prefix/").await.unwrap(), vec!["prefix/a.json"]);
    }

    #[tokio::test]
    async fn test_directory_store_missing_and_invalid_keys() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path());

        let err = store.get("nope.json", &dir.path().join("x")).await.unwrap_err();
        assert!(matches!(err, PipewrightError::NotFound(_)));

        let err = store.delete("../escape").await.unwrap_err();
        assert!(matches!(err, PipewrightError::Storage(_)));
        assert!(DirectoryStore::new(dir.path().join("absent"))
            .list("")
            .await
            .unwrap()
            .is_empty());
    }
}
