//! Staging and tar.gz codec. Everything here blocks; callers run it on
//! `spawn_blocking`.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

use super::manifest::{CategoryEntry, EntryKind};
use super::BackupSource;

/// Copies a source into `staging/<category>`. Returns `None` if the source
/// does not exist.
pub fn stage_source(source: &BackupSource, staging: &Path) -> io::Result<Option<CategoryEntry>> {
    let meta = match fs::metadata(&source.path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let category_dir = staging.join(&source.name);
    fs::create_dir_all(&category_dir)?;

    let (kind, files, bytes) = if meta.is_dir() {
        let (files, bytes) = copy_tree(&source.path, &category_dir)?;
        (EntryKind::Directory, files, bytes)
    } else {
        let file_name = source.path.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("{} has no file name", source.path.display()))
        })?;
        let bytes = fs::copy(&source.path, category_dir.join(file_name))?;
        (EntryKind::File, 1, bytes)
    };

    Ok(Some(CategoryEntry {
        name: source.name.clone(),
        source: source.path.clone(),
        kind,
        files,
        bytes,
    }))
}

/// Recursively copies `src` into `dst`, returning (files, bytes).
/// Symlinks are skipped.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<(u64, u64)> {
    let mut files = 0;
    let mut bytes = 0;

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            bytes += fs::copy(entry.path(), &target)?;
            files += 1;
        } else {
            debug!(path = %entry.path().display(), "Skipping non-regular file");
        }
    }

    Ok((files, bytes))
}

/// Compresses the contents of `staging` into a gzip tarball at `dest`.
pub fn create_archive(staging: &Path, dest: &Path) -> io::Result<()> {
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", staging)?;
    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    let file = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
    file.sync_all()
}

/// Extracts a gzip tarball into `dest`. Entries escaping `dest` are
/// rejected by `tar`.
pub fn extract_archive(archive: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    let decoder = GzDecoder::new(BufReader::new(File::open(archive)?));
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.unpack(dest)
}

/// Hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stage_file_and_directory_sources() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();

        let state = root.path().join("state.json");
        fs::write(&state, b"{\"step\": 3}").unwrap();
        let out = root.path().join("output");
        fs::create_dir_all(out.join("chapters")).unwrap();
        fs::write(out.join("book.md"), b"# Book").unwrap();
        fs::write(out.join("chapters/01.md"), b"one").unwrap();

        let file_entry = stage_source(&BackupSource::new("state", &state), staging.path())
            .unwrap()
            .unwrap();
        assert_eq!(file_entry.kind, EntryKind::File);
        assert_eq!(file_entry.files, 1);
        assert!(staging.path().join("state/state.json").is_file());

        let dir_entry = stage_source(&BackupSource::new("artifacts", &out), staging.path())
            .unwrap()
            .unwrap();
        assert_eq!(dir_entry.kind, EntryKind::Directory);
        assert_eq!(dir_entry.files, 2);
        assert_eq!(dir_entry.bytes, 9);
        assert_eq!(
            fs::read(staging.path().join("artifacts/chapters/01.md")).unwrap(),
            b"one"
        );

        let missing = stage_source(
            &BackupSource::new("database", root.path().join("nope")),
            staging.path(),
        )
        .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_archive_round_trip() {
        let staging = TempDir::new().unwrap();
        fs::create_dir_all(staging.path().join("a/b")).unwrap();
        fs::write(staging.path().join("a/b/c.txt"), b"payload").unwrap();
        fs::write(staging.path().join("manifest.json"), b"{}").unwrap();

        let out = TempDir::new().unwrap();
        let archive = out.path().join("x.tar.gz");
        create_archive(staging.path(), &archive).unwrap();
        assert_eq!(sha256_file(&archive).unwrap().len(), 64);

        let dest = out.path().join("extracted");
        extract_archive(&archive, &dest).unwrap();
        assert_eq!(fs::read(dest.join("a/b/c.txt")).unwrap(), b"payload");
        assert!(dest.join("manifest.json").is_file());
    }
}
