//! Filesystem abstraction the driver schedules against.
//!
//! Inputs, intermediate fragments and final outputs all go through this
//! trait, so the same job runs unchanged against a local directory or an
//! S3-compatible store. Paths are plain strings; `s3://` URIs select the
//! object-store implementation, everything else is local.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::s3::S3FileSystem;

/// Metadata for one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Full path (or URI) of the object.
    pub name: String,

    /// Size in bytes.
    pub size: u64,
}

/// Capability set the driver needs from a storage backend.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Expand a path, directory or glob pattern into the objects it names.
    /// Order is deterministic (lexicographic by name).
    async fn list(&self, pattern: &str) -> Result<Vec<FileInfo>>;

    /// Stat a single object.
    async fn stat(&self, path: &str) -> Result<FileInfo>;

    /// Read `length` bytes starting at `offset`. A range that runs past the
    /// end of the object returns the available prefix rather than failing.
    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes>;

    /// Read a whole object.
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write a whole object, creating parents as needed.
    async fn write(&self, path: &str, data: Bytes) -> Result<()>;

    /// Delete one object.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Join a path element onto a base path.
    fn join(&self, base: &str, elem: &str) -> String;
}

/// Pick a filesystem implementation from the shape of a path.
pub fn infer_filesystem(path: &str) -> Arc<dyn FileSystem> {
    if path.starts_with("s3://") {
        Arc::new(S3FileSystem::from_env())
    } else {
        Arc::new(LocalFileSystem)
    }
}

/// Local directory-backed implementation.
#[derive(Debug, Default, Clone)]
pub struct LocalFileSystem;

fn has_glob_meta(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn list(&self, pattern: &str) -> Result<Vec<FileInfo>> {
        let mut paths: Vec<PathBuf> = if has_glob_meta(pattern) {
            glob::glob(pattern)
                .with_context(|| format!("bad glob pattern {:?}", pattern))?
                .collect::<std::result::Result<_, _>>()?
        } else {
            let meta = tokio::fs::metadata(pattern)
                .await
                .with_context(|| format!("cannot stat {:?}", pattern))?;
            if meta.is_dir() {
                let mut entries = tokio::fs::read_dir(pattern).await?;
                let mut found = Vec::new();
                while let Some(entry) = entries.next_entry().await? {
                    found.push(entry.path());
                }
                found
            } else {
                vec![PathBuf::from(pattern)]
            }
        };
        paths.sort();

        let mut infos = Vec::with_capacity(paths.len());
        for path in paths {
            let meta = tokio::fs::metadata(&path).await?;
            if meta.is_dir() {
                continue;
            }
            infos.push(FileInfo {
                name: path.to_string_lossy().into_owned(),
                size: meta.len(),
            });
        }
        debug!("listed {} local files for {:?}", infos.len(), pattern);
        Ok(infos)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("cannot stat {:?}", path))?;
        Ok(FileInfo {
            name: path.to_string(),
            size: meta.len(),
        })
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("cannot open {:?}", path))?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(length.min(8 * 1024 * 1024) as usize);
        file.take(length).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read {:?}", path))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, &data)
            .await
            .with_context(|| format!("cannot write {:?}", path))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("cannot delete {:?}", path))?;
        Ok(())
    }

    fn join(&self, base: &str, elem: &str) -> String {
        Path::new(base).join(elem).to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_backend_from_path() {
        // Mirror of the original filesystem-inference behavior: URIs go to
        // the object store, everything else is local.
        let fs = infer_filesystem("s3://foo/bar.txt");
        assert_eq!(fs.join("s3://foo/bar", "x"), "s3://foo/bar/x");

        let fs = infer_filesystem("./bar.txt");
        assert_eq!(fs.join("base", "x"), Path::new("base").join("x").to_string_lossy());
    }

    #[tokio::test]
    async fn lists_globs_and_reads_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().into_owned();
        let fs = LocalFileSystem;

        fs.write(&fs.join(&root, "output-0"), Bytes::from("hello world"))
            .await
            .unwrap();
        fs.write(&fs.join(&root, "output-1"), Bytes::from("abc"))
            .await
            .unwrap();
        fs.write(&fs.join(&root, "other"), Bytes::from("x"))
            .await
            .unwrap();

        let listed = fs.list(&fs.join(&root, "output-*")).await.unwrap();
        let names: Vec<_> = listed.iter().map(|f| f.name.clone()).collect();
        assert_eq!(listed.len(), 2);
        assert!(names[0].ends_with("output-0"));
        assert_eq!(listed[0].size, 11);

        let chunk = fs
            .read_range(&fs.join(&root, "output-0"), 6, 100)
            .await
            .unwrap();
        assert_eq!(&chunk[..], b"world");
    }

    #[tokio::test]
    async fn listing_a_directory_yields_its_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().into_owned();
        let fs = LocalFileSystem;

        fs.write(&fs.join(&root, "a.txt"), Bytes::from("aa")).await.unwrap();
        fs.write(&fs.join(&root, "b.txt"), Bytes::from("bbb")).await.unwrap();

        let listed = fs.list(&root).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].size, 2);
        assert_eq!(listed[1].size, 3);
    }
}
