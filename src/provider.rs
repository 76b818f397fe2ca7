//! Serving side of the file RPCs.

use crate::{
    message::{FileChunk, FileQuery, FileStatus},
    range::ByteRange,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    io,
    path::{Component, Path, PathBuf},
    time::UNIX_EPOCH,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt},
};

/// Largest range a single DOWNLOAD_FILE request may ask for.
pub const MAX_SERVED_CHUNK: u64 = 16 * 1024 * 1024;

/// Answers CHECK_FILE_EXISTS and DOWNLOAD_FILE requests from other peers.
#[async_trait]
pub trait FileProvider: Send + Sync {
    /// Names of the buckets this peer shares, advertised during the handshake.
    fn buckets(&self) -> Vec<String>;

    async fn file_status(&self, file: &FileQuery) -> io::Result<FileStatus>;

    /// Read `range` of the file. The returned data is shorter than requested if the file is.
    async fn read_chunk(&self, file: &FileQuery, range: ByteRange) -> io::Result<FileChunk>;
}

/// Provider that shares nothing.
pub struct NoFiles;

#[async_trait]
impl FileProvider for NoFiles {
    fn buckets(&self) -> Vec<String> {
        Vec::new()
    }

    async fn file_status(&self, _file: &FileQuery) -> io::Result<FileStatus> {
        Ok(FileStatus::default())
    }

    async fn read_chunk(&self, _file: &FileQuery, _range: ByteRange) -> io::Result<FileChunk> {
        Ok(FileChunk {
            status: FileStatus::default(),
            data: Vec::new(),
        })
    }
}

/// Shares local folders, one per bucket name.
///
/// A file is addressed as `<root of bucket>/<prefix>/<name>`, where `prefix` is a relative,
/// `/`-separated directory path. The version of a file is its modification time in nanoseconds
/// since the UNIX epoch.
#[derive(Default, Clone, Debug)]
pub struct FolderProvider {
    roots: HashMap<String, PathBuf>,
}

impl FolderProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bucket(mut self, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.roots.insert(name.into(), root.into());
        self
    }

    /// Path of the file, or `None` if the query tries to leave the bucket root.
    fn resolve(root: &Path, file: &FileQuery) -> Option<PathBuf> {
        let mut path = root.to_path_buf();

        for part in file.prefix.split('/').filter(|part| !part.is_empty()) {
            path.push(normal_component(part)?);
        }

        path.push(normal_component(&file.name)?);
        Some(path)
    }

    async fn locate(&self, file: &FileQuery) -> io::Result<Located> {
        let root = match self.roots.get(&file.bucket) {
            Some(root) => root,
            None => return Ok(Located::NoBucket),
        };

        let path = match Self::resolve(root, file) {
            Some(path) => path,
            None => {
                log::debug!("Rejecting path outside of bucket {:?}: {:?}", file.bucket, file);
                return Ok(Located::Missing);
            }
        };

        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {
                let status = FileStatus {
                    bucket_found: true,
                    exists: true,
                    size: metadata.len(),
                    version: version_of(&metadata)?,
                };
                Ok(Located::File(path, status))
            }
            Ok(_) => Ok(Located::Missing),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(Located::Missing),
            Err(error) => Err(error),
        }
    }
}

enum Located {
    NoBucket,
    Missing,
    File(PathBuf, FileStatus),
}

impl Located {
    fn status(&self) -> FileStatus {
        match self {
            Located::NoBucket => FileStatus::default(),
            Located::Missing => FileStatus {
                bucket_found: true,
                ..FileStatus::default()
            },
            Located::File(_, status) => status.clone(),
        }
    }
}

#[async_trait]
impl FileProvider for FolderProvider {
    fn buckets(&self) -> Vec<String> {
        let mut buckets: Vec<_> = self.roots.keys().cloned().collect();
        buckets.sort();
        buckets
    }

    async fn file_status(&self, file: &FileQuery) -> io::Result<FileStatus> {
        Ok(self.locate(file).await?.status())
    }

    async fn read_chunk(&self, file: &FileQuery, range: ByteRange) -> io::Result<FileChunk> {
        if range.len() > MAX_SERVED_CHUNK {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "requested range is too large",
            ));
        }

        let located = self.locate(file).await?;
        let status = located.status();

        let path = match located {
            Located::File(path, _) => path,
            _ => {
                return Ok(FileChunk {
                    status,
                    data: Vec::new(),
                })
            }
        };

        let mut data = Vec::new();

        if range.start < status.size {
            let mut handle = File::open(&path).await?;
            handle.seek(io::SeekFrom::Start(range.start)).await?;
            handle.take(range.len()).read_to_end(&mut data).await?;
        }

        Ok(FileChunk { status, data })
    }
}

fn normal_component(part: &str) -> Option<&str> {
    let mut components = Path::new(part).components();

    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(part),
        _ => None,
    }
}

/// Version string of a file: modification time in nanoseconds since the UNIX epoch.
pub fn version_of(metadata: &std::fs::Metadata) -> io::Result<String> {
    let modified = metadata.modified()?;
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);

    Ok(nanos.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn query(bucket: &str, prefix: &str, name: &str) -> FileQuery {
        FileQuery {
            bucket: bucket.to_owned(),
            prefix: prefix.to_owned(),
            name: name.to_owned(),
        }
    }

    async fn provider_with_file(data: &[u8]) -> (TempDir, FolderProvider) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("docs/2023")).await.unwrap();
        fs::write(dir.path().join("docs/2023/report.bin"), data)
            .await
            .unwrap();

        let provider = FolderProvider::new().add_bucket("shared", dir.path());
        (dir, provider)
    }

    #[tokio::test]
    async fn positive_status_of_existing_file() {
        let (_dir, provider) = provider_with_file(&[1u8; 100]).await;

        let status = provider
            .file_status(&query("shared", "docs/2023", "report.bin"))
            .await
            .unwrap();

        assert!(status.bucket_found);
        assert!(status.exists);
        assert_eq!(status.size, 100);
        assert!(!status.version.is_empty());
    }

    #[tokio::test]
    async fn positive_probing_is_idempotent() {
        let (_dir, provider) = provider_with_file(&[1u8; 100]).await;
        let file = query("shared", "docs/2023", "report.bin");

        let first = provider.file_status(&file).await.unwrap();
        let second = provider.file_status(&file).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn negative_unknown_bucket() {
        let (_dir, provider) = provider_with_file(&[1u8; 100]).await;

        let status = provider
            .file_status(&query("private", "docs/2023", "report.bin"))
            .await
            .unwrap();

        assert!(!status.bucket_found);
        assert!(!status.exists);
    }

    #[tokio::test]
    async fn negative_path_traversal() {
        let (_dir, provider) = provider_with_file(&[1u8; 100]).await;

        for (prefix, name) in [
            ("docs/../..", "report.bin"),
            ("", "../report.bin"),
            ("/etc", "passwd"),
            ("docs/2023", ".."),
        ] {
            let status = provider
                .file_status(&query("shared", prefix, name))
                .await
                .unwrap();
            assert!(status.bucket_found);
            assert!(!status.exists, "{}/{} should be rejected", prefix, name);
        }
    }

    #[tokio::test]
    async fn positive_read_chunk() {
        let data: Vec<u8> = (0..=255).collect();
        let (_dir, provider) = provider_with_file(&data).await;

        let chunk = provider
            .read_chunk(
                &query("shared", "docs/2023", "report.bin"),
                ByteRange::new(10, 19),
            )
            .await
            .unwrap();

        assert_eq!(chunk.data, data[10..20].to_vec());
        assert_eq!(chunk.status.size, 256);
    }

    #[tokio::test]
    async fn negative_read_past_end_is_short() {
        let (_dir, provider) = provider_with_file(&[7u8; 10]).await;

        let chunk = provider
            .read_chunk(
                &query("shared", "docs/2023", "report.bin"),
                ByteRange::new(5, 50),
            )
            .await
            .unwrap();

        assert_eq!(chunk.data.len(), 5);
    }
}
