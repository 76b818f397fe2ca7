use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};

/// Hidden, read-only, pre-sized file receiving the chunks of one download. Chunks may arrive in
/// any order from concurrent writers.
pub(super) struct PartFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl PartFile {
    pub async fn create(folder: &Path, name: &str, size: u64) -> io::Result<Self> {
        let path = folder.join(format!(".{}.{:08x}.part", name, rand::random::<u32>()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        // Sparse where the filesystem supports it.
        let prepared = async {
            file.set_len(size).await?;
            set_readonly(&path, true).await
        }
        .await;

        if let Err(error) = prepared {
            drop(file);
            remove(&path).await;
            return Err(error);
        }

        log::trace!("Created {:?} ({} bytes)", path, size);

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await
    }

    /// Move the finished file to `destination` and make it writable again. The part file is
    /// removed if that fails.
    pub async fn persist(self, destination: &Path) -> io::Result<()> {
        let Self { path, file } = self;
        let mut file = file.into_inner();

        let result = async {
            file.flush().await?;
            file.sync_all().await?;
            drop(file);

            if fs::symlink_metadata(destination).await.is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "destination appeared during the download",
                ));
            }

            fs::rename(&path, destination).await?;
            set_readonly(destination, false).await
        }
        .await;

        if result.is_err() {
            remove(&path).await;
        }

        result
    }

    pub async fn discard(self) {
        let Self { path, file } = self;
        drop(file);
        remove(&path).await;
    }
}

/// Write a whole file that must not exist yet. Nothing is left behind on failure.
pub(super) async fn write_new(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;

    let result = async {
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;

    if result.is_err() {
        drop(file);
        remove(path).await;
    }

    result
}

async fn set_readonly(path: &Path, readonly: bool) -> io::Result<()> {
    let mut permissions = fs::metadata(path).await?.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(readonly);
    fs::set_permissions(path, permissions).await
}

async fn remove(path: &Path) {
    // Read-only files cannot be deleted everywhere.
    let _ = set_readonly(path, false).await;

    if let Err(error) = fs::remove_file(path).await {
        if error.kind() != io::ErrorKind::NotFound {
            log::warn!("Failed to remove {:?}: {}", path, error);
        }
    }
}
