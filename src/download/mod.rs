//! Fetches a file from every peer holding it at once.
//!
//! The peers holding the wanted copy are found by probing all online contacts. Small files are
//! then fetched whole from the first peer that delivers. Larger files are split into one piece
//! per peer, each piece fetched chunk by chunk into a shared part file; whatever was not
//! delivered is split again among the peers still holding the file, until the file is complete.

mod plan;
mod probe;
mod writer;

use self::writer::PartFile;
use crate::{
    config::Config,
    message::FileQuery,
    range::ByteRange,
    routing::contact::ContactInfo,
    rpc::Rpc,
};
use futures_util::{future, stream, StreamExt};
use std::{
    io,
    path::{Component, Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{fs, select};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("destination folder {0:?} does not exist")]
    FolderNotFound(PathBuf),
    #[error("destination file {0:?} already exists")]
    AlreadyExists(PathBuf),
    #[error("file doesn't exist in any node")]
    NotFound,
    #[error("file partially downloaded, {missing} bytes missing")]
    PartiallyDownloaded { missing: u64 },
    #[error("download cancelled")]
    Cancelled,
    #[error("io error")]
    Io(#[from] io::Error),
}

/// A file to fetch, as advertised by the peers sharing it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Existing local folder the file is saved into.
    pub folder: PathBuf,
    pub bucket: String,
    pub prefix: String,
    /// Name of the file, remotely and locally.
    pub name: String,
    pub size: u64,
    pub version: String,
}

impl DownloadRequest {
    pub fn destination(&self) -> PathBuf {
        self.folder.join(&self.name)
    }

    fn query(&self) -> FileQuery {
        FileQuery {
            bucket: self.bucket.clone(),
            prefix: self.prefix.clone(),
            name: self.name.clone(),
        }
    }

    async fn validate(&self) -> Result<(), DownloadError> {
        if self.size == 0 {
            return Err(DownloadError::InvalidArgument("size must not be zero"));
        }

        if self.version.is_empty() {
            return Err(DownloadError::InvalidArgument("version must not be empty"));
        }

        // The wire carries these as length-prefixed ASCII.
        if [&self.bucket, &self.prefix, &self.name, &self.version]
            .iter()
            .any(|field| !field.is_ascii() || field.len() > u16::MAX as usize)
        {
            return Err(DownloadError::InvalidArgument(
                "bucket, prefix, name and version must be short ASCII strings",
            ));
        }

        let mut components = Path::new(&self.name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(DownloadError::InvalidArgument("name must be a plain file name"));
        }

        match fs::metadata(&self.folder).await {
            Ok(metadata) if metadata.is_dir() => (),
            _ => return Err(DownloadError::FolderNotFound(self.folder.clone())),
        }

        let destination = self.destination();
        if fs::symlink_metadata(&destination).await.is_ok() {
            return Err(DownloadError::AlreadyExists(destination));
        }

        Ok(())
    }
}

pub(crate) struct Downloader {
    rpc: Arc<Rpc>,
    max_chunk: u64,
    max_parallel: usize,
    max_rounds: usize,
}

impl Downloader {
    pub fn new(rpc: Arc<Rpc>, max_chunk: u64, max_parallel: usize, max_rounds: usize) -> Self {
        Self {
            rpc,
            max_chunk: max_chunk.max(1),
            max_parallel: max_parallel.max(1),
            max_rounds,
        }
    }

    pub fn from_config(rpc: Arc<Rpc>, config: &Config) -> Self {
        Self::new(
            rpc,
            config.max_chunk_size,
            config.max_parallel,
            config.max_repartition_rounds,
        )
    }

    /// Download the file into its destination, returning the destination path.
    ///
    /// On failure or cancellation neither the destination nor any temporary file is left behind.
    pub async fn download_file(
        &self,
        request: &DownloadRequest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        request.validate().await?;

        let query = request.query();

        let contacts = select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            contacts = self.probe(request, &query) => contacts,
        };

        if contacts.is_empty() {
            log::info!("{:?} is not available from any contact", query);
            return Err(DownloadError::NotFound);
        }

        log::info!(
            "Downloading {:?} ({} bytes) from {} contacts",
            query,
            request.size,
            contacts.len()
        );

        if request.size <= self.max_chunk {
            self.download_small(request, &query, contacts, cancel).await
        } else {
            self.download_large(request, &query, contacts, cancel).await
        }
    }

    async fn probe(&self, request: &DownloadRequest, query: &FileQuery) -> Vec<ContactInfo> {
        probe::qualifying_contacts(
            &self.rpc,
            query,
            request.size,
            &request.version,
            self.max_parallel,
        )
        .await
    }

    /// Whole file in one request, trying the contacts one after the other.
    async fn download_small(
        &self,
        request: &DownloadRequest,
        query: &FileQuery,
        contacts: Vec<ContactInfo>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        let range = ByteRange::new(0, request.size - 1);
        let destination = request.destination();

        for contact in contacts {
            let data = select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                data = self.fetch_chunk(&contact, request, query, range) => data,
            };

            if let Some(data) = data {
                writer::write_new(&destination, &data).await?;
                log::info!("Downloaded {:?} from {:?}", query, contact);
                return Ok(destination);
            }
        }

        Err(DownloadError::PartiallyDownloaded {
            missing: request.size,
        })
    }

    async fn download_large(
        &self,
        request: &DownloadRequest,
        query: &FileQuery,
        contacts: Vec<ContactInfo>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        let part = PartFile::create(&request.folder, &request.name, request.size).await?;

        let result = select! {
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            result = self.fill(&part, request, query, contacts) => result,
        };

        match result {
            Ok(()) => {
                let destination = request.destination();
                part.persist(&destination).await?;
                log::info!("Downloaded {:?} into {:?}", query, destination);
                Ok(destination)
            }
            Err(error) => {
                log::info!("Download of {:?} failed: {}", query, error);
                part.discard().await;
                Err(error)
            }
        }
    }

    /// Transfer rounds until every byte is in the part file.
    async fn fill(
        &self,
        part: &PartFile,
        request: &DownloadRequest,
        query: &FileQuery,
        mut contacts: Vec<ContactInfo>,
    ) -> Result<(), DownloadError> {
        let mut pending = vec![ByteRange::new(0, request.size - 1)];
        let mut round = 0;

        loop {
            let pieces = plan::partition(&pending, contacts.len(), self.max_chunk);

            let results: Vec<io::Result<Vec<ByteRange>>> =
                stream::iter(contacts.into_iter().zip(pieces))
                    .filter(|(_, pieces)| future::ready(!pieces.is_empty()))
                    .map(|(contact, pieces)| self.transfer(part, request, query, contact, pieces))
                    .buffer_unordered(self.max_parallel)
                    .collect()
                    .await;

            pending.clear();
            for result in results {
                pending.extend(result?);
            }
            pending.sort();

            if pending.is_empty() {
                return Ok(());
            }

            let missing: u64 = pending.iter().map(ByteRange::len).sum();

            if round == self.max_rounds {
                log::warn!(
                    "Giving up on {:?} after {} rounds, {} bytes missing",
                    query,
                    round + 1,
                    missing
                );
                return Err(DownloadError::PartiallyDownloaded { missing });
            }

            round += 1;
            contacts = self.probe(request, query).await;

            log::debug!(
                "Re-partitioning {} missing bytes of {:?} among {} contacts (round {})",
                missing,
                query,
                contacts.len(),
                round
            );

            if contacts.is_empty() {
                return Err(DownloadError::PartiallyDownloaded { missing });
            }
        }
    }

    /// Fetch the pieces assigned to one contact, in order. Returns what was not delivered.
    async fn transfer(
        &self,
        part: &PartFile,
        request: &DownloadRequest,
        query: &FileQuery,
        contact: ContactInfo,
        pieces: Vec<ByteRange>,
    ) -> io::Result<Vec<ByteRange>> {
        let mut delivered = 0;

        for (index, piece) in pieces.iter().enumerate() {
            for chunk in piece.chunks(self.max_chunk) {
                match self.fetch_chunk(&contact, request, query, chunk).await {
                    Some(data) => {
                        part.write_at(chunk.start, &data).await?;
                        delivered += data.len() as u64;
                    }
                    None => {
                        log::debug!(
                            "{:?} stopped delivering at {} after {} bytes",
                            contact,
                            chunk.start,
                            delivered
                        );

                        let mut undelivered = vec![ByteRange::new(chunk.start, piece.end)];
                        undelivered.extend_from_slice(&pieces[index + 1..]);
                        return Ok(undelivered);
                    }
                }
            }
        }

        log::trace!("{:?} delivered {} bytes", contact, delivered);

        Ok(Vec::new())
    }

    async fn fetch_chunk(
        &self,
        contact: &ContactInfo,
        request: &DownloadRequest,
        query: &FileQuery,
        range: ByteRange,
    ) -> Option<Vec<u8>> {
        let chunk = match self.rpc.download_file(contact, query, range).await {
            Ok(chunk) => chunk,
            Err(error) => {
                log::debug!("{:?} failed to send {:?}: {}", contact, range, error);
                return None;
            }
        };

        if probe::chunk_is_valid(&chunk, range, request.size, &request.version) {
            Some(chunk.data)
        } else {
            log::debug!(
                "Rejecting {:?} of {:?} from {:?}: {:?}, {} bytes",
                range,
                query,
                contact,
                chunk.status,
                chunk.data.len()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Identifier;
    use crate::test::{MockNetwork, MockPeer};
    use std::time::Duration;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn request(folder: &Path, size: u64) -> DownloadRequest {
        DownloadRequest {
            folder: folder.to_path_buf(),
            bucket: "photos".to_owned(),
            prefix: "2024/summer".to_owned(),
            name: "beach.raw".to_owned(),
            size,
            version: "1718000000000000000".to_owned(),
        }
    }

    fn content(size: u64) -> Vec<u8> {
        (0..size).map(|n| (n % 251) as u8).collect()
    }

    fn files_in(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Downloader over `peers`, all of them known to it.
    fn downloader(network: &MockNetwork, peers: Vec<MockPeer>, max_chunk: u64) -> Downloader {
        let rpc = network.rpc(Identifier::random());
        let contacts: Vec<_> = peers.into_iter().map(|peer| network.add_peer(peer)).collect();
        rpc.add_hearsay(&contacts);

        Downloader::new(rpc, max_chunk, 10, 8)
    }

    #[tokio::test]
    async fn positive_three_peers_large_file() {
        let dir = TempDir::new().unwrap();
        let request = request(dir.path(), 10 * MIB);
        let data = content(request.size);

        let network = MockNetwork::new();
        let peers = (0..3)
            .map(|_| MockPeer::new().serving(&request.query(), &data, &request.version))
            .collect();
        let downloader = downloader(&network, peers, MIB);

        let path = downloader
            .download_file(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(path, request.destination());
        assert_eq!(fs::read(&path).await.unwrap(), data);
        assert_eq!(files_in(&dir), vec!["beach.raw".to_owned()]);
    }

    #[tokio::test]
    async fn negative_only_peer_has_other_version() {
        let dir = TempDir::new().unwrap();
        let request = request(dir.path(), 4096);
        let data = content(request.size);

        let network = MockNetwork::new();
        let peers = vec![MockPeer::new().serving(&request.query(), &data, "1")];
        let downloader = downloader(&network, peers, MIB);

        let result = downloader
            .download_file(&request, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(DownloadError::NotFound)));
        assert!(files_in(&dir).is_empty());
    }

    #[tokio::test]
    async fn positive_small_file_falls_back_to_next_peer() {
        let dir = TempDir::new().unwrap();
        let request = request(dir.path(), 100);
        let data = content(request.size);

        let network = MockNetwork::new();
        let peers = vec![
            MockPeer::new()
                .serving(&request.query(), &data, &request.version)
                .disconnect_after(0),
            MockPeer::new().serving(&request.query(), &data, &request.version),
        ];
        let downloader = downloader(&network, peers, MIB);

        let path = downloader
            .download_file(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fs::read(&path).await.unwrap(), data);
    }

    #[tokio::test]
    async fn negative_small_file_no_peer_delivers() {
        let dir = TempDir::new().unwrap();
        let request = request(dir.path(), 100);
        let data = content(request.size);

        let network = MockNetwork::new();
        let peers = vec![MockPeer::new()
            .serving(&request.query(), &data, &request.version)
            .disconnect_after(0)];
        let downloader = downloader(&network, peers, MIB);

        let result = downloader
            .download_file(&request, &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(DownloadError::PartiallyDownloaded { missing: 100 })
        ));
        assert!(files_in(&dir).is_empty());
    }

    #[tokio::test]
    async fn positive_repartition_after_peer_disconnects() {
        let dir = TempDir::new().unwrap();
        let request = request(dir.path(), 12 * 1024);
        let data = content(request.size);

        let network = MockNetwork::new();
        let peers = vec![
            MockPeer::new().serving(&request.query(), &data, &request.version),
            MockPeer::new().serving(&request.query(), &data, &request.version),
            // Half of its 4 KiB piece.
            MockPeer::new()
                .serving(&request.query(), &data, &request.version)
                .disconnect_after(2 * 1024),
        ];
        let downloader = downloader(&network, peers, 1024);

        let path = downloader
            .download_file(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fs::read(&path).await.unwrap(), data);
        assert_eq!(files_in(&dir), vec!["beach.raw".to_owned()]);
    }

    #[tokio::test]
    async fn negative_all_peers_gone_midway() {
        let dir = TempDir::new().unwrap();
        let request = request(dir.path(), 8 * 1024);
        let data = content(request.size);

        let network = MockNetwork::new();
        let peers = vec![
            MockPeer::new()
                .serving(&request.query(), &data, &request.version)
                .disconnect_after(1024),
            MockPeer::new()
                .serving(&request.query(), &data, &request.version)
                .disconnect_after(1024),
        ];
        let downloader = downloader(&network, peers, 1024);

        let result = downloader
            .download_file(&request, &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(DownloadError::PartiallyDownloaded { missing: 6144 })
        ));
        assert!(files_in(&dir).is_empty());
    }

    #[tokio::test]
    async fn positive_cancel_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let request = request(dir.path(), 8 * 1024);
        let data = content(request.size);

        let network = MockNetwork::new();
        let peers = (0..3)
            .map(|_| {
                MockPeer::new()
                    .serving(&request.query(), &data, &request.version)
                    .slow_downloads(Duration::from_millis(200))
            })
            .collect();
        let downloader = downloader(&network, peers, 1024);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });

        let result = downloader.download_file(&request, &cancel).await;

        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert!(files_in(&dir).is_empty());
    }

    #[tokio::test]
    async fn negative_preconditions_checked_before_network() {
        let dir = TempDir::new().unwrap();
        let network = MockNetwork::new();
        let downloader = downloader(&network, vec![MockPeer::new()], MIB);
        let cancel = CancellationToken::new();

        let zero = request(dir.path(), 0);
        assert!(matches!(
            downloader.download_file(&zero, &cancel).await,
            Err(DownloadError::InvalidArgument(_))
        ));

        let unversioned = DownloadRequest {
            version: String::new(),
            ..request(dir.path(), 10)
        };
        assert!(matches!(
            downloader.download_file(&unversioned, &cancel).await,
            Err(DownloadError::InvalidArgument(_))
        ));

        let escaping = DownloadRequest {
            name: "../beach.raw".to_owned(),
            ..request(dir.path(), 10)
        };
        assert!(matches!(
            downloader.download_file(&escaping, &cancel).await,
            Err(DownloadError::InvalidArgument(_))
        ));

        let accented = DownloadRequest {
            name: "café.txt".to_owned(),
            ..request(dir.path(), 10)
        };
        assert!(matches!(
            downloader.download_file(&accented, &cancel).await,
            Err(DownloadError::InvalidArgument(_))
        ));

        let accented_prefix = DownloadRequest {
            prefix: "été".to_owned(),
            ..request(dir.path(), 10)
        };
        assert!(matches!(
            downloader.download_file(&accented_prefix, &cancel).await,
            Err(DownloadError::InvalidArgument(_))
        ));

        let missing_folder = request(&dir.path().join("nope"), 10);
        assert!(matches!(
            downloader.download_file(&missing_folder, &cancel).await,
            Err(DownloadError::FolderNotFound(_))
        ));

        std::fs::write(dir.path().join("beach.raw"), b"local").unwrap();
        assert!(matches!(
            downloader.download_file(&request(dir.path(), 10), &cancel).await,
            Err(DownloadError::AlreadyExists(_))
        ));

        assert_eq!(network.requests_served(), 0);
    }
}
