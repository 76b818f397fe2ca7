use crate::{
    message::{FileChunk, FileQuery, FileStatus},
    range::ByteRange,
    routing::contact::ContactInfo,
    rpc::Rpc,
};
use futures_util::{stream, StreamExt};

/// Ask every online contact about the file and keep those holding exactly the wanted copy.
/// Contacts are returned in routing table order.
pub(super) async fn qualifying_contacts(
    rpc: &Rpc,
    file: &FileQuery,
    size: u64,
    version: &str,
    max_parallel: usize,
) -> Vec<ContactInfo> {
    let candidates = rpc.table().lock().unwrap().online_contacts();
    let num_candidates = candidates.len();

    let qualifying: Vec<ContactInfo> = stream::iter(candidates)
        .map(|contact| async move {
            let status = rpc.check_file_exists(&contact, file).await;
            (contact, status)
        })
        .buffered(max_parallel.max(1))
        .filter_map(|(contact, status)| async move {
            match status {
                Ok(status) if qualifies(&status, size, version) => Some(contact),
                Ok(status) => {
                    log::debug!("{:?} has a different copy of {:?}: {:?}", contact, file, status);
                    None
                }
                Err(error) => {
                    log::debug!("{:?} did not answer the probe: {}", contact, error);
                    None
                }
            }
        })
        .collect()
        .await;

    log::debug!(
        "{} of {} contacts hold {:?} (size={}, version={})",
        qualifying.len(),
        num_candidates,
        file,
        size,
        version
    );

    qualifying
}

pub(super) fn qualifies(status: &FileStatus, size: u64, version: &str) -> bool {
    status.bucket_found && status.exists && status.size == size && status.version == version
}

/// Whether the chunk answers a request for `range` of the probed copy of the file.
pub(super) fn chunk_is_valid(chunk: &FileChunk, range: ByteRange, size: u64, version: &str) -> bool {
    qualifies(&chunk.status, size, version) && chunk.data.len() as u64 == range.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Identifier;
    use crate::test::{MockNetwork, MockPeer};

    fn query() -> FileQuery {
        FileQuery {
            bucket: "docs".to_owned(),
            prefix: "reports".to_owned(),
            name: "q3.pdf".to_owned(),
        }
    }

    fn status(size: u64, version: &str) -> FileStatus {
        FileStatus {
            bucket_found: true,
            exists: true,
            size,
            version: version.to_owned(),
        }
    }

    #[test]
    fn positive_exact_copy_qualifies() {
        assert!(qualifies(&status(10, "v1"), 10, "v1"));
    }

    #[test]
    fn negative_stale_copy_does_not_qualify() {
        assert!(!qualifies(&status(10, "v0"), 10, "v1"));
        assert!(!qualifies(&status(11, "v1"), 10, "v1"));
        assert!(!qualifies(
            &FileStatus {
                exists: false,
                ..status(10, "v1")
            },
            10,
            "v1"
        ));
        assert!(!qualifies(
            &FileStatus {
                bucket_found: false,
                ..status(10, "v1")
            },
            10,
            "v1"
        ));
    }

    #[test]
    fn negative_short_chunk_rejected() {
        let chunk = FileChunk {
            status: status(100, "v1"),
            data: vec![0; 9],
        };

        assert!(!chunk_is_valid(&chunk, ByteRange::new(0, 9), 100, "v1"));
        assert!(chunk_is_valid(&chunk, ByteRange::new(0, 8), 100, "v1"));
        assert!(!chunk_is_valid(&chunk, ByteRange::new(0, 8), 100, "v2"));
    }

    #[tokio::test]
    async fn positive_probe_filters_contacts() {
        let network = MockNetwork::new();
        let data = vec![7u8; 64];

        let holder = network.add_peer(MockPeer::new().serving(&query(), &data, "v1"));
        let stale = network.add_peer(MockPeer::new().serving(&query(), &data, "v0"));
        let empty = network.add_peer(MockPeer::new());
        let dead = network.add_peer(MockPeer::new().serving(&query(), &data, "v1").unreachable());

        let rpc = network.rpc(Identifier::random());
        rpc.add_hearsay(&[holder.clone(), stale, empty, dead]);

        let found = qualifying_contacts(&rpc, &query(), 64, "v1", 2).await;
        assert_eq!(found, vec![holder.clone()]);

        // Nothing changed, so probing again gives the same answer.
        let again = qualifying_contacts(&rpc, &query(), 64, "v1", 2).await;
        assert_eq!(again, vec![holder]);
    }
}
