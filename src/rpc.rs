use crate::{
    id::Identifier,
    message::{
        Acknowledge, ChunkRequest, FileChunk, FileQuery, FileStatus, FindRequest,
        FindValueResult, Message, MessageBody, Request, Response, Sender, StoreRequest,
    },
    range::ByteRange,
    routing::{
        bucket::InsertOutcome,
        contact::{Contact, ContactInfo},
        table::RoutingTable,
    },
    transport::{Transport, TransportError},
};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use thiserror::Error;

/// Outcome of a failed remote call. Any of these means "the peer did not answer".
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport failure")]
    Transport(#[from] TransportError),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("unexpected response")]
    UnexpectedResponse,
    #[error("protocol version {0} is not supported")]
    VersionMismatch(u16),
}

/// Issues requests to remote contacts and keeps the routing table up to date with what it
/// learns from the answers.
pub struct Rpc {
    transport: Arc<dyn Transport>,
    table: Arc<Mutex<RoutingTable>>,
    local: Sender,
    protocol_version: u16,
    timeout: Duration,
    k: usize,
    next_correlation_id: AtomicU32,
}

impl Rpc {
    pub fn new(
        transport: Arc<dyn Transport>,
        table: Arc<Mutex<RoutingTable>>,
        local: Sender,
        protocol_version: u16,
        timeout: Duration,
        k: usize,
    ) -> Self {
        Self {
            transport,
            table,
            local,
            protocol_version,
            timeout,
            k,
            next_correlation_id: AtomicU32::new(rand::random()),
        }
    }

    pub fn local(&self) -> &Sender {
        &self.local
    }

    pub fn local_id(&self) -> Identifier {
        self.local.id
    }

    pub fn table(&self) -> &Arc<Mutex<RoutingTable>> {
        &self.table
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Liveness probe. Success refreshes the contact.
    pub async fn ping(&self, contact: &ContactInfo) -> Result<(), RpcError> {
        match self.call_contact(contact, Request::Ping).await? {
            Response::Ping => Ok(()),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn store(
        &self,
        contact: &ContactInfo,
        key: Identifier,
        value: Vec<u8>,
    ) -> Result<bool, RpcError> {
        match self
            .call_contact(contact, Request::Store(StoreRequest { key, value }))
            .await?
        {
            Response::Store(stored) => Ok(stored),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn find_node(
        &self,
        contact: &ContactInfo,
        target: Identifier,
    ) -> Result<Vec<ContactInfo>, RpcError> {
        let request = Request::FindNode(FindRequest {
            target,
            count: self.k as u16,
        });

        match self.call_contact(contact, request).await? {
            Response::FindNode(contacts) => {
                self.add_hearsay(&contacts);
                Ok(contacts)
            }
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn find_value(
        &self,
        contact: &ContactInfo,
        key: Identifier,
    ) -> Result<FindValueResult, RpcError> {
        let request = Request::FindValue(FindRequest {
            target: key,
            count: self.k as u16,
        });

        match self.call_contact(contact, request).await? {
            Response::FindValue(result) => {
                if let FindValueResult::Contacts(contacts) = &result {
                    self.add_hearsay(contacts);
                }
                Ok(result)
            }
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn check_file_exists(
        &self,
        contact: &ContactInfo,
        file: &FileQuery,
    ) -> Result<FileStatus, RpcError> {
        match self
            .call_contact(contact, Request::CheckFileExists(file.clone()))
            .await?
        {
            Response::CheckFileExists(status) => Ok(status),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn download_file(
        &self,
        contact: &ContactInfo,
        file: &FileQuery,
        range: ByteRange,
    ) -> Result<FileChunk, RpcError> {
        let request = Request::DownloadFile(ChunkRequest {
            file: file.clone(),
            range,
        });

        match self.call_contact(contact, request).await? {
            Response::DownloadFile(chunk) => Ok(chunk),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    /// Handshake with a peer we only know the address of. Returns its contact and the buckets it
    /// shares.
    pub async fn acknowledge(
        &self,
        addr: SocketAddr,
        buckets: Vec<String>,
    ) -> Result<(ContactInfo, Vec<String>), RpcError> {
        let request = Request::Acknowledge(Acknowledge {
            protocol_version: self.protocol_version,
            buckets,
        });

        let (sender, response) = self.call(addr, request).await?;

        match response {
            Response::Acknowledge(ack) if ack.protocol_version == self.protocol_version => {
                let contact = sender.contact_info(addr.ip());
                self.observe(contact.clone()).await;
                Ok((contact, ack.buckets))
            }
            Response::Acknowledge(ack) => Err(RpcError::VersionMismatch(ack.protocol_version)),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    /// Record that `contact` just talked to us.
    ///
    /// If its bucket is full of live contacts, the least recently seen one is pinged and only
    /// evicted if it does not answer.
    pub async fn observe(&self, contact: ContactInfo) {
        let outcome = self
            .table
            .lock()
            .unwrap()
            .add_contact(Contact::as_good(contact.clone()));

        if let Some(InsertOutcome::Full { oldest }) = outcome {
            self.challenge(oldest, contact).await;
        }
    }

    /// Record contacts we were told about by another peer. They are not pinged, and are dropped
    /// if their bucket is full.
    pub fn add_hearsay(&self, contacts: &[ContactInfo]) {
        let mut table = self.table.lock().unwrap();

        for contact in contacts {
            table.add_contact(Contact::as_questionable(contact.clone()));
        }
    }

    async fn challenge(&self, oldest: Contact, candidate: ContactInfo) {
        let alive = matches!(
            self.call(oldest.addr(), Request::Ping).await,
            Ok((sender, Response::Ping)) if sender.id == oldest.id()
        );

        let mut table = self.table.lock().unwrap();

        if alive {
            log::trace!("Keeping {:?}, dropping {:?}", oldest, candidate);
            table.mark_seen(&oldest.id());
        } else {
            log::debug!("Evicting unresponsive {:?} for {:?}", oldest, candidate);
            table.replace(&oldest.id(), Contact::as_good(candidate));
        }
    }

    async fn call_contact(
        &self,
        contact: &ContactInfo,
        request: Request,
    ) -> Result<Response, RpcError> {
        match self.call(contact.addr, request).await {
            Ok((sender, response)) => {
                self.observe(sender.contact_info(contact.addr.ip())).await;
                Ok(response)
            }
            Err(error) => {
                log::debug!("Request to {:?} failed: {}", contact, error);
                self.table.lock().unwrap().request_failed(&contact.id);
                Err(error)
            }
        }
    }

    async fn call(
        &self,
        addr: SocketAddr,
        request: Request,
    ) -> Result<(Sender, Response), RpcError> {
        let opcode = request.opcode();
        let message = Message {
            correlation_id: self.next_correlation_id.fetch_add(1, Ordering::Relaxed),
            sender: self.local.clone(),
            body: MessageBody::Request(request),
        };

        let response = self.transport.request(addr, message, self.timeout).await?;

        match response.body {
            MessageBody::Response(body) if body.opcode() == opcode => Ok((response.sender, body)),
            MessageBody::Error(_, message) => Err(RpcError::Remote(message)),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::contact::ContactStatus;
    use crate::test::{self, MockNetwork, MockPeer};

    #[tokio::test]
    async fn positive_response_touches_contact() {
        let network = MockNetwork::new();
        let peer = network.add_peer(MockPeer::new());
        let rpc = network.rpc(Identifier::random());

        rpc.add_hearsay(&[peer.clone()]);
        rpc.ping(&peer).await.unwrap();

        let mut table = rpc.table().lock().unwrap();
        let contact = table.find_contact_mut(&peer.id).unwrap();
        assert_eq!(contact.status(), ContactStatus::Good);
    }

    #[tokio::test]
    async fn negative_timeouts_make_contact_bad() {
        let network = MockNetwork::new();
        let peer = network.add_peer(MockPeer::new().unreachable());
        let rpc = network.rpc(Identifier::random());

        rpc.add_hearsay(&[peer.clone()]);
        assert!(rpc.ping(&peer).await.is_err());
        assert!(rpc.ping(&peer).await.is_err());

        assert!(rpc.table().lock().unwrap().online_contacts().is_empty());
    }

    #[tokio::test]
    async fn positive_full_bucket_keeps_live_oldest() {
        let network = MockNetwork::new();
        let local_id = Identifier::from([0u8; 20]);
        let rpc = network.rpc_with_bucket_size(local_id, 1);

        // Both ids share no prefix bit with the local id and land in bucket 0.
        let first = network.add_peer(MockPeer::with_id(test::id_in_bucket(&local_id, 0)));
        let second = network.add_peer(MockPeer::with_id(test::id_in_bucket(&local_id, 0)));

        rpc.ping(&first).await.unwrap();
        rpc.ping(&second).await.unwrap();

        let contacts = rpc.table().lock().unwrap().online_contacts();
        assert_eq!(contacts, vec![first]);
    }

    #[tokio::test]
    async fn positive_full_bucket_evicts_dead_oldest() {
        let network = MockNetwork::new();
        let local_id = Identifier::from([0u8; 20]);
        let rpc = network.rpc_with_bucket_size(local_id, 1);

        let first = network.add_peer(MockPeer::with_id(test::id_in_bucket(&local_id, 0)));
        let second = network.add_peer(MockPeer::with_id(test::id_in_bucket(&local_id, 0)));

        rpc.ping(&first).await.unwrap();
        network.set_reachable(&first.addr, false);
        rpc.ping(&second).await.unwrap();

        let contacts = rpc.table().lock().unwrap().online_contacts();
        assert_eq!(contacts, vec![second]);
    }

    #[tokio::test]
    async fn positive_find_node_adds_hearsay() {
        let network = MockNetwork::new();
        let known = test::dummy_contact_infos(5);
        let peer = network.add_peer(MockPeer::new().knowing(known.clone()));
        let rpc = network.rpc(Identifier::random());

        let found = rpc.find_node(&peer, Identifier::random()).await.unwrap();

        assert_eq!(found.len(), known.len());
        // The answering peer plus everything it told us about.
        assert_eq!(
            rpc.table().lock().unwrap().online_contacts().len(),
            known.len() + 1
        );
    }

    #[tokio::test]
    async fn negative_acknowledge_version_mismatch() {
        let network = MockNetwork::new();
        let peer = network.add_peer(MockPeer::new().protocol_version(99));
        let rpc = network.rpc(Identifier::random());

        assert!(matches!(
            rpc.acknowledge(peer.addr, vec![]).await,
            Err(RpcError::VersionMismatch(99))
        ));
    }
}
