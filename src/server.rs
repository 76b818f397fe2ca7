//! Answers requests coming from other peers.

use crate::{
    id::Identifier,
    message::{Acknowledge, FindValueResult, Message, MessageBody, Request, Response},
    provider::FileProvider,
    routing::contact::ContactInfo,
    rpc::Rpc,
    storage::ValueStore,
    transport::{read_frame, write_frame, TransportError},
};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
    task, time,
};
use tokio_util::sync::CancellationToken;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) struct Server {
    rpc: Arc<Rpc>,
    storage: Mutex<ValueStore>,
    provider: Arc<dyn FileProvider>,
    protocol_version: u16,
    acknowledged_tx: mpsc::UnboundedSender<ContactInfo>,
}

impl Server {
    /// `acknowledged_tx` receives every peer that completed a handshake with us.
    pub fn new(
        rpc: Arc<Rpc>,
        provider: Arc<dyn FileProvider>,
        protocol_version: u16,
        acknowledged_tx: mpsc::UnboundedSender<ContactInfo>,
    ) -> Self {
        Self {
            rpc,
            storage: Mutex::new(ValueStore::new()),
            provider,
            protocol_version,
            acknowledged_tx,
        }
    }

    /// Handle one incoming message, returning the response to send back, if any.
    pub async fn handle(&self, message: Message, peer: SocketAddr) -> Option<Message> {
        let opcode = message.opcode();

        let request = match message.body {
            MessageBody::Request(request) => request,
            _ => {
                log::debug!("Ignoring unsolicited {:?} from {}", opcode, peer);
                return None;
            }
        };

        log::trace!("Received {:?} from {}", request, peer);

        let contact = message.sender.contact_info(peer.ip());

        let body = match request {
            Request::Acknowledge(ack) => {
                if ack.protocol_version == self.protocol_version {
                    self.touch(contact.clone());
                    self.acknowledged_tx.send(contact).unwrap_or(());
                } else {
                    log::debug!(
                        "Peer {:?} speaks protocol version {}, ignoring",
                        contact,
                        ack.protocol_version
                    );
                }

                Ok(Response::Acknowledge(Acknowledge {
                    protocol_version: self.protocol_version,
                    buckets: self.provider.buckets(),
                }))
            }
            request => {
                self.touch(contact.clone());
                self.handle_request(request, &contact).await
            }
        };

        let body = match body {
            Ok(response) => MessageBody::Response(response),
            Err(error) => MessageBody::Error(opcode, error),
        };

        Some(Message {
            correlation_id: message.correlation_id,
            sender: self.rpc.local().clone(),
            body,
        })
    }

    async fn handle_request(
        &self,
        request: Request,
        requester: &ContactInfo,
    ) -> Result<Response, String> {
        match request {
            Request::Acknowledge(_) => Err("unexpected acknowledge".to_owned()),
            Request::Ping => Ok(Response::Ping),
            Request::Store(store) => {
                let stored = self.storage.lock().unwrap().put(store.key, store.value);

                if !stored {
                    log::warn!("Value store is full, rejecting value from {:?}", requester);
                }

                Ok(Response::Store(stored))
            }
            Request::FindNode(find) => Ok(Response::FindNode(
                self.closest_contacts(&find.target, find.count, requester),
            )),
            Request::FindValue(find) => {
                let value = self.storage.lock().unwrap().get(&find.target);

                let result = match value {
                    Some(value) => FindValueResult::Value(value),
                    None => FindValueResult::Contacts(self.closest_contacts(
                        &find.target,
                        find.count,
                        requester,
                    )),
                };

                Ok(Response::FindValue(result))
            }
            Request::CheckFileExists(file) => self
                .provider
                .file_status(&file)
                .await
                .map(Response::CheckFileExists)
                .map_err(|error| error.to_string()),
            Request::DownloadFile(chunk) => self
                .provider
                .read_chunk(&chunk.file, chunk.range)
                .await
                .map(Response::DownloadFile)
                .map_err(|error| error.to_string()),
        }
    }

    fn closest_contacts(
        &self,
        target: &Identifier,
        count: u16,
        requester: &ContactInfo,
    ) -> Vec<ContactInfo> {
        let count = (count as usize).min(self.rpc.k());

        self.rpc
            .table()
            .lock()
            .unwrap()
            .closest_contacts(target, count + 1)
            .into_iter()
            .filter(|contact| contact != requester)
            .take(count)
            .collect()
    }

    // Runs in the background so a full bucket check never delays the response.
    fn touch(&self, contact: ContactInfo) {
        let rpc = self.rpc.clone();
        task::spawn(async move { rpc.observe(contact).await });
    }
}

/// Accept connections until `cancel` fires.
pub(crate) async fn serve(listener: TcpListener, server: Arc<Server>, cancel: CancellationToken) {
    loop {
        select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    task::spawn(serve_connection(stream, peer, server.clone(), cancel.clone()));
                }
                Err(error) => {
                    log::warn!("Failed to accept connection: {}", error);
                    time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    log::debug!("Server stopped");
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    server: Arc<Server>,
    cancel: CancellationToken,
) {
    stream.set_nodelay(true).unwrap_or(());

    loop {
        let frame = select! {
            _ = cancel.cancelled() => return,
            frame = read_frame(&mut stream) => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(TransportError::Closed) => return,
            Err(error) => {
                log::debug!("Dropping connection from {}: {}", peer, error);
                return;
            }
        };

        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(error) => {
                log::warn!("Dropping malformed frame from {}: {}", peer, error);
                continue;
            }
        };

        if let Some(response) = server.handle(message, peer).await {
            if let Err(error) = write_frame(&mut stream, &response.encode()).await {
                log::debug!("Failed to answer {}: {}", peer, error);
                return;
            }
        }
    }
}
