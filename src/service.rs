use crate::{
    action::lookup::{LookupOutcome, ParallelRouter},
    config::{Config, IpVersion},
    discovery::{Discovery, DiscoveryError, DiscoveryStats, InterfaceProbe, RouteProbe},
    download::{DownloadError, DownloadRequest, Downloader},
    handler::{DebugState, HandlerChannels, OneshotTask, ServiceEvent, ServiceHandler},
    id::Identifier,
    message::Sender,
    provider::{FileProvider, FolderProvider},
    routing::{contact::ContactInfo, table::RoutingTable},
    rpc::Rpc,
    server::{self, Server},
    transport::TcpTransport,
};
use std::{
    collections::HashSet,
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    net::TcpListener,
    pin, select,
    sync::{mpsc, oneshot},
    task, time,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("no free TCP port in {0}..={1}")]
    NoFreePort(u16, u16),
    #[error("io error")]
    Io(#[from] io::Error),
    #[error("discovery failed to start")]
    Discovery(#[from] DiscoveryError),
}

/// Discovers peers on the local network, keeps a routing table of them and downloads files from
/// them.
///
/// This type is cheaply cloneable where each clone refers to the same underlying service.
#[derive(Clone)]
pub struct LanService {
    send: mpsc::UnboundedSender<OneshotTask>,
    rpc: Arc<Rpc>,
    config: Arc<Config>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl LanService {
    /// Create a new ServiceBuilder.
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder {
            config: Config::default(),
            local_id: None,
            folders: FolderProvider::new(),
            provider: None,
            nodes: HashSet::new(),
            probe: None,
        }
    }

    /// Address the RPC listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_id(&self) -> Identifier {
        self.rpc.local_id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Announce ourselves on every discovery port of the multicast groups. Peers hearing it
    /// handshake with us. Returns the correlation id of the announcement, or `None` if discovery
    /// is disabled or the service stopped.
    pub async fn query_all_services(&self) -> Option<u32> {
        let (tx, rx) = oneshot::channel();

        if self.send.send(OneshotTask::QueryAllServices(tx)).is_err() {
            None
        } else {
            rx.await.ok().flatten()
        }
    }

    /// Handshake with a peer whose address is known, e.g. from a previous session.
    pub fn add_node(&self, addr: SocketAddr) {
        if self.send.send(OneshotTask::AddNode(addr)).is_err() {
            log::error!("failed to add node - ServiceHandler has shut down");
        }
    }

    /// Waits until the first bootstrap completes, or returns immediately if it already
    /// completed. Returns whether it did before `timeout`.
    pub async fn bootstrapped(&self, timeout: Option<Duration>) -> bool {
        let (tx, rx) = oneshot::channel();

        if self.send.send(OneshotTask::CheckBootstrap(tx)).is_err() {
            // handler has shut down, consider this as bootstrap failure.
            return false;
        }

        match timeout {
            Some(timeout) => matches!(time::timeout(timeout, rx).await, Ok(Ok(()))),
            None => rx.await.is_ok(),
        }
    }

    /// Get the state of the service, can be used for debugging.
    pub async fn state(&self) -> Option<DebugState> {
        let (tx, rx) = oneshot::channel();

        if self.send.send(OneshotTask::GetState(tx)).is_err() {
            None
        } else {
            rx.await.ok()
        }
    }

    /// Online contacts of the routing table.
    pub fn known_contacts(&self) -> Vec<ContactInfo> {
        self.rpc.table().lock().unwrap().online_contacts()
    }

    /// Store `value` on the contacts closest to `key`. Returns how many accepted it.
    pub async fn store(&self, key: Identifier, value: Vec<u8>) -> usize {
        self.router().store(key, value).await
    }

    /// Look `key` up on the network.
    pub async fn find_value(&self, key: Identifier) -> Option<Vec<u8>> {
        match self.router().find_value(key).await {
            LookupOutcome::Value(value) => Some(value),
            LookupOutcome::Contacts(_) => None,
        }
    }

    /// Download a file from the peers holding it into `request.folder`.
    ///
    /// Stopping the service cancels the download as well as `cancel` does.
    pub async fn download_file(
        &self,
        request: &DownloadRequest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        let downloader = Downloader::from_config(self.rpc.clone(), &self.config);
        let combined = self.cancel.child_token();

        let download = downloader.download_file(request, &combined);
        pin!(download);

        select! {
            result = &mut download => result,
            _ = cancel.cancelled() => {
                combined.cancel();
                download.await
            }
        }
    }

    /// Stop every task of the service. Ongoing downloads fail with `DownloadError::Cancelled`.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn router(&self) -> ParallelRouter<'_> {
        ParallelRouter::new(
            &self.rpc,
            self.config.lookup_alpha,
            self.config.max_lookup_rounds,
        )
    }
}

// ----------------------------------------------------------------------------//

/// Stores information for starting a `LanService`.
pub struct ServiceBuilder {
    config: Config,
    local_id: Option<Identifier>,
    folders: FolderProvider,
    provider: Option<Arc<dyn FileProvider>>,
    nodes: HashSet<SocketAddr>,
    probe: Option<Box<dyn InterfaceProbe>>,
}

impl ServiceBuilder {
    pub fn set_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn set_machine_id(mut self, machine_id: impl Into<String>) -> Self {
        self.config.machine_id = machine_id.into();
        self
    }

    /// Set the identifier of this peer. If not provided, a random one is generated.
    pub fn set_local_id(mut self, id: Identifier) -> Self {
        self.local_id = Some(id);
        self
    }

    /// Share the files under `root` as bucket `name`.
    pub fn add_bucket(mut self, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.folders = self.folders.add_bucket(name, root);
        self
    }

    /// Serve files from a custom provider. Buckets added with `add_bucket` are then ignored.
    pub fn set_provider(mut self, provider: Arc<dyn FileProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Add a peer to handshake with on start.
    pub fn add_node(mut self, addr: SocketAddr) -> Self {
        self.nodes.insert(addr);
        self
    }

    /// Replace how local interfaces are enumerated for discovery.
    pub fn set_interface_probe(mut self, probe: Box<dyn InterfaceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Bind the RPC listener and the discovery sockets and start the service. Events are
    /// reported on the returned channel.
    pub async fn start(
        self,
    ) -> Result<(LanService, mpsc::UnboundedReceiver<ServiceEvent>), StartError> {
        let config = Arc::new(self.config);
        let listener = bind_listener(&config).await?;
        let local_addr = listener.local_addr()?;
        let local_id = self.local_id.unwrap_or_else(Identifier::random);

        let rpc = Arc::new(Rpc::new(
            Arc::new(TcpTransport::new()),
            Arc::new(Mutex::new(RoutingTable::new(local_id, config.bucket_size))),
            Sender {
                id: local_id,
                tcp_port: local_addr.port(),
                machine_id: config.machine_id.clone(),
            },
            config.protocol_version,
            config.rpc_timeout,
            config.bucket_size,
        ));

        let folders = self.folders;
        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(folders) as Arc<dyn FileProvider>);
        let buckets = provider.buckets();

        let cancel = CancellationToken::new();
        let (acknowledged_tx, acknowledged_rx) = mpsc::unbounded_channel();
        let server = Arc::new(Server::new(
            rpc.clone(),
            provider,
            config.protocol_version,
            acknowledged_tx,
        ));
        task::spawn(server::serve(listener, server, cancel.clone()));

        let stats = Arc::new(DiscoveryStats::default());
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let discovery = if config.discovery_enabled {
            let probe = self
                .probe
                .unwrap_or_else(|| Box::new(default_probe(&config)) as Box<dyn InterfaceProbe>);

            match Discovery::start(
                config.clone(),
                local_addr.port(),
                probe,
                peer_tx,
                stats.clone(),
                cancel.clone(),
            )
            .await
            {
                Ok(discovery) => Some(discovery),
                Err(error) => {
                    cancel.cancel();
                    return Err(error.into());
                }
            }
        } else {
            None
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let handler = ServiceHandler::new(
            &config,
            rpc.clone(),
            buckets,
            discovery,
            stats,
            HandlerChannels {
                command_rx,
                peer_rx,
                acknowledged_rx,
                event_tx,
            },
            cancel.clone(),
        );

        for addr in self.nodes {
            if command_tx.send(OneshotTask::AddNode(addr)).is_err() {
                // `unreachable` is OK here because the corresponding receiver definitely exists
                // at this point inside `handler`.
                unreachable!()
            }
        }

        task::spawn(handler.run());

        log::info!(
            "Service {} ({}) listening on {}",
            local_id,
            config.machine_id,
            local_addr
        );

        let service = LanService {
            send: command_tx,
            rpc,
            config,
            local_addr,
            cancel,
        };

        Ok((service, event_rx))
    }
}

async fn bind_listener(config: &Config) -> Result<TcpListener, StartError> {
    let ports = config.tcp_ports();

    for port in ports.clone() {
        match TcpListener::bind((config.tcp_bind_ip, port)).await {
            Ok(listener) => return Ok(listener),
            Err(error) => log::debug!("TCP port {} unavailable: {}", port, error),
        }
    }

    Err(StartError::NoFreePort(*ports.start(), *ports.end()))
}

// Addresses the OS would send multicast traffic from.
fn default_probe(config: &Config) -> RouteProbe {
    RouteProbe::new(
        config
            .ip_versions
            .iter()
            .map(|ip_version: &IpVersion| config.multicast_group(*ip_version))
            .collect(),
    )
}
