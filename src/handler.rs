use crate::{
    action::{
        bootstrap::{State, TableBootstrap},
        refresh::TableRefresh,
    },
    config::Config,
    discovery::{DiscoveredPeer, Discovery, DiscoveryStats, DiscoveryStatsSnapshot},
    routing::contact::ContactInfo,
    rpc::Rpc,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    select,
    sync::{mpsc, oneshot, watch},
    task,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Something that happened to the service, reported to its owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceEvent {
    /// A handshake with a peer succeeded.
    ContactDiscovered(ContactInfo),
    /// The routing table got populated for the first time.
    BootstrapCompleted,
    /// The set of local interfaces changed and discovery sockets were rebuilt.
    InterfacesChanged,
}

/// Snapshot of the service internals, for debugging.
#[derive(Clone, Debug)]
pub struct DebugState {
    pub is_running: bool,
    pub bootstrapped: bool,
    pub good_contact_count: usize,
    pub questionable_contact_count: usize,
    /// Buckets holding at least one contact.
    pub bucket_count: usize,
    pub discovery_listeners: Vec<SocketAddr>,
    pub discovery: DiscoveryStatsSnapshot,
}

pub(crate) enum OneshotTask {
    /// Multicast an announcement. Answers with its correlation id, or `None` if discovery is
    /// disabled.
    QueryAllServices(oneshot::Sender<Option<u32>>),
    /// Handshake with a peer known by address only.
    AddNode(SocketAddr),
    /// Answers once the first bootstrap completed.
    CheckBootstrap(oneshot::Sender<()>),
    GetState(oneshot::Sender<DebugState>),
}

/// Event loop of a `LanService`: turns discovered and acknowledged peers into routing table
/// contacts and keeps the table and the discovery sockets fresh.
pub(crate) struct ServiceHandler {
    running: bool,
    rpc: Arc<Rpc>,
    buckets: Vec<String>,
    discovery: Option<Discovery>,
    stats: Arc<DiscoveryStats>,
    bootstrap: Arc<TableBootstrap>,
    bootstrap_rx: watch::Receiver<State>,
    bootstrap_txs: Vec<oneshot::Sender<()>>,
    refresh: Arc<TableRefresh>,
    refresh_timer: Interval,
    interface_timer: Interval,
    command_rx: mpsc::UnboundedReceiver<OneshotTask>,
    peer_rx: mpsc::UnboundedReceiver<DiscoveredPeer>,
    acknowledged_rx: mpsc::UnboundedReceiver<ContactInfo>,
    event_tx: mpsc::UnboundedSender<ServiceEvent>,
    cancel: CancellationToken,
}

pub(crate) struct HandlerChannels {
    pub command_rx: mpsc::UnboundedReceiver<OneshotTask>,
    pub peer_rx: mpsc::UnboundedReceiver<DiscoveredPeer>,
    pub acknowledged_rx: mpsc::UnboundedReceiver<ContactInfo>,
    pub event_tx: mpsc::UnboundedSender<ServiceEvent>,
}

impl ServiceHandler {
    pub fn new(
        config: &Config,
        rpc: Arc<Rpc>,
        buckets: Vec<String>,
        discovery: Option<Discovery>,
        stats: Arc<DiscoveryStats>,
        channels: HandlerChannels,
        cancel: CancellationToken,
    ) -> Self {
        let bootstrap = Arc::new(TableBootstrap::new(
            rpc.clone(),
            config.lookup_alpha,
            config.max_lookup_rounds,
        ));
        let refresh = Arc::new(TableRefresh::new(
            rpc.clone(),
            config.lookup_alpha,
            config.max_lookup_rounds,
        ));

        Self {
            running: true,
            bootstrap_rx: bootstrap.subscribe(),
            bootstrap,
            bootstrap_txs: Vec::new(),
            refresh,
            refresh_timer: timer(config.refresh_interval),
            interface_timer: timer(config.interface_poll_interval),
            rpc,
            buckets,
            discovery,
            stats,
            command_rx: channels.command_rx,
            peer_rx: channels.peer_rx,
            acknowledged_rx: channels.acknowledged_rx,
            event_tx: channels.event_tx,
            cancel,
        }
    }

    pub async fn run(mut self) {
        while self.running {
            self.run_once().await
        }

        self.cancel.cancel();
        log::debug!("ServiceHandler stopped");
    }

    async fn run_once(&mut self) {
        select! {
            _ = self.cancel.cancelled() => self.shutdown(),
            command = self.command_rx.recv() => {
                if let Some(command) = command {
                    self.handle_command(command).await
                } else {
                    self.shutdown()
                }
            }
            Some(peer) = self.peer_rx.recv() => self.handle_discovered(peer),
            Some(contact) = self.acknowledged_rx.recv() => self.handle_acknowledged(contact),
            result = self.bootstrap_rx.changed() => {
                if result.is_ok() && self.is_bootstrapped() {
                    self.handle_bootstrap_success();
                }
            }
            _ = self.refresh_timer.tick() => self.handle_check_table_refresh(),
            _ = self.interface_timer.tick(), if self.discovery.is_some() => {
                self.handle_check_interfaces().await
            }
        }
    }

    fn is_bootstrapped(&self) -> bool {
        *self.bootstrap_rx.borrow() == State::Bootstrapped
    }

    async fn handle_command(&mut self, task: OneshotTask) {
        match task {
            OneshotTask::QueryAllServices(tx) => {
                let correlation_id = self.handle_query_all_services().await;
                tx.send(correlation_id).unwrap_or(())
            }
            OneshotTask::AddNode(addr) => self.start_handshake(addr),
            OneshotTask::CheckBootstrap(tx) => self.handle_check_bootstrap(tx),
            OneshotTask::GetState(tx) => self.handle_get_state(tx),
        }
    }

    async fn handle_query_all_services(&self) -> Option<u32> {
        let discovery = self.discovery.as_ref()?;
        let correlation_id = discovery.announce().await;

        log::debug!("Announced ourselves (correlation id {})", correlation_id);

        Some(correlation_id)
    }

    fn handle_discovered(&self, peer: DiscoveredPeer) {
        log::debug!("Discovered {} at {}", peer.machine_id, peer.addr);
        self.start_handshake(peer.addr);
    }

    /// Acknowledge exchange with `addr`, followed by a bootstrap against the peer found there.
    fn start_handshake(&self, addr: SocketAddr) {
        let rpc = self.rpc.clone();
        let bootstrap = self.bootstrap.clone();
        let buckets = self.buckets.clone();
        let stats = self.stats.clone();
        let event_tx = self.event_tx.clone();

        task::spawn(async move {
            let contact = match rpc.acknowledge(addr, buckets).await {
                Ok((contact, remote_buckets)) => {
                    log::debug!("Handshake with {:?} (buckets {:?})", contact, remote_buckets);
                    contact
                }
                Err(error) => {
                    log::debug!("Handshake with {} failed: {}", addr, error);
                    return;
                }
            };

            stats.acknowledge_exchanged();
            event_tx
                .send(ServiceEvent::ContactDiscovered(contact.clone()))
                .unwrap_or(());

            bootstrap.bootstrap(contact).await.ok();
        });
    }

    /// A peer completed a handshake with us.
    fn handle_acknowledged(&self, contact: ContactInfo) {
        log::debug!("Acknowledged by {:?}", contact);

        self.event_tx
            .send(ServiceEvent::ContactDiscovered(contact.clone()))
            .unwrap_or(());

        let bootstrap = self.bootstrap.clone();
        task::spawn(async move { bootstrap.bootstrap(contact).await.ok() });
    }

    fn handle_check_bootstrap(&mut self, tx: oneshot::Sender<()>) {
        if self.is_bootstrapped() {
            tx.send(()).unwrap_or(())
        } else {
            self.bootstrap_txs.push(tx);
        }
    }

    fn handle_bootstrap_success(&mut self) {
        // Send notification that the bootstrap has completed.
        for tx in self.bootstrap_txs.drain(..) {
            tx.send(()).unwrap_or(())
        }

        self.event_tx
            .send(ServiceEvent::BootstrapCompleted)
            .unwrap_or(());
    }

    fn handle_check_table_refresh(&self) {
        if !self.is_bootstrapped() {
            return;
        }

        let refresh = self.refresh.clone();
        task::spawn(async move {
            refresh.continue_refresh().await;
        });
    }

    async fn handle_check_interfaces(&mut self) {
        let discovery = match self.discovery.as_mut() {
            Some(discovery) => discovery,
            None => return,
        };

        match discovery.poll_interfaces().await {
            Ok(true) => {
                self.event_tx
                    .send(ServiceEvent::InterfacesChanged)
                    .unwrap_or(());

                // Peers reachable through the new interfaces do not know about us yet.
                discovery.announce().await;
            }
            Ok(false) => (),
            Err(error) => log::warn!("Failed to refresh discovery sockets: {}", error),
        }
    }

    fn handle_get_state(&self, tx: oneshot::Sender<DebugState>) {
        let table = self.rpc.table().lock().unwrap();

        tx.send(DebugState {
            is_running: self.running,
            bootstrapped: self.is_bootstrapped(),
            good_contact_count: table.num_good_contacts(),
            questionable_contact_count: table.num_questionable_contacts(),
            bucket_count: table.buckets().filter(|bucket| !bucket.is_empty()).count(),
            discovery_listeners: self
                .discovery
                .as_ref()
                .map(|discovery| discovery.listener_addrs().to_vec())
                .unwrap_or_default(),
            discovery: self.stats.snapshot(),
        })
        .unwrap_or(())
    }

    fn shutdown(&mut self) {
        self.running = false;
    }
}

// Interval whose first tick is one period from now.
fn timer(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
