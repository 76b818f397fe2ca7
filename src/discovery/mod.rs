//! LAN discovery over UDP multicast.
//!
//! Every peer listens on a multicast group (one per address family) and, on demand, announces
//! its TCP port to it. A received announcement is turned into a [`DiscoveredPeer`] which the
//! service then contacts over TCP for the handshake.

mod interfaces;
mod recent;

pub use self::interfaces::{InterfaceProbe, RouteProbe, StaticProbe};

use self::recent::RecentMessages;
use crate::{
    config::{Config, IpVersion},
    message::Announcement,
    socket::Socket,
};
use std::{
    collections::BTreeSet,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV6},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{net::UdpSocket, select, sync::mpsc, task, time};
use tokio_util::sync::CancellationToken;

const LISTENER_RESTART_DELAY: Duration = Duration::from_secs(1);
const MAX_DATAGRAM_LEN: usize = 1500;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no free {0} discovery port")]
    NoFreePort(IpVersion),
    #[error("io error")]
    Io(#[from] io::Error),
}

/// A peer that announced itself, reachable over TCP at `addr`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub addr: SocketAddr,
    pub machine_id: String,
    pub correlation_id: u32,
}

/// Counters describing discovery traffic.
#[derive(Default, Debug)]
pub struct DiscoveryStats {
    announcements_sent: AtomicU64,
    announcements_received: AtomicU64,
    duplicates_suppressed: AtomicU64,
    malformed_datagrams: AtomicU64,
    ignored_announcements: AtomicU64,
    acknowledge_exchanges: AtomicU64,
    listener_restarts: AtomicU64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryStatsSnapshot {
    pub announcements_sent: u64,
    pub announcements_received: u64,
    pub duplicates_suppressed: u64,
    pub malformed_datagrams: u64,
    /// Own announcements and announcements in another protocol version.
    pub ignored_announcements: u64,
    pub acknowledge_exchanges: u64,
    pub listener_restarts: u64,
}

impl DiscoveryStats {
    pub fn snapshot(&self) -> DiscoveryStatsSnapshot {
        DiscoveryStatsSnapshot {
            announcements_sent: self.announcements_sent.load(Ordering::Relaxed),
            announcements_received: self.announcements_received.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            malformed_datagrams: self.malformed_datagrams.load(Ordering::Relaxed),
            ignored_announcements: self.ignored_announcements.load(Ordering::Relaxed),
            acknowledge_exchanges: self.acknowledge_exchanges.load(Ordering::Relaxed),
            listener_restarts: self.listener_restarts.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn acknowledge_exchanged(&self) {
        self.acknowledge_exchanges.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decides what to do with received datagrams. Shared by all listeners of a service.
pub(crate) struct AnnouncementFilter {
    machine_id: String,
    protocol_version: u16,
    recent: Mutex<RecentMessages<(String, u32)>>,
    stats: Arc<DiscoveryStats>,
}

impl AnnouncementFilter {
    pub fn new(config: &Config, stats: Arc<DiscoveryStats>) -> Self {
        Self {
            machine_id: config.machine_id.clone(),
            protocol_version: config.protocol_version,
            recent: Mutex::new(RecentMessages::new(config.duplicate_window)),
            stats,
        }
    }

    /// The peer to contact for a datagram received from `from`, if any.
    pub fn accept(&self, datagram: &[u8], from: SocketAddr) -> Option<DiscoveredPeer> {
        let announcement = match Announcement::decode(datagram) {
            Ok(announcement) => announcement,
            Err(error) => {
                self.stats.malformed_datagrams.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropping malformed datagram from {}: {}", from, error);
                return None;
            }
        };

        if announcement.protocol_version != self.protocol_version
            || announcement.machine_id == self.machine_id
        {
            self.stats
                .ignored_announcements
                .fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let fresh = self
            .recent
            .lock()
            .unwrap()
            .insert((announcement.machine_id.clone(), announcement.correlation_id));

        if !fresh {
            self.stats
                .duplicates_suppressed
                .fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.stats
            .announcements_received
            .fetch_add(1, Ordering::Relaxed);

        log::debug!(
            "Announcement {} from {} ({})",
            announcement.correlation_id,
            from,
            announcement.machine_id
        );

        Some(DiscoveredPeer {
            addr: with_port(from, announcement.tcp_port),
            machine_id: announcement.machine_id,
            correlation_id: announcement.correlation_id,
        })
    }
}

/// Multicast announcer and listeners, rebuilt whenever the set of local interfaces changes.
pub(crate) struct Discovery {
    config: Arc<Config>,
    tcp_port: u16,
    stats: Arc<DiscoveryStats>,
    filter: Arc<AnnouncementFilter>,
    probe: Box<dyn InterfaceProbe>,
    peer_tx: mpsc::UnboundedSender<DiscoveredPeer>,
    cancel: CancellationToken,

    interfaces: BTreeSet<IpAddr>,
    senders: Vec<Socket>,
    listener_addrs: Vec<SocketAddr>,
    // Cancels the listeners of the current interface set.
    listeners_cancel: CancellationToken,
}

impl Discovery {
    pub async fn start(
        config: Arc<Config>,
        tcp_port: u16,
        probe: Box<dyn InterfaceProbe>,
        peer_tx: mpsc::UnboundedSender<DiscoveredPeer>,
        stats: Arc<DiscoveryStats>,
        cancel: CancellationToken,
    ) -> Result<Self, DiscoveryError> {
        let filter = Arc::new(AnnouncementFilter::new(&config, stats.clone()));
        let interfaces = probe.local_addresses().await.unwrap_or_else(|error| {
            log::warn!("Failed to enumerate local interfaces: {}", error);
            BTreeSet::new()
        });

        let mut discovery = Self {
            config,
            tcp_port,
            stats,
            filter,
            probe,
            peer_tx,
            listeners_cancel: cancel.child_token(),
            cancel,
            interfaces,
            senders: Vec::new(),
            listener_addrs: Vec::new(),
        };

        discovery.rebuild().await?;

        Ok(discovery)
    }

    pub fn stats(&self) -> &Arc<DiscoveryStats> {
        &self.stats
    }

    pub fn listener_addrs(&self) -> &[SocketAddr] {
        &self.listener_addrs
    }

    /// Send one announcement from every sender socket to every discovery port of the group.
    pub async fn announce(&self) -> u32 {
        let announcement = Announcement {
            correlation_id: rand::random(),
            protocol_version: self.config.protocol_version,
            tcp_port: self.tcp_port,
            machine_id: self.config.machine_id.clone(),
        };

        for socket in &self.senders {
            let group = self.config.multicast_group(socket.ip_version());

            for port in self.config.discovery_ports() {
                match socket.send(&announcement, (group, port).into()).await {
                    Ok(()) => {
                        self.stats
                            .announcements_sent
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    Err(error) => log::debug!(
                        "{}: Failed to announce from {}: {}",
                        socket.ip_version(),
                        socket.local_addr(),
                        error
                    ),
                }
            }
        }

        announcement.correlation_id
    }

    /// Re-probe the local interfaces and rebuild the sockets if they changed. Returns whether
    /// they did.
    pub async fn poll_interfaces(&mut self) -> Result<bool, DiscoveryError> {
        let interfaces = self.probe.local_addresses().await?;

        if interfaces == self.interfaces {
            return Ok(false);
        }

        log::info!(
            "Local interfaces changed {:?} -> {:?}",
            self.interfaces,
            interfaces
        );

        self.interfaces = interfaces;
        self.rebuild().await?;

        Ok(true)
    }

    async fn rebuild(&mut self) -> Result<(), DiscoveryError> {
        self.listeners_cancel.cancel();
        self.listeners_cancel = self.cancel.child_token();
        self.senders.clear();
        self.listener_addrs.clear();

        let mut last_error = None;

        for ip_version in self.config.ip_versions.clone() {
            let interfaces: Vec<IpAddr> = self
                .interfaces
                .iter()
                .filter(|ip| ip_version.matches(ip))
                .copied()
                .collect();

            match bind_listener(&self.config, ip_version, &interfaces).await {
                Ok(socket) => {
                    self.listener_addrs.push(socket.local_addr());
                    task::spawn(run_listener(
                        socket,
                        self.config.clone(),
                        interfaces.clone(),
                        self.filter.clone(),
                        self.stats.clone(),
                        self.peer_tx.clone(),
                        self.listeners_cancel.clone(),
                    ));
                }
                Err(error) => {
                    log::warn!("{}: Failed to start listener: {}", ip_version, error);
                    last_error = Some(error);
                    continue;
                }
            }

            self.senders.extend(bind_senders(ip_version, &interfaces).await);
        }

        if self.listener_addrs.is_empty() {
            if let Some(error) = last_error {
                return Err(error);
            }
        }

        Ok(())
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.listeners_cancel.cancel();
    }
}

async fn run_listener(
    mut socket: Socket,
    config: Arc<Config>,
    interfaces: Vec<IpAddr>,
    filter: Arc<AnnouncementFilter>,
    stats: Arc<DiscoveryStats>,
    peer_tx: mpsc::UnboundedSender<DiscoveredPeer>,
    cancel: CancellationToken,
) {
    let ip_version = socket.ip_version();
    let mut buffer = vec![0u8; MAX_DATAGRAM_LEN];

    loop {
        loop {
            let (len, from) = select! {
                _ = cancel.cancelled() => return,
                result = socket.recv(&mut buffer) => match result {
                    Ok(received) => received,
                    Err(error) => {
                        log::warn!("{}: Listener failed, restarting: {}", ip_version, error);
                        break;
                    }
                },
            };

            if let Some(peer) = filter.accept(&buffer[..len], from) {
                if peer_tx.send(peer).is_err() {
                    return;
                }
            }
        }

        // Only this listener restarts, the rest of the service keeps running.
        stats.listener_restarts.fetch_add(1, Ordering::Relaxed);

        socket = loop {
            select! {
                _ = cancel.cancelled() => return,
                _ = time::sleep(LISTENER_RESTART_DELAY) => (),
            }

            match bind_listener(&config, ip_version, &interfaces).await {
                Ok(socket) => break socket,
                Err(error) => log::warn!("{}: Failed to restart listener: {}", ip_version, error),
            }
        };
    }
}

/// Bind the multicast listener to the first free discovery port and join the group on every
/// interface.
async fn bind_listener(
    config: &Config,
    ip_version: IpVersion,
    interfaces: &[IpAddr],
) -> Result<Socket, DiscoveryError> {
    let group = config.multicast_group(ip_version);

    for port in config.discovery_ports() {
        let socket = match UdpSocket::bind((ip_version.unspecified(), port)).await {
            Ok(socket) => socket,
            Err(error) => {
                log::trace!("{}: Discovery port {} unavailable: {}", ip_version, port, error);
                continue;
            }
        };

        join_group(&socket, group, interfaces);

        let socket = Socket::new(socket)?;
        log::debug!("{}: Listening for announcements on {}", ip_version, socket.local_addr());

        return Ok(socket);
    }

    Err(DiscoveryError::NoFreePort(ip_version))
}

fn join_group(socket: &UdpSocket, group: IpAddr, interfaces: &[IpAddr]) {
    let result = match group {
        IpAddr::V4(group) => {
            let mut joined = false;

            for interface in interfaces {
                if let IpAddr::V4(interface) = interface {
                    match socket.join_multicast_v4(group, *interface) {
                        Ok(()) => joined = true,
                        Err(error) => log::debug!(
                            "IPv4: Failed to join {} on {}: {}",
                            group,
                            interface,
                            error
                        ),
                    }
                }
            }

            if joined {
                Ok(())
            } else {
                socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
            }
        }
        IpAddr::V6(group) => socket.join_multicast_v6(&group, 0),
    };

    if let Err(error) = result {
        log::warn!("Failed to join multicast group {}: {}", group, error);
    }
}

/// One sender socket per local interface address, or a single unbound one if there is none.
async fn bind_senders(ip_version: IpVersion, interfaces: &[IpAddr]) -> Vec<Socket> {
    let mut addrs: Vec<IpAddr> = interfaces.to_vec();

    if addrs.is_empty() {
        addrs.push(ip_version.unspecified());
    }

    let mut senders = Vec::new();

    for ip in addrs {
        let socket = match UdpSocket::bind((ip, 0)).await {
            Ok(socket) => socket,
            Err(error) => {
                log::debug!("{}: Cannot send from {}: {}", ip_version, ip, error);
                continue;
            }
        };

        let configured = match ip_version {
            IpVersion::V4 => socket
                .set_multicast_loop_v4(true)
                .and_then(|()| socket.set_multicast_ttl_v4(1)),
            IpVersion::V6 => socket.set_multicast_loop_v6(true),
        };

        if let Err(error) = configured {
            log::debug!("{}: Failed to configure sender {}: {}", ip_version, ip, error);
        }

        match Socket::new(socket) {
            Ok(socket) => senders.push(socket),
            Err(error) => log::debug!("{}: Sender socket unusable: {}", ip_version, error),
        }
    }

    senders
}

fn with_port(from: SocketAddr, port: u16) -> SocketAddr {
    match from {
        SocketAddr::V4(addr) => SocketAddr::new((*addr.ip()).into(), port),
        // Keep the scope, link-local peers are unreachable without it.
        SocketAddr::V6(addr) => {
            SocketAddrV6::new(*addr.ip(), port, addr.flowinfo(), addr.scope_id()).into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn config(machine_id: &str) -> Config {
        Config {
            machine_id: machine_id.to_owned(),
            discovery_port: 0,
            ip_versions: vec![IpVersion::V4],
            ..Config::default()
        }
    }

    fn announcement(machine_id: &str, correlation_id: u32) -> Vec<u8> {
        Announcement {
            correlation_id,
            protocol_version: crate::message::PROTOCOL_VERSION,
            tcp_port: 17600,
            machine_id: machine_id.to_owned(),
        }
        .encode()
    }

    fn from() -> SocketAddr {
        (Ipv4Addr::new(192, 168, 1, 30), 17500).into()
    }

    #[test]
    fn positive_announcement_yields_peer_at_tcp_port() {
        let stats = Arc::new(DiscoveryStats::default());
        let filter = AnnouncementFilter::new(&config("local"), stats.clone());

        let peer = filter.accept(&announcement("remote", 1), from()).unwrap();

        assert_eq!(peer.addr, (Ipv4Addr::new(192, 168, 1, 30), 17600).into());
        assert_eq!(peer.machine_id, "remote");
        assert_eq!(stats.snapshot().announcements_received, 1);
    }

    #[test]
    fn positive_duplicate_suppressed() {
        let stats = Arc::new(DiscoveryStats::default());
        let filter = AnnouncementFilter::new(&config("local"), stats.clone());

        assert!(filter.accept(&announcement("remote", 1), from()).is_some());
        assert!(filter.accept(&announcement("remote", 1), from()).is_none());
        assert!(filter.accept(&announcement("remote", 2), from()).is_some());

        assert_eq!(stats.snapshot().duplicates_suppressed, 1);
    }

    #[test]
    fn negative_own_announcement_ignored() {
        let stats = Arc::new(DiscoveryStats::default());
        let filter = AnnouncementFilter::new(&config("local"), stats.clone());

        assert!(filter.accept(&announcement("local", 1), from()).is_none());
        assert_eq!(stats.snapshot().ignored_announcements, 1);
    }

    #[test]
    fn negative_other_protocol_version_ignored() {
        let stats = Arc::new(DiscoveryStats::default());
        let filter = AnnouncementFilter::new(&config("local"), stats.clone());

        let datagram = Announcement {
            correlation_id: 1,
            protocol_version: crate::message::PROTOCOL_VERSION + 1,
            tcp_port: 17600,
            machine_id: "remote".to_owned(),
        }
        .encode();

        assert!(filter.accept(&datagram, from()).is_none());
    }

    #[test]
    fn negative_garbage_counted() {
        let stats = Arc::new(DiscoveryStats::default());
        let filter = AnnouncementFilter::new(&config("local"), stats.clone());

        assert!(filter.accept(&[0xde, 0xad], from()).is_none());
        assert_eq!(stats.snapshot().malformed_datagrams, 1);
    }

    #[tokio::test]
    async fn positive_listener_reports_each_announcement_once() {
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let probe = StaticProbe([IpAddr::from(Ipv4Addr::LOCALHOST)].into_iter().collect());

        let discovery = Discovery::start(
            Arc::new(config("local")),
            17600,
            Box::new(probe),
            peer_tx,
            Arc::new(DiscoveryStats::default()),
            cancel.clone(),
        )
        .await
        .unwrap();

        let port = discovery.listener_addrs()[0].port();
        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let datagram = announcement("remote", 42);

        // Garbage first: the listener must survive it.
        sender
            .send_to(&[1, 2, 3], (Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();
        for _ in 0..3 {
            sender
                .send_to(&datagram, (Ipv4Addr::LOCALHOST, port))
                .await
                .unwrap();
        }

        let peer = peer_rx.recv().await.unwrap();
        assert_eq!(peer.correlation_id, 42);
        assert_eq!(peer.addr.port(), 17600);

        time::sleep(Duration::from_millis(100)).await;
        assert!(peer_rx.try_recv().is_err());

        let stats = discovery.stats().snapshot();
        assert_eq!(stats.duplicates_suppressed, 2);
        assert_eq!(stats.malformed_datagrams, 1);

        cancel.cancel();
    }

    #[tokio::test]
    async fn positive_interface_change_rebuilds_listeners() {
        let (peer_tx, _peer_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let mut discovery = Discovery::start(
            Arc::new(config("local")),
            17600,
            Box::new(StaticProbe(BTreeSet::new())),
            peer_tx,
            Arc::new(DiscoveryStats::default()),
            cancel.clone(),
        )
        .await
        .unwrap();

        assert!(!discovery.poll_interfaces().await.unwrap());

        discovery.probe = Box::new(StaticProbe(
            [IpAddr::from(Ipv4Addr::LOCALHOST)].into_iter().collect(),
        ));

        assert!(discovery.poll_interfaces().await.unwrap());
        assert_eq!(discovery.listener_addrs().len(), 1);

        cancel.cancel();
    }
}
