use crate::message::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    ops::RangeInclusive,
    time::Duration,
};

pub const DEFAULT_MULTICAST_V4: Ipv4Addr = Ipv4Addr::new(239, 192, 77, 15);
pub const DEFAULT_MULTICAST_V6: Ipv6Addr = Ipv6Addr::new(0xff15, 0, 0, 0, 0, 0, 0xefc0, 0x4d0f);
pub const DEFAULT_PORT: u16 = 17500;
pub const DEFAULT_ALTERNATE_PORTS: u16 = 10;

#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy, Serialize, Deserialize)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => IpVersion::V4,
            SocketAddr::V6(_) => IpVersion::V6,
        }
    }

    pub fn unspecified(&self) -> IpAddr {
        match self {
            IpVersion::V4 => Ipv4Addr::UNSPECIFIED.into(),
            IpVersion::V6 => Ipv6Addr::UNSPECIFIED.into(),
        }
    }

    pub fn matches(&self, ip: &IpAddr) -> bool {
        matches!(
            (self, ip),
            (IpVersion::V4, IpAddr::V4(_)) | (IpVersion::V6, IpAddr::V6(_))
        )
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpVersion::V4 => write!(f, "IPv4"),
            IpVersion::V6 => write!(f, "IPv6"),
        }
    }
}

/// Settings of a `LanService`.
///
/// Everything here is supplied by the host process; nothing is computed from the environment
/// except the random machine id fallback.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identifies this machine. Announcements carrying our own machine id are ignored.
    pub machine_id: String,
    pub protocol_version: u16,

    pub multicast_v4: Ipv4Addr,
    pub multicast_v6: Ipv6Addr,
    /// First UDP port tried for the multicast listener.
    pub discovery_port: u16,
    /// First TCP port tried for the RPC listener.
    pub tcp_port: u16,
    /// Number of ports after the default one that may be used if it is taken.
    pub alternate_ports: u16,
    /// Address the RPC listener binds to.
    pub tcp_bind_ip: IpAddr,
    pub ip_versions: Vec<IpVersion>,
    /// Disables the multicast announcer/listener. Peers are then only learned from seeded nodes
    /// and from other peers.
    pub discovery_enabled: bool,

    #[serde(with = "secs")]
    pub duplicate_window: Duration,
    #[serde(with = "secs")]
    pub interface_poll_interval: Duration,
    #[serde(with = "secs")]
    pub rpc_timeout: Duration,
    #[serde(with = "secs")]
    pub refresh_interval: Duration,

    pub bucket_size: usize,
    pub lookup_alpha: usize,
    pub max_lookup_rounds: usize,

    pub max_chunk_size: u64,
    pub max_parallel: usize,
    pub max_repartition_rounds: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            machine_id: random_machine_id(),
            protocol_version: PROTOCOL_VERSION,
            multicast_v4: DEFAULT_MULTICAST_V4,
            multicast_v6: DEFAULT_MULTICAST_V6,
            discovery_port: DEFAULT_PORT,
            tcp_port: DEFAULT_PORT,
            alternate_ports: DEFAULT_ALTERNATE_PORTS,
            tcp_bind_ip: Ipv4Addr::UNSPECIFIED.into(),
            ip_versions: vec![IpVersion::V4, IpVersion::V6],
            discovery_enabled: true,
            duplicate_window: Duration::from_secs(30),
            interface_poll_interval: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(60),
            bucket_size: crate::routing::bucket::DEFAULT_BUCKET_SIZE,
            lookup_alpha: 3,
            max_lookup_rounds: 10,
            max_chunk_size: 1024 * 1024,
            max_parallel: 10,
            max_repartition_rounds: 8,
        }
    }
}

impl Config {
    pub fn discovery_ports(&self) -> RangeInclusive<u16> {
        port_range(self.discovery_port, self.alternate_ports)
    }

    pub fn tcp_ports(&self) -> RangeInclusive<u16> {
        port_range(self.tcp_port, self.alternate_ports)
    }

    pub fn multicast_group(&self, ip_version: IpVersion) -> IpAddr {
        match ip_version {
            IpVersion::V4 => self.multicast_v4.into(),
            IpVersion::V6 => self.multicast_v6.into(),
        }
    }
}

fn port_range(first: u16, alternates: u16) -> RangeInclusive<u16> {
    // Port 0 lets the OS choose, alternates make no sense then.
    if first == 0 {
        0..=0
    } else {
        first..=first.saturating_add(alternates)
    }
}

fn random_machine_id() -> String {
    format!("machine-{:016x}", rand::random::<u64>())
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(value.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;

        if secs.is_finite() && secs >= 0.0 {
            Ok(Duration::from_secs_f64(secs))
        } else {
            Err(serde::de::Error::custom("duration must be a non-negative number"))
        }
    }
}
