use async_trait::async_trait;
use std::{
    collections::BTreeSet,
    io,
    net::{IpAddr, SocketAddr},
};
use tokio::net::UdpSocket;

/// Enumerates the local addresses multicast traffic can leave from.
#[async_trait]
pub trait InterfaceProbe: Send + Sync {
    async fn local_addresses(&self) -> io::Result<BTreeSet<IpAddr>>;
}

/// Finds the local address the OS would route towards each target, by connecting an unbound UDP
/// socket. No datagram is sent.
pub struct RouteProbe {
    targets: Vec<IpAddr>,
}

impl RouteProbe {
    pub fn new(targets: Vec<IpAddr>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl InterfaceProbe for RouteProbe {
    async fn local_addresses(&self) -> io::Result<BTreeSet<IpAddr>> {
        let mut addresses = BTreeSet::new();

        for target in &self.targets {
            let bind_addr: SocketAddr = match target {
                IpAddr::V4(_) => (std::net::Ipv4Addr::UNSPECIFIED, 0).into(),
                IpAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
            };

            let socket = match UdpSocket::bind(bind_addr).await {
                Ok(socket) => socket,
                Err(error) => {
                    log::trace!("No {} socket available: {}", bind_addr, error);
                    continue;
                }
            };

            // The port is irrelevant, nothing is sent.
            if let Err(error) = socket.connect((*target, 9)).await {
                log::trace!("No route towards {}: {}", target, error);
                continue;
            }

            let local = socket.local_addr()?.ip();

            if !local.is_unspecified() {
                addresses.insert(local);
            }
        }

        Ok(addresses)
    }
}

/// Probe returning a fixed set of addresses.
pub struct StaticProbe(pub BTreeSet<IpAddr>);

#[async_trait]
impl InterfaceProbe for StaticProbe {
    async fn local_addresses(&self) -> io::Result<BTreeSet<IpAddr>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn positive_loopback_route() {
        let probe = RouteProbe::new(vec![Ipv4Addr::LOCALHOST.into()]);
        let addresses = probe.local_addresses().await.unwrap();

        assert!(addresses.contains(&IpAddr::from(Ipv4Addr::LOCALHOST)));
    }
}
