//! Helpers to simplify work with the multicast UdpSocket.

use crate::{config::IpVersion, message::Announcement};
use async_trait::async_trait;
use std::{io, net::SocketAddr};
use tokio::net::UdpSocket;

/// Datagram socket the discovery layer sends and receives announcements on.
#[async_trait]
pub trait SocketTrait {
    async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<()>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

pub struct Socket(Box<dyn SocketTrait + Send + Sync + 'static>, SocketAddr);

impl Socket {
    pub fn new<S: SocketTrait + Send + Sync + 'static>(inner: S) -> io::Result<Self> {
        let inner = Box::new(inner);
        let local_addr = inner.local_addr()?;
        Ok(Self(inner, local_addr))
    }

    pub(crate) async fn send(&self, announcement: &Announcement, addr: SocketAddr) -> io::Result<()> {
        log::trace!("{}: Sending to {addr:?} {announcement:?}", self.ip_version());
        // A partially sent datagram is useless, the next announcement will do better.
        self.0.send_to(&announcement.encode(), &addr).await
    }

    /// Receive the next datagram, undecoded. Cancel safe.
    pub(crate) async fn recv(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.0.recv_from(buffer).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.1
    }

    pub fn ip_version(&self) -> IpVersion {
        IpVersion::of(&self.1)
    }
}

#[async_trait]
impl SocketTrait for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<()> {
        UdpSocket::send_to(self, buf, target).await.map(|_| ())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}
