//! Request/response exchange over TCP.
//!
//! Every message travels in a frame made of a big endian `u32` body length followed by the body.
//! Connections are pooled per remote endpoint and reused across requests.

use crate::message::{DecodeError, Message, MAX_FRAME_LEN};
use async_trait::async_trait;
use std::{collections::HashMap, io, net::SocketAddr, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
    time,
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error")]
    Io(#[from] io::Error),
    #[error("timed out")]
    Timeout,
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("invalid message")]
    Decode(#[from] DecodeError),
    #[error("connection closed")]
    Closed,
}

/// Sends a request to a remote endpoint and waits for the response carrying the same correlation
/// id.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(
        &self,
        addr: SocketAddr,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError>;
}

/// `Transport` over TCP with one pooled connection per remote endpoint.
#[derive(Default)]
pub struct TcpTransport {
    sessions: Mutex<HashMap<SocketAddr, TcpStream>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, TransportError> {
        let stream = time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request(
        &self,
        addr: SocketAddr,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let pooled = self.sessions.lock().await.remove(&addr);

        if let Some(mut stream) = pooled {
            match exchange(&mut stream, &message, timeout).await {
                Ok(response) => {
                    self.sessions.lock().await.insert(addr, stream);
                    return Ok(response);
                }
                // The remote end may have dropped an idle connection. Redial once.
                Err(TransportError::Io(_)) | Err(TransportError::Closed) => {
                    log::trace!("Pooled connection to {addr} is broken, reconnecting");
                }
                Err(error) => return Err(error),
            }
        }

        let mut stream = Self::connect(addr, timeout).await?;
        let response = exchange(&mut stream, &message, timeout).await?;
        self.sessions.lock().await.insert(addr, stream);

        Ok(response)
    }
}

async fn exchange<S>(
    stream: &mut S,
    request: &Message,
    timeout: Duration,
) -> Result<Message, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let correlation_id = request.correlation_id;

    let exchange = async {
        write_frame(stream, &request.encode()).await?;

        loop {
            let response = Message::decode(&read_frame(stream).await?)?;

            if response.correlation_id == correlation_id {
                return Ok(response);
            }

            log::debug!(
                "Dropping response with unknown correlation id {} (expected {})",
                response.correlation_id,
                correlation_id
            );
        }
    };

    time::timeout(timeout, exchange)
        .await
        .map_err(|_| TransportError::Timeout)?
}

pub(crate) async fn write_frame<S>(io: &mut S, body: &[u8]) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(body.len()));
    }

    io.write_u32(body.len() as u32).await?;
    io.write_all(body).await?;
    io.flush().await?;

    Ok(())
}

pub(crate) async fn read_frame<S>(io: &mut S) -> Result<Vec<u8>, TransportError>
where
    S: AsyncRead + Unpin,
{
    let len = match io.read_u32().await {
        Ok(len) => len as usize,
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed)
        }
        Err(error) => return Err(error.into()),
    };

    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await?;

    Ok(body)
}
