use async_trait::async_trait;
use std::{io, net::SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Channel, Transport};
use crate::Destination;

/// TCP transport. Destinations are UTF-8 `host:port` strings.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    nodelay: bool,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    /// Toggle `TCP_NODELAY` on opened sockets (enabled by default)
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Channel = TcpChannel;

    async fn open(&self, destination: &Destination) -> io::Result<TcpChannel> {
        let addr = std::str::from_utf8(destination.as_bytes())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(self.nodelay)?;
        let peer_addr = stream.peer_addr()?;
        debug!(destination = %destination, peer = %peer_addr, "tcp stream connected");

        let (reader, writer) = stream.into_split();
        Ok(TcpChannel {
            peer_addr,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }
}

/// Split TCP stream; each direction is locked independently
#[derive(Debug)]
pub struct TcpChannel {
    peer_addr: SocketAddr,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpChannel {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current `TCP_NODELAY` setting of the socket
    pub async fn nodelay(&self) -> io::Result<bool> {
        let writer = self.writer.lock().await;
        let stream: &TcpStream = writer.as_ref();
        stream.nodelay()
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send(&self, byte: u8) -> io::Result<()> {
        self.writer.lock().await.write_u8(byte).await
    }

    async fn receive(&self) -> io::Result<u8> {
        self.reader.lock().await.read_u8().await
    }

    async fn send_all(&self, bytes: &[u8]) -> io::Result<()> {
        self.writer.lock().await.write_all(bytes).await
    }

    async fn receive_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        self.reader.lock().await.read_exact(buf).await?;
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}
