use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::{
    transport::{Channel, Transport},
    ConnectionError, Destination, Result, TransferStats,
};

/// Lifecycle of a connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConnectionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl From<u32> for ConnectionState {
    fn from(value: u32) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// An open channel to one destination.
///
/// Owned by the registry; callers only reach it through a token.
pub(crate) struct ConnectionHandle<C> {
    destination: Destination,
    channel: C,
    state: AtomicU32,
    stats: Arc<TransferStats>,
}

impl<C: Channel> ConnectionHandle<C> {
    /// Establish the underlying channel, bounded by `timeout`
    pub(crate) async fn open<T>(
        transport: &T,
        destination: Destination,
        timeout: Duration,
        stats: Arc<TransferStats>,
    ) -> Result<Self>
    where
        T: Transport<Channel = C>,
    {
        let channel = tokio::time::timeout(timeout, transport.open(&destination))
            .await
            .map_err(|_| ConnectionError::TransportUnavailable {
                destination: destination.clone(),
                reason: format!("timed out after {timeout:?}"),
            })?
            .map_err(|err| ConnectionError::TransportUnavailable {
                destination: destination.clone(),
                reason: err.to_string(),
            })?;

        info!(destination = %destination, "connection opened");
        Ok(Self {
            destination,
            channel,
            state: AtomicU32::new(ConnectionState::Open as u32),
            stats,
        })
    }

    pub(crate) fn destination(&self) -> &Destination {
        &self.destination
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.load(Ordering::Acquire).into()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == ConnectionState::Open {
            Ok(())
        } else {
            Err(ConnectionError::TransportError(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("connection to {} is closed", self.destination),
            )))
        }
    }

    pub(crate) async fn send(&self, byte: u8) -> Result<()> {
        self.ensure_open()?;
        self.channel.send(byte).await?;
        self.stats.record_sent(1);
        Ok(())
    }

    pub(crate) async fn send_all(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.channel.send_all(bytes).await?;
        self.stats.record_sent(bytes.len());
        Ok(())
    }

    pub(crate) async fn receive(&self) -> Result<u8> {
        self.ensure_open()?;
        let byte = self.channel.receive().await?;
        self.stats.record_received(1);
        Ok(byte)
    }

    pub(crate) async fn receive_exact(&self, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        self.channel.receive_exact(buf).await?;
        self.stats.record_received(buf.len());
        Ok(())
    }

    /// Tear down the channel. Only the first call reaches the transport.
    pub(crate) async fn close(&self) -> io::Result<()> {
        if self
            .state
            .compare_exchange(
                ConnectionState::Open as u32,
                ConnectionState::Closing as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(destination = %self.destination, "close on a handle already torn down");
            return Ok(());
        }

        let result = self.channel.close().await;
        self.state
            .store(ConnectionState::Closed as u32, Ordering::Release);
        result
    }
}

impl<C> std::fmt::Debug for ConnectionHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("destination", &self.destination)
            .field("state", &ConnectionState::from(self.state.load(Ordering::Relaxed)))
            .finish()
    }
}
