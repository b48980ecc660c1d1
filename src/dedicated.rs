use tracing::{info, warn};

use crate::{
    handle::{ConnectionHandle, ConnectionState},
    transport::Channel,
    ConnectionError, Destination, Result,
};

/// A connection owned by a single caller.
///
/// Opened with [`ConnectionRegistry::open_dedicated`](crate::ConnectionRegistry::open_dedicated)
/// and never shared: it lives outside the registry table and ends when
/// [`close`](Self::close) consumes it.
pub struct DedicatedConnection<C: Channel> {
    handle: ConnectionHandle<C>,
}

impl<C: Channel> DedicatedConnection<C> {
    pub(crate) fn new(handle: ConnectionHandle<C>) -> Self {
        Self { handle }
    }

    pub fn destination(&self) -> &Destination {
        self.handle.destination()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub async fn send(&self, byte: u8) -> Result<()> {
        self.handle.send(byte).await
    }

    pub async fn send_all(&self, bytes: &[u8]) -> Result<()> {
        self.handle.send_all(bytes).await
    }

    pub async fn receive(&self) -> Result<u8> {
        self.handle.receive().await
    }

    pub async fn receive_exact(&self, buf: &mut [u8]) -> Result<()> {
        self.handle.receive_exact(buf).await
    }

    /// Close the channel. Unlike a registry teardown, a close error is returned.
    pub async fn close(self) -> Result<()> {
        match self.handle.close().await {
            Ok(()) => {
                info!(destination = %self.destination(), "dedicated connection closed");
                Ok(())
            }
            Err(err) => {
                warn!(
                    destination = %self.destination(),
                    error = %err,
                    "error closing dedicated connection"
                );
                Err(ConnectionError::TransportError(err))
            }
        }
    }
}

impl<C: Channel> std::fmt::Debug for DedicatedConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedicatedConnection")
            .field("destination", self.destination())
            .field("state", &self.state())
            .finish()
    }
}

impl<C: Channel> Drop for DedicatedConnection<C> {
    fn drop(&mut self) {
        if self.state() == ConnectionState::Open {
            warn!(
                destination = %self.destination(),
                "dedicated connection dropped without close"
            );
        }
    }
}
