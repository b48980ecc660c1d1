use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::{
    handle::{ConnectionHandle, ConnectionState},
    transport::Channel,
    ConnectionError, Destination, Result,
};

/// A caller's share of a registered connection.
///
/// Valid from the `acquire` that issued it until it is passed to `release`.
/// Every I/O method fails with [`ConnectionError::TokenReleased`] afterwards,
/// and releasing it again yields [`ConnectionError::DoubleRelease`].
pub struct ConnectionToken<C: Channel> {
    id: u64,
    registry_id: u64,
    handle: Arc<ConnectionHandle<C>>,
    released: AtomicBool,
}

impl<C: Channel> ConnectionToken<C> {
    pub(crate) fn new(id: u64, registry_id: u64, handle: Arc<ConnectionHandle<C>>) -> Self {
        Self {
            id,
            registry_id,
            handle,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn destination(&self) -> &Destination {
        self.handle.destination()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// State of the underlying connection; `Closed` once the registry tore it down
    pub fn connection_state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Whether both tokens share the same underlying connection
    pub fn same_connection(&self, other: &ConnectionToken<C>) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }

    pub(crate) fn registry_id(&self) -> u64 {
        self.registry_id
    }

    /// Mark consumed; returns `false` if it already was
    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    fn live_handle(&self) -> Result<&ConnectionHandle<C>> {
        if self.is_released() {
            return Err(ConnectionError::TokenReleased {
                destination: self.destination().clone(),
            });
        }
        Ok(&self.handle)
    }

    pub async fn send(&self, byte: u8) -> Result<()> {
        self.live_handle()?.send(byte).await
    }

    pub async fn send_all(&self, bytes: &[u8]) -> Result<()> {
        self.live_handle()?.send_all(bytes).await
    }

    pub async fn receive(&self) -> Result<u8> {
        self.live_handle()?.receive().await
    }

    pub async fn receive_exact(&self, buf: &mut [u8]) -> Result<()> {
        self.live_handle()?.receive_exact(buf).await
    }
}

impl<C: Channel> std::fmt::Debug for ConnectionToken<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionToken")
            .field("id", &self.id)
            .field("destination", self.destination())
            .field("released", &self.is_released())
            .finish()
    }
}

impl<C: Channel> Drop for ConnectionToken<C> {
    fn drop(&mut self) {
        if !self.is_released() {
            warn!(
                destination = %self.destination(),
                token = self.id,
                "connection token dropped without release, reference held until shutdown"
            );
        }
    }
}
