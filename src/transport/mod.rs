//! Boundary to the network stack.
//!
//! The registry never touches sockets directly: it opens channels through a
//! [`Transport`] and moves bytes through the resulting [`Channel`].

pub mod loopback;
pub mod tcp;

use async_trait::async_trait;
use std::io;

use crate::Destination;

/// Establishes channels to destinations
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Channel: Channel;

    /// Open a channel to `destination`. Nothing may be held on failure.
    async fn open(&self, destination: &Destination) -> io::Result<Self::Channel>;
}

/// An established channel to one destination.
///
/// Methods take `&self` so that one caller can block in `receive` while
/// another sends on the same channel.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    async fn send(&self, byte: u8) -> io::Result<()>;

    async fn receive(&self) -> io::Result<u8>;

    async fn send_all(&self, bytes: &[u8]) -> io::Result<()> {
        for &byte in bytes {
            self.send(byte).await?;
        }
        Ok(())
    }

    async fn receive_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        for slot in buf.iter_mut() {
            *slot = self.receive().await?;
        }
        Ok(())
    }

    /// Release the underlying resource. Not idempotent: the registry calls
    /// it exactly once per channel.
    async fn close(&self) -> io::Result<()>;
}
