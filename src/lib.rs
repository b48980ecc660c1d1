mod config;
mod dedicated;
mod handle;
mod registry;
mod token;
pub mod transport;

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{fmt, io};
use thiserror::Error;

pub use config::{
    RegistryConfig, DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_DESTINATION_LEN,
};
pub use dedicated::DedicatedConnection;
pub use handle::ConnectionState;
pub use registry::ConnectionRegistry;
pub use token::ConnectionToken;
pub use transport::{
    loopback::{LoopbackChannel, LoopbackTransport},
    tcp::{TcpChannel, TcpTransport},
    Channel, Transport,
};

/// Errors surfaced by the connection registry and its handles
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("transport unavailable for {destination}: {reason}")]
    TransportUnavailable {
        destination: Destination,
        reason: String,
    },

    #[error("transport error: {0}")]
    TransportError(#[from] io::Error),

    #[error("double release of connection token for {destination}")]
    DoubleRelease { destination: Destination },

    #[error("connection token for {destination} used after release")]
    TokenReleased { destination: Destination },

    #[error("invalid destination: {len} bytes (allowed: 1..={max})")]
    InvalidDestination { len: usize, max: usize },

    #[error("connection registry shutdown")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Logical identity a connection is shared under.
///
/// Equality is exact byte-wise identity: `"10.0.0.1"` and `"010.000.000.001"`
/// are two different destinations.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination(Bytes);

impl Destination {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.escape_ascii())
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Destination(\"{}\")", self.0.escape_ascii())
    }
}

impl From<&str> for Destination {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Destination {
    fn from(value: String) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<&[u8]> for Destination {
    fn from(value: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(value))
    }
}

impl From<Vec<u8>> for Destination {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<Bytes> for Destination {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}

impl From<&Destination> for Destination {
    fn from(value: &Destination) -> Self {
        value.clone()
    }
}

/// Byte counters shared by every handle of one registry
#[derive(Debug, Default)]
pub struct TransferStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TransferStats {
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Acquire)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Acquire)
    }

    pub(crate) fn record_sent(&self, count: usize) {
        self.bytes_sent.fetch_add(count as u64, Ordering::AcqRel);
    }

    pub(crate) fn record_received(&self, count: usize) {
        self.bytes_received.fetch_add(count as u64, Ordering::AcqRel);
    }
}

/// Point-in-time view of a registry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Destinations with at least one outstanding token
    pub live_connections: usize,
    pub outstanding_tokens: usize,
    pub total_opens: u64,
    pub total_closes: u64,
    /// Closes that reported a transport error (the slot was still freed)
    pub failed_closes: u64,
}
