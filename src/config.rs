use std::time::Duration;

/// Default time allowed for the transport to establish a connection
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 10;

/// Default maximum number of distinct destinations held at once
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

/// Default upper bound on a destination's length in bytes
pub const DEFAULT_MAX_DESTINATION_LEN: usize = 255;

/// Configuration for the connection registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Timeout for opening a new connection
    pub connection_timeout: Duration,
    /// Maximum number of destinations in the table, including ones still opening
    pub max_connections: usize,
    /// Maximum destination length in bytes
    pub max_destination_len: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_destination_len: DEFAULT_MAX_DESTINATION_LEN,
        }
    }
}
