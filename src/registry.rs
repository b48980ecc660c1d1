use std::collections::{hash_map, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::{
    dedicated::DedicatedConnection, handle::ConnectionHandle, token::ConnectionToken,
    transport::Transport, ConnectionError, Destination, RegistryConfig, RegistryStats, Result,
    TransferStats,
};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Table slot for one destination.
///
/// The refcount is the set of outstanding token ids. `pending` counts
/// acquirers between the table lookup and receiving their token; while it
/// is non-zero the slot cannot be removed, and the handle cell may still be
/// empty.
struct Entry<C> {
    handle: Arc<OnceCell<Arc<ConnectionHandle<C>>>>,
    tokens: HashSet<u64>,
    pending: usize,
}

impl<C> Entry<C> {
    fn opening() -> Self {
        Self {
            handle: Arc::new(OnceCell::new()),
            tokens: HashSet::new(),
            pending: 1,
        }
    }

    fn is_live(&self) -> bool {
        !self.tokens.is_empty()
    }

    fn is_idle(&self) -> bool {
        self.tokens.is_empty() && self.pending == 0
    }
}

struct Table<C> {
    entries: HashMap<Destination, Entry<C>>,
    shutdown: bool,
}

/// Table work finished on a task of its own
enum Settle {
    Released(Destination),
    LeftPending(Destination),
    Shutdown,
}

/// State shared between a registry and the cleanup tasks it spawns
struct Shared<T: Transport> {
    id: u64,
    transport: T,
    config: RegistryConfig,
    table: Arc<Mutex<Table<T::Channel>>>,
    stats: Arc<TransferStats>,
    next_token_id: AtomicU64,
    total_opens: AtomicU64,
    total_closes: AtomicU64,
    failed_closes: AtomicU64,
}

impl<T: Transport> Shared<T> {
    /// Run the closing half of a table mutation on a spawned task.
    ///
    /// The task owns the table guard, so cancelling the caller neither
    /// interrupts a close halfway nor unlocks the table before it finishes.
    async fn settle(
        self: Arc<Self>,
        table: OwnedMutexGuard<Table<T::Channel>>,
        settle: Settle,
    ) {
        let task = tokio::spawn(async move {
            let mut table = table;
            match settle {
                Settle::Released(destination) => {
                    self.remove_if_idle(&mut table, &destination).await
                }
                Settle::LeftPending(destination) => {
                    self.leave_pending(&mut table, &destination).await
                }
                Settle::Shutdown => self.close_all(&mut table).await,
            }
        });

        if let Err(err) = task.await {
            warn!(error = %err, "connection teardown task failed");
        }
    }

    /// Remove and close the slot for `destination` if nobody holds or awaits it.
    /// The caller keeps the table locked across the close.
    async fn remove_if_idle(&self, table: &mut Table<T::Channel>, destination: &Destination) {
        if !table.entries.get(destination).is_some_and(Entry::is_idle) {
            return;
        }
        if let Some(entry) = table.entries.remove(destination) {
            if let Some(handle) = entry.handle.get() {
                self.teardown(handle).await;
            }
        }
    }

    /// Give up one pending claim on `destination` without taking a token.
    ///
    /// After shutdown the last pending acquirer closes the slot even if
    /// tokens are still outstanding.
    async fn leave_pending(&self, table: &mut Table<T::Channel>, destination: &Destination) {
        let Some(entry) = table.entries.get_mut(destination) else {
            return;
        };
        entry.pending = entry.pending.saturating_sub(1);
        let pending = entry.pending;

        if !table.shutdown {
            self.remove_if_idle(table, destination).await;
            return;
        }
        if pending > 0 {
            return;
        }
        if let Some(entry) = table.entries.remove(destination) {
            if let Some(handle) = entry.handle.get() {
                self.teardown(handle).await;
            }
        }
    }

    async fn close_all(&self, table: &mut Table<T::Channel>) {
        table.shutdown = true;

        let idle: Vec<Destination> = table
            .entries
            .iter()
            .filter(|(_, entry)| entry.pending == 0)
            .map(|(destination, _)| destination.clone())
            .collect();

        let mut closed = 0usize;
        for destination in idle {
            let Some(entry) = table.entries.remove(&destination) else {
                continue;
            };
            if entry.is_live() {
                warn!(
                    destination = %destination,
                    outstanding = entry.tokens.len(),
                    "closing connection with outstanding tokens"
                );
            }
            if let Some(handle) = entry.handle.get() {
                self.teardown(handle).await;
                closed += 1;
            }
        }

        info!(registry = self.id, closed, "connection registry shut down");
    }

    async fn teardown(&self, handle: &ConnectionHandle<T::Channel>) {
        match handle.close().await {
            Ok(()) => info!(destination = %handle.destination(), "connection closed"),
            Err(err) => {
                self.failed_closes.fetch_add(1, Ordering::AcqRel);
                warn!(
                    destination = %handle.destination(),
                    error = %err,
                    "error closing connection, slot freed anyway"
                );
            }
        }
        self.total_closes.fetch_add(1, Ordering::AcqRel);
    }
}

/// An acquirer's claim on a slot, from the table lookup until its token is
/// issued.
///
/// Dropped while still armed, i.e. the acquire future was cancelled, it
/// hands the claim back on a spawned task, which closes the slot if that
/// was the last interest in it.
struct PendingClaim<T: Transport> {
    shared: Arc<Shared<T>>,
    destination: Destination,
    armed: bool,
}

impl<T: Transport> PendingClaim<T> {
    fn new(shared: Arc<Shared<T>>, destination: Destination) -> Self {
        Self {
            shared,
            destination,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<T: Transport> Drop for PendingClaim<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let shared = self.shared.clone();
        let destination = self.destination.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(destination = %destination, "acquire cancelled, returning its claim");
                runtime.spawn(async move {
                    let mut table = shared.table.clone().lock_owned().await;
                    shared.leave_pending(&mut table, &destination).await;
                });
            }
            Err(_) => warn!(
                destination = %destination,
                "acquire dropped outside a runtime, slot stays pending until shutdown"
            ),
        }
    }
}

/// Shares one connection per destination between any number of callers.
///
/// `acquire` either joins the live connection for a destination or opens a
/// new one; `release` drops the caller's share and closes the connection
/// when the last share goes. Concurrent acquirers of a destination that is
/// still opening wait for that single open instead of starting their own.
///
/// Both are safe to cancel: an abandoned `acquire` gives its claim back,
/// and a close started by `release` runs to completion regardless.
pub struct ConnectionRegistry<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> ConnectionRegistry<T> {
    pub fn new(transport: T, config: RegistryConfig) -> Self {
        let id = NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            registry = id,
            max_connections = config.max_connections,
            "connection registry created"
        );

        Self {
            shared: Arc::new(Shared {
                id,
                transport,
                config,
                table: Arc::new(Mutex::new(Table {
                    entries: HashMap::new(),
                    shutdown: false,
                })),
                stats: Arc::new(TransferStats::default()),
                next_token_id: AtomicU64::new(1),
                total_opens: AtomicU64::new(0),
                total_closes: AtomicU64::new(0),
                failed_closes: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_defaults(transport: T) -> Self {
        Self::new(transport, RegistryConfig::default())
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    /// Byte counters shared by every connection of this registry
    pub fn transfer_stats(&self) -> &TransferStats {
        &self.shared.stats
    }

    fn validate(&self, destination: &Destination) -> Result<()> {
        let max = self.shared.config.max_destination_len;
        if destination.is_empty() || destination.len() > max {
            return Err(ConnectionError::InvalidDestination {
                len: destination.len(),
                max,
            });
        }
        Ok(())
    }

    /// Get a share of the connection to `destination`, opening it if needed
    pub async fn acquire(
        &self,
        destination: impl Into<Destination>,
    ) -> Result<ConnectionToken<T::Channel>> {
        let destination = destination.into();
        self.validate(&destination)?;
        let shared = &self.shared;
        let max_connections = shared.config.max_connections;

        let (cell, mut claim) = {
            let mut table = shared.table.lock().await;
            if table.shutdown {
                return Err(ConnectionError::Shutdown);
            }

            let at_capacity = table.entries.len() >= max_connections;
            let cell = match table.entries.entry(destination.clone()) {
                hash_map::Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    entry.pending += 1;
                    entry.handle.clone()
                }
                hash_map::Entry::Vacant(vacant) => {
                    if at_capacity {
                        warn!(
                            destination = %destination,
                            max_connections,
                            "connection limit reached"
                        );
                        return Err(ConnectionError::TransportUnavailable {
                            reason: format!("connection limit ({max_connections}) reached"),
                            destination,
                        });
                    }
                    vacant.insert(Entry::opening()).handle.clone()
                }
            };
            (cell, PendingClaim::new(shared.clone(), destination.clone()))
        };

        // Opening happens outside the table lock; the cell serialises it per destination
        let opened = cell
            .get_or_try_init(|| async {
                let handle = ConnectionHandle::open(
                    &shared.transport,
                    destination.clone(),
                    shared.config.connection_timeout,
                    shared.stats.clone(),
                )
                .await?;
                shared.total_opens.fetch_add(1, Ordering::AcqRel);
                Ok::<_, ConnectionError>(Arc::new(handle))
            })
            .await
            .cloned();

        let mut table = shared.table.clone().lock_owned().await;
        // From here on this call settles its own claim
        claim.disarm();

        if table.shutdown {
            shared
                .clone()
                .settle(table, Settle::LeftPending(destination))
                .await;
            return Err(ConnectionError::Shutdown);
        }

        let handle = match opened {
            Ok(handle) => handle,
            Err(err) => {
                warn!(destination = %destination, error = %err, "failed to open connection");
                shared
                    .clone()
                    .settle(table, Settle::LeftPending(destination))
                    .await;
                return Err(err);
            }
        };

        let Some(entry) = table.entries.get_mut(&destination) else {
            // Slots with pending acquirers are only removed by the last of them
            return Err(ConnectionError::Shutdown);
        };
        entry.pending -= 1;

        let id = shared.next_token_id.fetch_add(1, Ordering::Relaxed);
        entry.tokens.insert(id);
        debug!(
            destination = %destination,
            token = id,
            refs = entry.tokens.len(),
            "connection acquired"
        );
        Ok(ConnectionToken::new(id, shared.id, handle))
    }

    /// Give back a share obtained from `acquire`.
    ///
    /// Closes the connection when this was the last share. Never fails on
    /// transport conditions; close errors are logged and counted.
    pub async fn release(&self, token: &ConnectionToken<T::Channel>) -> Result<()> {
        let destination = token.destination().clone();
        if token.registry_id() != self.shared.id {
            warn!(
                destination = %destination,
                token = token.id(),
                "release of a token issued by another registry"
            );
            return Err(ConnectionError::DoubleRelease { destination });
        }

        let mut table = self.shared.table.clone().lock_owned().await;
        let issued = table
            .entries
            .get(&destination)
            .is_some_and(|entry| entry.tokens.contains(&token.id()));

        if !issued {
            // Tokens outstanding at shutdown lost their slot but may still be released once
            if table.shutdown && token.mark_released() {
                debug!(destination = %destination, token = token.id(), "released token after shutdown");
                return Ok(());
            }
            warn!(destination = %destination, token = token.id(), "double release");
            return Err(ConnectionError::DoubleRelease { destination });
        }

        let mut idle = false;
        if let Some(entry) = table.entries.get_mut(&destination) {
            entry.tokens.remove(&token.id());
            token.mark_released();
            idle = entry.is_idle();
            debug!(
                destination = %destination,
                token = token.id(),
                refs = entry.tokens.len(),
                "connection released"
            );
        }

        if idle {
            self.shared
                .clone()
                .settle(table, Settle::Released(destination))
                .await;
        }
        Ok(())
    }

    /// Send `bytes` to `destination` through a share held only for this call.
    ///
    /// Joins the live connection if there is one, otherwise opens and closes
    /// one around the send. The share is released even when the send fails.
    pub async fn send_to(&self, destination: impl Into<Destination>, bytes: &[u8]) -> Result<()> {
        let token = self.acquire(destination).await?;
        let sent = token.send_all(bytes).await;
        self.release(&token).await?;
        sent
    }

    /// Fill `buf` from `destination` through a share held only for this call
    pub async fn receive_from(
        &self,
        destination: impl Into<Destination>,
        buf: &mut [u8],
    ) -> Result<()> {
        let token = self.acquire(destination).await?;
        let received = token.receive_exact(buf).await;
        self.release(&token).await?;
        received
    }

    /// Open a connection owned by the caller alone.
    ///
    /// It never enters the table, so no `acquire` can join it and it does
    /// not count toward `max_connections` or the open/close totals. Bytes
    /// moved through it still count in [`transfer_stats`](Self::transfer_stats).
    pub async fn open_dedicated(
        &self,
        destination: impl Into<Destination>,
    ) -> Result<DedicatedConnection<T::Channel>> {
        let destination = destination.into();
        self.validate(&destination)?;
        if self.is_shutdown().await {
            return Err(ConnectionError::Shutdown);
        }

        let handle = ConnectionHandle::open(
            &self.shared.transport,
            destination,
            self.shared.config.connection_timeout,
            self.shared.stats.clone(),
        )
        .await?;
        Ok(DedicatedConnection::new(handle))
    }

    /// Close every connection and refuse further acquires
    pub async fn shutdown(&self) {
        let table = self.shared.table.clone().lock_owned().await;
        if table.shutdown {
            return;
        }
        self.shared.clone().settle(table, Settle::Shutdown).await;
    }

    pub async fn is_shutdown(&self) -> bool {
        self.shared.table.lock().await.shutdown
    }

    /// Whether a live connection to `destination` is registered
    pub async fn contains(&self, destination: impl Into<Destination>) -> bool {
        self.ref_count(destination).await > 0
    }

    /// Outstanding tokens for `destination`
    pub async fn ref_count(&self, destination: impl Into<Destination>) -> usize {
        let destination = destination.into();
        self.shared
            .table
            .lock()
            .await
            .entries
            .get(&destination)
            .map(|entry| entry.tokens.len())
            .unwrap_or(0)
    }

    /// Number of destinations with a live connection
    pub async fn connection_count(&self) -> usize {
        self.shared
            .table
            .lock()
            .await
            .entries
            .values()
            .filter(|entry| entry.is_live())
            .count()
    }

    /// Destinations with a live connection, sorted
    pub async fn destinations(&self) -> Vec<Destination> {
        let mut destinations: Vec<Destination> = self
            .shared
            .table
            .lock()
            .await
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_live())
            .map(|(destination, _)| destination.clone())
            .collect();
        destinations.sort();
        destinations
    }

    pub async fn stats(&self) -> RegistryStats {
        let shared = &self.shared;
        let table = shared.table.lock().await;
        let live = table.entries.values().filter(|entry| entry.is_live());

        RegistryStats {
            bytes_sent: shared.stats.bytes_sent(),
            bytes_received: shared.stats.bytes_received(),
            live_connections: live.clone().count(),
            outstanding_tokens: live.map(|entry| entry.tokens.len()).sum(),
            total_opens: shared.total_opens.load(Ordering::Acquire),
            total_closes: shared.total_closes.load(Ordering::Acquire),
            failed_closes: shared.failed_closes.load(Ordering::Acquire),
        }
    }

    /// Slots in the table, including ones still opening
    #[cfg(test)]
    async fn slot_count(&self) -> usize {
        self.shared.table.lock().await.entries.len()
    }
}

impl<T: Transport> std::fmt::Debug for ConnectionRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("id", &self.shared.id)
            .field("config", &self.shared.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::{LoopbackChannel, LoopbackTransport};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn loopback_registry() -> ConnectionRegistry<LoopbackTransport> {
        ConnectionRegistry::with_defaults(LoopbackTransport::new())
    }

    #[tokio::test]
    async fn test_acquire_shares_connection() {
        let registry = loopback_registry();

        let first = registry.acquire("X").await.unwrap();
        let second = registry.acquire("X").await.unwrap();

        assert!(first.same_connection(&second));
        assert_ne!(first.id(), second.id());
        assert_eq!(registry.transport().opens_for("X"), 1);
        assert_eq!(registry.ref_count("X").await, 2);
        assert_eq!(registry.connection_count().await, 1);

        registry.release(&first).await.unwrap();
        registry.release(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_destinations_are_isolated() {
        let registry = loopback_registry();

        let x = registry.acquire("X").await.unwrap();
        let y = registry.acquire("Y").await.unwrap();
        assert!(!x.same_connection(&y));
        assert_eq!(registry.destinations().await, vec!["X".into(), "Y".into()]);

        registry.release(&x).await.unwrap();
        assert!(!registry.contains("X").await);
        assert_eq!(registry.transport().closes_for("X"), 1);

        // Y is untouched by X's teardown
        assert!(registry.contains("Y").await);
        assert_eq!(registry.transport().closes_for("Y"), 0);
        y.send(7).await.unwrap();
        assert_eq!(y.receive().await.unwrap(), 7);

        registry.release(&y).await.unwrap();
        assert_eq!(registry.transport().closes_for("Y"), 1);
    }

    #[tokio::test]
    async fn test_refcount_three_acquires() {
        let registry = loopback_registry();

        let tokens = vec![
            registry.acquire("X").await.unwrap(),
            registry.acquire("X").await.unwrap(),
            registry.acquire("X").await.unwrap(),
        ];

        registry.release(&tokens[0]).await.unwrap();
        registry.release(&tokens[1]).await.unwrap();
        assert!(registry.contains("X").await);
        assert_eq!(registry.ref_count("X").await, 1);
        assert_eq!(registry.transport().closes_for("X"), 0);
        tokens[2].send_all(b"ok").await.unwrap();

        registry.release(&tokens[2]).await.unwrap();
        assert!(!registry.contains("X").await);
        assert_eq!(registry.transport().closes_for("X"), 1);
        assert_eq!(registry.stats().await.total_closes, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_double_release_detected() {
        let registry = loopback_registry();

        let kept = registry.acquire("X").await.unwrap();
        let token = registry.acquire("X").await.unwrap();

        registry.release(&token).await.unwrap();
        let err = registry.release(&token).await.unwrap_err();
        assert!(matches!(err, ConnectionError::DoubleRelease { .. }));
        assert!(logs_contain("double release"));

        // The count did not drop a second time
        assert_eq!(registry.ref_count("X").await, 1);
        assert_eq!(registry.transport().closes_for("X"), 0);

        registry.release(&kept).await.unwrap();
        let err = registry.release(&kept).await.unwrap_err();
        assert!(matches!(err, ConnectionError::DoubleRelease { .. }));
        assert_eq!(registry.transport().closes_for("X"), 1);
    }

    #[tokio::test]
    async fn test_release_token_from_other_registry() {
        let registry = loopback_registry();
        let other = loopback_registry();

        let foreign = other.acquire("X").await.unwrap();
        let local = registry.acquire("X").await.unwrap();

        let err = registry.release(&foreign).await.unwrap_err();
        assert!(matches!(err, ConnectionError::DoubleRelease { .. }));
        assert_eq!(registry.ref_count("X").await, 1);
        assert!(!foreign.is_released());

        other.release(&foreign).await.unwrap();
        registry.release(&local).await.unwrap();
    }

    #[tokio::test]
    async fn test_token_unusable_after_release() {
        let registry = loopback_registry();

        let token = registry.acquire("X").await.unwrap();
        registry.release(&token).await.unwrap();
        assert!(token.is_released());

        let err = token.send(1).await.unwrap_err();
        assert!(matches!(err, ConnectionError::TokenReleased { .. }));
        let err = token.receive().await.unwrap_err();
        assert!(matches!(err, ConnectionError::TokenReleased { .. }));
        assert_eq!(registry.transfer_stats().bytes_sent(), 0);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_table_unchanged() {
        let registry = loopback_registry();
        registry.transport().refuse("down");

        let err = registry.acquire("down").await.unwrap_err();
        assert!(matches!(err, ConnectionError::TransportUnavailable { .. }));
        assert!(!registry.contains("down").await);
        assert_eq!(registry.slot_count().await, 0);

        // A later attempt opens normally once the transport recovers
        registry.transport().allow("down");
        let token = registry.acquire("down").await.unwrap();
        assert_eq!(registry.transport().opens_for("down"), 1);
        registry.release(&token).await.unwrap();
    }

    #[tokio::test]
    async fn test_reacquire_after_teardown_opens_fresh_connection() {
        let registry = loopback_registry();

        let first = registry.acquire("X").await.unwrap();
        registry.release(&first).await.unwrap();
        let second = registry.acquire("X").await.unwrap();

        assert!(!first.same_connection(&second));
        assert_eq!(registry.transport().opens_for("X"), 2);
        assert_eq!(registry.transport().closes_for("X"), 1);
        registry.release(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_destination() {
        let registry = ConnectionRegistry::new(
            LoopbackTransport::new(),
            RegistryConfig {
                max_destination_len: 4,
                ..Default::default()
            },
        );

        let err = registry.acquire("").await.unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidDestination { len: 0, max: 4 }));

        let err = registry.acquire("too long").await.unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidDestination { len: 8, max: 4 }));
        assert_eq!(registry.transport().opened(), 0);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let registry = ConnectionRegistry::new(
            LoopbackTransport::new(),
            RegistryConfig {
                max_connections: 1,
                ..Default::default()
            },
        );

        let x = registry.acquire("X").await.unwrap();
        let err = registry.acquire("Y").await.unwrap_err();
        assert!(matches!(err, ConnectionError::TransportUnavailable { .. }));

        // Sharing an existing destination is not limited
        let x2 = registry.acquire("X").await.unwrap();

        registry.release(&x).await.unwrap();
        registry.release(&x2).await.unwrap();
        let y = registry.acquire("Y").await.unwrap();
        registry.release(&y).await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_close_failure_still_frees_slot() {
        let registry = loopback_registry();
        registry.transport().fail_close("flaky");

        let token = registry.acquire("flaky").await.unwrap();
        registry.release(&token).await.unwrap();

        assert!(!registry.contains("flaky").await);
        let stats = registry.stats().await;
        assert_eq!(stats.total_closes, 1);
        assert_eq!(stats.failed_closes, 1);
        assert!(logs_contain("error closing connection"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_converges() {
        let registry = Arc::new(ConnectionRegistry::with_defaults(
            LoopbackTransport::new().with_open_delay(Duration::from_millis(50)),
        ));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.acquire("X").await })
            })
            .collect();

        let mut tokens: Vec<ConnectionToken<LoopbackChannel>> = Vec::new();
        for task in tasks {
            tokens.push(task.await.unwrap().unwrap());
        }

        assert_eq!(registry.transport().opens_for("X"), 1);
        assert_eq!(registry.ref_count("X").await, 16);
        assert!(tokens.iter().all(|token| token.same_connection(&tokens[0])));

        for token in &tokens {
            registry.release(token).await.unwrap();
        }
        assert_eq!(registry.transport().closes_for("X"), 1);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_churn_leaves_no_leak() {
        let registry = Arc::new(loopback_registry());
        let destinations = ["a", "b", "c"];

        let tasks: Vec<_> = (0..24)
            .map(|i| {
                let registry = registry.clone();
                let destination = destinations[i % destinations.len()];
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let token = registry.acquire(destination).await.unwrap();
                        token.send(1).await.unwrap();
                        tokio::task::yield_now().await;
                        registry.release(&token).await.unwrap();
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        let transport = registry.transport();
        assert_eq!(registry.slot_count().await, 0);
        assert_eq!(transport.opened(), transport.closed());
        for destination in destinations {
            assert_eq!(transport.opens_for(destination), transport.closes_for(destination));
        }

        let stats = registry.stats().await;
        assert_eq!(stats.bytes_sent, 24 * 50);
        assert_eq!(stats.total_opens, stats.total_closes);
        assert_eq!(stats.outstanding_tokens, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let registry = loopback_registry();

        let x = registry.acquire("X").await.unwrap();
        let y = registry.acquire("Y").await.unwrap();

        registry.shutdown().await;
        assert!(registry.is_shutdown().await);
        assert_eq!(registry.transport().closed(), 2);
        assert_eq!(registry.connection_count().await, 0);

        let err = registry.acquire("X").await.unwrap_err();
        assert!(matches!(err, ConnectionError::Shutdown));

        // Orphaned tokens can no longer move bytes
        assert_eq!(x.connection_state(), crate::ConnectionState::Closed);
        let err = x.send(1).await.unwrap_err();
        assert!(matches!(err, ConnectionError::TransportError(_)));

        // ...but each may still be released exactly once
        registry.release(&x).await.unwrap();
        let err = registry.release(&x).await.unwrap_err();
        assert!(matches!(err, ConnectionError::DoubleRelease { .. }));
        registry.release(&y).await.unwrap();

        // Shutdown is idempotent and never closes twice
        registry.shutdown().await;
        assert_eq!(registry.transport().closed(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_during_open() {
        let registry = Arc::new(ConnectionRegistry::with_defaults(
            LoopbackTransport::new().with_open_delay(Duration::from_millis(100)),
        ));

        let pending = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire("X").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.shutdown().await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectionError::Shutdown));
        assert_eq!(registry.slot_count().await, 0);
        assert_eq!(
            registry.transport().opens_for("X"),
            registry.transport().closes_for("X")
        );
    }

    #[tokio::test]
    async fn test_cancelled_acquire_gives_claim_back() {
        let registry = ConnectionRegistry::with_defaults(
            LoopbackTransport::new().with_open_delay(Duration::from_millis(200)),
        );

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), registry.acquire("X")).await;
        assert!(cancelled.is_err());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.slot_count().await, 0);

        // A later balanced pair still closes what it opens
        let token = registry.acquire("X").await.unwrap();
        registry.release(&token).await.unwrap();

        let transport = registry.transport();
        assert_eq!(transport.opens_for("X"), 1);
        assert_eq!(transport.opens_for("X"), transport.closes_for("X"));
        assert_eq!(registry.slot_count().await, 0);
        let stats = registry.stats().await;
        assert_eq!(stats.total_opens, stats.total_closes);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_pin_connection() {
        let registry = Arc::new(ConnectionRegistry::with_defaults(
            LoopbackTransport::new().with_open_delay(Duration::from_millis(100)),
        ));

        let leader = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire("X").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Joins the in-flight open, then gives up before it finishes
        let waiter = tokio::time::timeout(Duration::from_millis(30), registry.acquire("X")).await;
        assert!(waiter.is_err());

        let token = leader.await.unwrap().unwrap();
        assert_eq!(registry.ref_count("X").await, 1);
        registry.release(&token).await.unwrap();

        assert_eq!(registry.transport().closes_for("X"), 1);
        assert_eq!(registry.slot_count().await, 0);
    }

    #[tokio::test]
    async fn test_acquire_aborted_after_open_closes_connection() {
        let registry = Arc::new(ConnectionRegistry::with_defaults(
            LoopbackTransport::new().with_open_delay(Duration::from_millis(30)),
        ));

        let task = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire("X").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Holding the table keeps the acquirer parked after its open completes
        let held = registry.shared.table.lock().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(registry.transport().opens_for("X"), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        drop(held);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(registry.transport().closes_for("X"), 1);
        assert_eq!(registry.slot_count().await, 0);
        assert_eq!(registry.stats().await.total_closes, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquirers_of_refused_destination_all_fail() {
        let registry = Arc::new(ConnectionRegistry::with_defaults(
            LoopbackTransport::new().with_open_delay(Duration::from_millis(30)),
        ));
        registry.transport().refuse("down");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.acquire("down").await })
            })
            .collect();

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, ConnectionError::TransportUnavailable { .. }));
        }

        assert_eq!(registry.transport().opens_for("down"), 0);
        assert_eq!(registry.transport().closes_for("down"), 0);
        assert_eq!(registry.slot_count().await, 0);
        assert_eq!(registry.stats().await.total_opens, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiter_retries_after_failed_open() {
        let registry = Arc::new(ConnectionRegistry::with_defaults(
            LoopbackTransport::new().with_open_delay(Duration::from_millis(30)),
        ));
        registry.transport().refuse_times("X", 1);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.acquire("X").await })
            })
            .collect();

        let mut tokens = Vec::new();
        let mut failures = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(token) => tokens.push(token),
                Err(ConnectionError::TransportUnavailable { .. }) => failures += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        // Only the refused attempt fails; everyone else lands on one connection
        assert_eq!(failures, 1);
        assert_eq!(tokens.len(), 7);
        assert!(tokens.iter().all(|token| token.same_connection(&tokens[0])));
        assert_eq!(registry.transport().opens_for("X"), 1);

        for token in &tokens {
            registry.release(token).await.unwrap();
        }
        assert_eq!(registry.transport().closes_for("X"), 1);
        assert_eq!(registry.slot_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_release_finishes_close() {
        let registry = Arc::new(ConnectionRegistry::with_defaults(
            LoopbackTransport::new().with_close_delay(Duration::from_millis(100)),
        ));

        let token = registry.acquire("X").await.unwrap();
        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), registry.release(&token)).await;
        assert!(cancelled.is_err());
        assert!(token.is_released());

        // The next acquirer waits for the close instead of seeing a half torn-down slot
        let next = registry.acquire("X").await.unwrap();
        assert_eq!(token.connection_state(), crate::ConnectionState::Closed);
        assert!(!next.same_connection(&token));
        assert_eq!(registry.transport().closes_for("X"), 1);
        assert_eq!(registry.transport().opens_for("X"), 2);

        let stats = registry.stats().await;
        assert_eq!(stats.total_closes, 1);
        assert_eq!(stats.live_connections, 1);

        registry.release(&next).await.unwrap();
        assert_eq!(registry.transport().closes_for("X"), 2);
    }

    #[tokio::test]
    async fn test_send_to_and_receive_from() {
        let registry = loopback_registry();

        registry.send_to("X", b"one-shot").await.unwrap();
        assert_eq!(registry.transport().opens_for("X"), 1);
        assert_eq!(registry.transport().closes_for("X"), 1);
        assert_eq!(registry.slot_count().await, 0);

        // With a live share the one-shot path rides the same connection
        let held = registry.acquire("X").await.unwrap();
        registry.send_to("X", b"ab").await.unwrap();
        let mut buf = [0u8; 2];
        registry.receive_from("X", &mut buf).await.unwrap();
        assert_eq!(&buf, b"ab");
        assert_eq!(registry.transport().opens_for("X"), 2);
        assert_eq!(registry.ref_count("X").await, 1);
        registry.release(&held).await.unwrap();

        let stats = registry.stats().await;
        assert_eq!(stats.bytes_sent, 10);
        assert_eq!(stats.bytes_received, 2);
        assert_eq!(stats.total_opens, stats.total_closes);
    }

    #[tokio::test]
    async fn test_send_to_refused_destination() {
        let registry = loopback_registry();
        registry.transport().refuse("down");

        let err = registry.send_to("down", b"x").await.unwrap_err();
        assert!(matches!(err, ConnectionError::TransportUnavailable { .. }));
        assert_eq!(registry.transfer_stats().bytes_sent(), 0);
        assert_eq!(registry.slot_count().await, 0);
    }

    #[tokio::test]
    async fn test_dedicated_connection_is_not_shared() {
        let registry = loopback_registry();

        let shared = registry.acquire("192.168.0.1").await.unwrap();
        let dedicated = registry.open_dedicated("192.168.0.1").await.unwrap();
        assert_eq!(registry.transport().opens_for("192.168.0.1"), 2);
        assert_eq!(registry.ref_count("192.168.0.1").await, 1);

        dedicated.send_all(b"Hello World!").await.unwrap();
        assert_eq!(registry.transfer_stats().bytes_sent(), 12);
        dedicated.close().await.unwrap();

        // Closing it leaves the shared connection alone
        assert_eq!(registry.transport().closes_for("192.168.0.1"), 1);
        assert!(registry.contains("192.168.0.1").await);
        shared.send(1).await.unwrap();
        registry.release(&shared).await.unwrap();

        let stats = registry.stats().await;
        assert_eq!(stats.total_opens, 1);
        assert_eq!(stats.total_closes, 1);
    }

    #[tokio::test]
    async fn test_dedicated_connection_checks_destination_and_shutdown() {
        let registry = loopback_registry();

        let err = registry.open_dedicated("").await.unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidDestination { .. }));

        registry.shutdown().await;
        let err = registry.open_dedicated("X").await.unwrap_err();
        assert!(matches!(err, ConnectionError::Shutdown));
        assert_eq!(registry.transport().opened(), 0);
    }
}
