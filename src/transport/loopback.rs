//! In-process echo transport.
//!
//! Every byte sent on a channel becomes receivable on that same channel.
//! The transport counts opens and closes per destination and can be told to
//! refuse destinations, which makes it the transport of choice for exercising
//! the registry without sockets.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::{Channel, Transport};
use crate::Destination;

#[derive(Debug, Default)]
struct LoopbackState {
    opened: AtomicUsize,
    closed: AtomicUsize,
    opens_by_destination: Mutex<HashMap<Destination, usize>>,
    closes_by_destination: Mutex<HashMap<Destination, usize>>,
    refused: Mutex<HashSet<Destination>>,
    refusals_left: Mutex<HashMap<Destination, usize>>,
    failing_close: Mutex<HashSet<Destination>>,
    open_delay: Mutex<Option<Duration>>,
    close_delay: Mutex<Option<Duration>>,
}

/// Cloneable handle to a shared loopback network
#[derive(Debug, Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<LoopbackState>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every open, widening the window for concurrent acquirers
    pub fn with_open_delay(self, delay: Duration) -> Self {
        *self.state.open_delay.lock() = Some(delay);
        self
    }

    /// Delay every close, so a caller can be cancelled while it is in flight
    pub fn with_close_delay(self, delay: Duration) -> Self {
        *self.state.close_delay.lock() = Some(delay);
        self
    }

    /// Refuse future opens to `destination`
    pub fn refuse(&self, destination: impl Into<Destination>) {
        self.state.refused.lock().insert(destination.into());
    }

    /// Accept opens to a previously refused `destination` again
    pub fn allow(&self, destination: impl Into<Destination>) {
        self.state.refused.lock().remove(&destination.into());
    }

    /// Refuse only the next `count` opens to `destination`
    pub fn refuse_times(&self, destination: impl Into<Destination>, count: usize) {
        self.state
            .refusals_left
            .lock()
            .insert(destination.into(), count);
    }

    /// Make closing channels to `destination` report an error
    pub fn fail_close(&self, destination: impl Into<Destination>) {
        self.state.failing_close.lock().insert(destination.into());
    }

    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::Acquire)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::Acquire)
    }

    pub fn opens_for(&self, destination: impl Into<Destination>) -> usize {
        let destination = destination.into();
        self.state
            .opens_by_destination
            .lock()
            .get(&destination)
            .copied()
            .unwrap_or(0)
    }

    pub fn closes_for(&self, destination: impl Into<Destination>) -> usize {
        let destination = destination.into();
        self.state
            .closes_by_destination
            .lock()
            .get(&destination)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    type Channel = LoopbackChannel;

    async fn open(&self, destination: &Destination) -> io::Result<LoopbackChannel> {
        let delay = *self.state.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let refused_once = match self.state.refusals_left.lock().get_mut(destination) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        };
        if refused_once || self.state.refused.lock().contains(destination) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("loopback refused {destination}"),
            ));
        }

        self.state.opened.fetch_add(1, Ordering::AcqRel);
        *self
            .state
            .opens_by_destination
            .lock()
            .entry(destination.clone())
            .or_insert(0) += 1;

        Ok(LoopbackChannel {
            destination: destination.clone(),
            buffer: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            state: self.state.clone(),
        })
    }
}

/// Echo channel produced by [`LoopbackTransport`]
#[derive(Debug)]
pub struct LoopbackChannel {
    destination: Destination,
    buffer: Mutex<VecDeque<u8>>,
    ready: Notify,
    closed: AtomicBool,
    state: Arc<LoopbackState>,
}

impl LoopbackChannel {
    /// Bytes sent but not yet received
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }
}

#[async_trait]
impl Channel for LoopbackChannel {
    async fn send(&self, byte: u8) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "loopback channel closed",
            ));
        }
        self.buffer.lock().push_back(byte);
        self.ready.notify_one();
        Ok(())
    }

    async fn receive(&self) -> io::Result<u8> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self.buffer.lock().pop_front();
            if let Some(byte) = next {
                return Ok(byte);
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "loopback channel closed",
                ));
            }

            notified.await;
        }
    }

    async fn close(&self) -> io::Result<()> {
        let delay = *self.state.close_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.closed.store(true, Ordering::Release);
        self.ready.notify_waiters();

        self.state.closed.fetch_add(1, Ordering::AcqRel);
        *self
            .state
            .closes_by_destination
            .lock()
            .entry(self.destination.clone())
            .or_insert(0) += 1;

        if self.state.failing_close.lock().contains(&self.destination) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("loopback close failed for {}", self.destination),
            ));
        }
        Ok(())
    }
}
