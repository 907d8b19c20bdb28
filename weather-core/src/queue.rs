//! Broker connection management.
//!
//! A [`QueueConnection`] owns one logical connection to the broker and hands
//! out [`QueueSession`]s (channels) on top of it. Unsolicited closure of the
//! connection is reported to every observer registered with
//! [`QueueConnection::on_close`], exactly once per closure; recovery is left to
//! the caller.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};
use thiserror::Error;
use tracing::debug;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpConnection;
pub use memory::MemoryBroker;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to broker at {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("broker operation `{operation}` failed: {reason}")]
    Operation {
        operation: &'static str,
        reason: String,
    },

    #[error("broker connection is closed")]
    Closed,
}

impl ConnectionError {
    pub(crate) fn operation(operation: &'static str) -> impl Fn(String) -> ConnectionError {
        move |reason| ConnectionError::Operation { operation, reason }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        })
    }
}

/// Observer invoked when the broker closes the connection unasked.
pub type CloseCallback = Box<dyn Fn() + Send + Sync>;

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject { requeue: bool },
}

/// Settles one delivery on the channel it arrived on.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn settle(&self, disposition: Disposition) -> Result<(), ConnectionError>;
}

/// A message handed out by the broker, waiting to be acked or rejected.
pub struct Delivery {
    body: Vec<u8>,
    redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            body,
            redelivered,
            acker,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the broker delivered this message before without a settlement.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Ack or reject. Consumes the delivery so it is settled at most once.
    pub async fn settle(self, disposition: Disposition) -> Result<(), ConnectionError> {
        self.acker.settle(disposition).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, ConnectionError>>;

/// One channel on the broker connection.
#[async_trait]
pub trait QueueSession: Send {
    /// Declare a durable fanout exchange, or assert it exists.
    async fn declare_fanout(&mut self, exchange: &str) -> Result<(), ConnectionError>;

    /// Declare a durable, non-exclusive queue, or assert it exists.
    async fn declare_queue(&mut self, queue: &str) -> Result<(), ConnectionError>;

    async fn bind(&mut self, queue: &str, exchange: &str) -> Result<(), ConnectionError>;

    /// Limit the number of unsettled deliveries held by this session.
    async fn set_prefetch(&mut self, count: u16) -> Result<(), ConnectionError>;

    /// Start consuming with explicit acknowledgement.
    async fn consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ConnectionError>;

    /// Publish a persistent message to a fanout exchange.
    async fn publish(&mut self, exchange: &str, body: &[u8]) -> Result<(), ConnectionError>;
}

#[async_trait]
pub trait QueueConnection: Send + Sync {
    /// Open a session, establishing the connection first if needed.
    async fn connect(&self) -> Result<Box<dyn QueueSession>, ConnectionError>;

    /// Register an observer for unsolicited closure.
    fn on_close(&self, callback: CloseCallback);

    fn state(&self) -> ConnectionState;

    /// Graceful shutdown. Closing an already closed connection is a no-op.
    async fn close(&self) -> Result<(), ConnectionError>;
}

#[derive(Default)]
struct HookState {
    state: Option<ConnectionState>,
    epoch: u64,
    callbacks: Vec<Arc<dyn Fn() + Send + Sync>>,
}

/// Connection state and close observers shared between a connection and the
/// listener it installs on its transport.
///
/// Every successful connect starts a new epoch; a closure report for an older
/// epoch, or for a connection that is no longer up, is dropped. That keeps
/// observers at one call per closure even when the transport reports the same
/// failure several times.
#[derive(Clone, Default)]
pub(crate) struct ConnectionHooks {
    inner: Arc<Mutex<HookState>>,
}

impl ConnectionHooks {
    fn lock(&self) -> MutexGuard<'_, HookState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state.unwrap_or(ConnectionState::Disconnected)
    }

    pub(crate) fn register(&self, callback: CloseCallback) {
        self.lock().callbacks.push(Arc::from(callback));
    }

    pub(crate) fn connecting(&self) {
        self.lock().state = Some(ConnectionState::Connecting);
    }

    /// Mark the connection up and return the epoch it belongs to.
    pub(crate) fn connected(&self) -> u64 {
        let mut hooks = self.lock();
        hooks.state = Some(ConnectionState::Connected);
        hooks.epoch += 1;
        hooks.epoch
    }

    /// Connect attempt failed, or we are closing on purpose. Observers are not told.
    pub(crate) fn disconnected(&self) {
        self.lock().state = Some(ConnectionState::Disconnected);
    }

    /// The transport of `epoch` went away on its own. Returns whether observers ran.
    pub(crate) fn closed_by_peer(&self, epoch: u64) -> bool {
        let callbacks = {
            let mut hooks = self.lock();
            if hooks.epoch != epoch || hooks.state != Some(ConnectionState::Connected) {
                return false;
            }
            hooks.state = Some(ConnectionState::Disconnected);
            hooks.callbacks.clone()
        };

        debug!(epoch, observers = callbacks.len(), "Notifying close observers");
        for callback in callbacks {
            callback();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(hooks: &ConnectionHooks) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        hooks.register(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        calls
    }

    #[test]
    fn state_cycle() {
        let hooks = ConnectionHooks::default();
        assert_eq!(hooks.state(), ConnectionState::Disconnected);

        hooks.connecting();
        assert_eq!(hooks.state(), ConnectionState::Connecting);

        let epoch = hooks.connected();
        assert_eq!(hooks.state(), ConnectionState::Connected);

        assert!(hooks.closed_by_peer(epoch));
        assert_eq!(hooks.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn observers_run_once_per_closure() {
        let hooks = ConnectionHooks::default();
        let first = counting(&hooks);
        let second = counting(&hooks);

        let epoch = hooks.connected();
        assert!(hooks.closed_by_peer(epoch));
        assert!(!hooks.closed_by_peer(epoch));

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        let epoch = hooks.connected();
        hooks.closed_by_peer(epoch);
        assert_eq!(first.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stale_epoch_is_ignored() {
        let hooks = ConnectionHooks::default();
        let calls = counting(&hooks);

        let old = hooks.connected();
        let _current = hooks.connected();

        assert!(!hooks.closed_by_peer(old));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(hooks.state(), ConnectionState::Connected);
    }

    #[test]
    fn graceful_close_does_not_notify() {
        let hooks = ConnectionHooks::default();
        let calls = counting(&hooks);

        let epoch = hooks.connected();
        hooks.disconnected();

        assert!(!hooks.closed_by_peer(epoch));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
