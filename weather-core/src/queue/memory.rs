//! In-process broker with fanout exchanges and durable queues.
//!
//! Mirrors the parts of AMQP the consumer relies on: prefetch accounting,
//! explicit settlement, redelivery of unsettled messages after a connection
//! loss, and unsolicited closure via [`MemoryBroker::sever`].

use async_trait::async_trait;
use futures::{StreamExt, channel::mpsc};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use super::{
    Acker, CloseCallback, ConnectionError, ConnectionHooks, ConnectionState, Delivery,
    DeliveryStream, Disposition, QueueConnection, QueueSession,
};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(Vec<u8>, bool)>,
    unacked: HashMap<u64, Vec<u8>>,
    consumer: Option<Consumer>,
}

struct Consumer {
    epoch: u64,
    prefetch: u16,
    tx: mpsc::UnboundedSender<Result<Delivery, ConnectionError>>,
}

#[derive(Default)]
struct BrokerState {
    epoch: u64,
    connected: bool,
    exchanges: HashSet<String>,
    bindings: HashMap<String, Vec<String>>,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    subscriptions: usize,
    fail_connects: usize,
    settled: Vec<(Vec<u8>, Disposition)>,
    last_prefetch: Option<u16>,
}

/// Cheap to clone; clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    hooks: ConnectionHooks,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish to `exchange` from outside any session.
    pub fn publish(&self, exchange: &str, body: &[u8]) {
        let mut state = self.lock();
        route(&mut state, self, exchange, body);
    }

    /// Drop the connection as if the broker went away. Unsettled messages go
    /// back to their queues flagged as redelivered.
    pub fn sever(&self) {
        let epoch = {
            let mut state = self.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.queues.values_mut().for_each(detach_consumer);
            state.epoch
        };
        self.hooks.closed_by_peer(epoch);
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.lock().fail_connects = count;
    }

    /// Every settlement so far, in order.
    pub fn settled(&self) -> Vec<(Vec<u8>, Disposition)> {
        self.lock().settled.clone()
    }

    /// Messages waiting in `queue`, not yet delivered.
    pub fn ready(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` and not yet settled.
    pub fn unacked(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Number of `consume` calls that succeeded.
    pub fn subscriptions(&self) -> usize {
        self.lock().subscriptions
    }

    pub fn last_prefetch(&self) -> Option<u16> {
        self.lock().last_prefetch
    }

    fn settle(&self, epoch: u64, queue: &str, tag: u64, disposition: Disposition) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        if !state.connected || state.epoch != epoch {
            return Err(ConnectionError::Closed);
        }
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(ConnectionError::Closed);
        };
        let Some(body) = q.unacked.remove(&tag) else {
            return Err(ConnectionError::Operation {
                operation: "settle",
                reason: format!("unknown delivery tag {tag}"),
            });
        };
        if let Disposition::Reject { requeue: true } = disposition {
            q.ready.push_back((body.clone(), true));
        }
        state.settled.push((body, disposition));
        pump(&mut state, self, queue);
        Ok(())
    }
}

/// Drop the queue's consumer and put its unsettled messages back at the head
/// of the queue in delivery order, flagged as redelivered.
fn detach_consumer(queue: &mut QueueState) {
    queue.consumer = None;
    let mut unacked: Vec<_> = queue.unacked.drain().collect();
    unacked.sort_by_key(|(tag, _)| *tag);
    for (_, body) in unacked.into_iter().rev() {
        queue.ready.push_front((body, true));
    }
}

fn route(state: &mut BrokerState, broker: &MemoryBroker, exchange: &str, body: &[u8]) {
    let targets = state.bindings.get(exchange).cloned().unwrap_or_default();
    for queue in targets {
        if let Some(q) = state.queues.get_mut(&queue) {
            q.ready.push_back((body.to_vec(), false));
        }
        pump(state, broker, &queue);
    }
}

/// Hand ready messages to the queue's consumer while its prefetch allows.
fn pump(state: &mut BrokerState, broker: &MemoryBroker, queue: &str) {
    loop {
        let tag = state.next_tag + 1;
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        let Some(consumer) = &q.consumer else {
            return;
        };
        if consumer.prefetch != 0 && q.unacked.len() >= usize::from(consumer.prefetch) {
            return;
        }
        let Some((body, redelivered)) = q.ready.pop_front() else {
            return;
        };

        let acker = MemoryAcker {
            broker: broker.clone(),
            epoch: consumer.epoch,
            queue: queue.to_string(),
            tag,
        };
        let delivery = Delivery::new(body.clone(), redelivered, Box::new(acker));
        if consumer.tx.unbounded_send(Ok(delivery)).is_err() {
            // Consumer stream was dropped; keep the message for the next one.
            q.consumer = None;
            q.ready.push_front((body, redelivered));
            return;
        }
        q.unacked.insert(tag, body);
        state.next_tag = tag;
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    epoch: u64,
    queue: String,
    tag: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn settle(&self, disposition: Disposition) -> Result<(), ConnectionError> {
        self.broker.settle(self.epoch, &self.queue, self.tag, disposition)
    }
}

#[async_trait]
impl QueueConnection for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn QueueSession>, ConnectionError> {
        let epoch = {
            let mut state = self.lock();
            if state.connected {
                state.epoch
            } else {
                self.hooks.connecting();
                if state.fail_connects > 0 {
                    state.fail_connects -= 1;
                    self.hooks.disconnected();
                    return Err(ConnectionError::Connect {
                        endpoint: "memory".to_string(),
                        reason: "connection refused".to_string(),
                    });
                }
                state.connected = true;
                state.epoch = self.hooks.connected();
                state.epoch
            }
        };

        Ok(Box::new(MemorySession {
            broker: self.clone(),
            epoch,
            prefetch: 0,
        }))
    }

    fn on_close(&self, callback: CloseCallback) {
        self.hooks.register(callback);
    }

    fn state(&self) -> ConnectionState {
        self.hooks.state()
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        if !state.connected {
            return Ok(());
        }
        self.hooks.disconnected();
        state.connected = false;
        state.queues.values_mut().for_each(detach_consumer);
        Ok(())
    }
}

struct MemorySession {
    broker: MemoryBroker,
    epoch: u64,
    prefetch: u16,
}

impl MemorySession {
    fn live(&self) -> Result<MutexGuard<'_, BrokerState>, ConnectionError> {
        let state = self.broker.lock();
        if state.connected && state.epoch == self.epoch {
            Ok(state)
        } else {
            Err(ConnectionError::Closed)
        }
    }
}

#[async_trait]
impl QueueSession for MemorySession {
    async fn declare_fanout(&mut self, exchange: &str) -> Result<(), ConnectionError> {
        self.live()?.exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&mut self, queue: &str) -> Result<(), ConnectionError> {
        self.live()?.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn bind(&mut self, queue: &str, exchange: &str) -> Result<(), ConnectionError> {
        let mut state = self.live()?;
        if !state.exchanges.contains(exchange) {
            return Err(ConnectionError::operation("queue_bind")(format!(
                "no exchange '{exchange}'"
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(ConnectionError::operation("queue_bind")(format!("no queue '{queue}'")));
        }
        let bound = state.bindings.entry(exchange.to_string()).or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<(), ConnectionError> {
        self.live()?.last_prefetch = Some(count);
        self.prefetch = count;
        Ok(())
    }

    async fn consume(
        &mut self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, ConnectionError> {
        let broker = self.broker.clone();
        let mut state = self.live()?;
        let (tx, rx) = mpsc::unbounded();

        let Some(q) = state.queues.get_mut(queue) else {
            return Err(ConnectionError::operation("basic_consume")(format!(
                "no queue '{queue}'"
            )));
        };
        q.consumer = Some(Consumer {
            epoch: self.epoch,
            prefetch: self.prefetch,
            tx,
        });
        state.subscriptions += 1;
        pump(&mut state, &broker, queue);

        Ok(rx.boxed())
    }

    async fn publish(&mut self, exchange: &str, body: &[u8]) -> Result<(), ConnectionError> {
        let broker = self.broker.clone();
        let mut state = self.live()?;
        if !state.exchanges.contains(exchange) {
            return Err(ConnectionError::operation("basic_publish")(format!(
                "no exchange '{exchange}'"
            )));
        }
        route(&mut state, &broker, exchange, body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn subscribe(broker: &MemoryBroker, prefetch: u16) -> DeliveryStream {
        let mut session = broker.connect().await.unwrap();
        session.declare_fanout("ex").await.unwrap();
        session.declare_queue("q").await.unwrap();
        session.bind("q", "ex").await.unwrap();
        session.set_prefetch(prefetch).await.unwrap();
        session.consume("q", "test").await.unwrap()
    }

    #[tokio::test]
    async fn prefetch_limits_unsettled_deliveries() {
        let broker = MemoryBroker::new();
        let mut stream = subscribe(&broker, 1).await;

        broker.publish("ex", b"one");
        broker.publish("ex", b"two");
        assert_eq!(broker.unacked("q"), 1);
        assert_eq!(broker.ready("q"), 1);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.body(), b"one");
        first.settle(Disposition::Ack).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.body(), b"two");
        second
            .settle(Disposition::Reject { requeue: false })
            .await
            .unwrap();

        assert_eq!(broker.ready("q"), 0);
        assert_eq!(broker.unacked("q"), 0);
        assert_eq!(
            broker.settled(),
            vec![
                (b"one".to_vec(), Disposition::Ack),
                (b"two".to_vec(), Disposition::Reject { requeue: false }),
            ]
        );
    }

    #[tokio::test]
    async fn requeued_message_comes_back_redelivered() {
        let broker = MemoryBroker::new();
        let mut stream = subscribe(&broker, 1).await;

        broker.publish("ex", b"flaky");
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered());
        first.settle(Disposition::Reject { requeue: true }).await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.body(), b"flaky");
        assert!(again.redelivered());
    }

    #[tokio::test]
    async fn sever_notifies_once_and_requeues_unsettled() {
        let broker = MemoryBroker::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let c = closes.clone();
        broker.on_close(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let mut stream = subscribe(&broker, 1).await;
        broker.publish("ex", b"in-flight");
        let delivery = stream.next().await.unwrap().unwrap();

        broker.sever();
        broker.sever();

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(broker.state(), ConnectionState::Disconnected);
        assert!(stream.next().await.is_none());
        assert!(matches!(
            delivery.settle(Disposition::Ack).await,
            Err(ConnectionError::Closed)
        ));
        assert_eq!(broker.ready("q"), 1);
    }

    #[tokio::test]
    async fn graceful_close_is_idempotent_and_silent() {
        let broker = MemoryBroker::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let c = closes.clone();
        broker.on_close(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let _stream = subscribe(&broker, 1).await;
        broker.close().await.unwrap();
        broker.close().await.unwrap();

        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert_eq!(broker.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn graceful_close_requeues_unsettled_ahead_of_ready() {
        let broker = MemoryBroker::new();
        let _stream = subscribe(&broker, 2).await;
        for body in [&b"one"[..], b"two", b"three"] {
            broker.publish("ex", body);
        }
        assert_eq!(broker.unacked("q"), 2);

        broker.close().await.unwrap();
        assert_eq!(broker.ready("q"), 3);

        let mut stream = subscribe(&broker, 0).await;
        let mut seen = Vec::new();
        for _ in 0..3 {
            let delivery = stream.next().await.unwrap().unwrap();
            seen.push((delivery.body().to_vec(), delivery.redelivered()));
        }
        assert_eq!(
            seen,
            vec![
                (b"one".to_vec(), true),
                (b"two".to_vec(), true),
                (b"three".to_vec(), false),
            ]
        );
    }

    #[tokio::test]
    async fn failed_connect_reports_connection_error() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);

        assert!(matches!(
            broker.connect().await,
            Err(ConnectionError::Connect { .. })
        ));
        assert_eq!(broker.state(), ConnectionState::Disconnected);
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.state(), ConnectionState::Connected);
    }
}
