//! In-process broker with the semantics the relay depends on: durable FIFO
//! queues, per-channel prefetch, ack / reject with or without requeue, and
//! redelivery of unsettled messages when a connection dies.
//!
//! Queues live as long as the [`MemoryBroker`], so they survive any number of
//! severed connections, which is how a durable queue behaves across client
//! reconnects.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use tokio::sync::{mpsc, Notify};

use super::{Acker, BrokerChannel, Connector, Delivery, DeliveryStream, LinkEvent, Opened};
use crate::error::BrokerError;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    wake: Notify,
}

struct State {
    reachable: bool,
    queues: HashMap<String, VecDeque<Stored>>,
    connections: HashMap<u64, Live>,
    next_connection: u64,
    next_tag: u64,
    connect_attempts: u32,
    rejected: Vec<Vec<u8>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            reachable: true,
            queues: HashMap::new(),
            connections: HashMap::new(),
            next_connection: 0,
            next_tag: 0,
            connect_attempts: 0,
            rejected: Vec::new(),
        }
    }
}

#[derive(Clone)]
struct Stored {
    queue: String,
    payload: Vec<u8>,
    redelivered: bool,
}

struct Live {
    events: mpsc::UnboundedSender<LinkEvent>,
    unacked: HashMap<u64, Stored>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    /// Puts unsettled messages back at the head of their queues, oldest first.
    fn requeue_unacked(&mut self, live: Live) {
        let mut pending: Vec<(u64, Stored)> = live.unacked.into_iter().collect();
        pending.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, mut message) in pending {
            message.redelivered = true;
            self.queues
                .entry(message.queue.clone())
                .or_default()
                .push_front(message);
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// While unreachable every connect attempt fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().reachable = reachable;
    }

    /// Drops every live connection the way a broker restart would: each
    /// client sees an error followed by a close, and unsettled deliveries go
    /// back to their queues.
    pub fn sever_connections(&self) {
        let mut state = self.inner.lock();
        let connections: Vec<Live> = state.connections.drain().map(|(_, live)| live).collect();
        for live in connections {
            let _ = live
                .events
                .send(LinkEvent::Error("connection reset by broker".to_string()));
            let _ = live.events.send(LinkEvent::Closed);
            state.requeue_unacked(live);
        }
        drop(state);
        self.inner.wake.notify_waiters();
    }

    /// Enqueues raw bytes, bypassing any client.
    pub fn inject(&self, queue: &str, payload: &[u8]) {
        self.inner
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(Stored {
                queue: queue.to_string(),
                payload: payload.to_vec(),
                redelivered: false,
            });
        self.inner.wake.notify_waiters();
    }

    /// Ready (not yet delivered) messages in `queue`.
    pub fn ready(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.lock().queues.contains_key(queue)
    }

    pub fn unacked(&self) -> usize {
        self.inner
            .lock()
            .connections
            .values()
            .map(|live| live.unacked.len())
            .sum()
    }

    /// Payloads rejected without requeue, in rejection order.
    pub fn rejected(&self) -> Vec<Vec<u8>> {
        self.inner.lock().rejected.clone()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.inner.lock().connect_attempts
    }

    pub fn live_connections(&self) -> usize {
        self.inner.lock().connections.len()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Opened, BrokerError> {
        let mut state = self.inner.lock();
        state.connect_attempts += 1;
        if !state.reachable {
            return Err(BrokerError::Connect("connection refused".to_string()));
        }

        let id = state.next_connection;
        state.next_connection += 1;
        let (tx, events) = mpsc::unbounded_channel();
        state.connections.insert(
            id,
            Live {
                events: tx,
                unacked: HashMap::new(),
            },
        );

        Ok(Opened {
            channel: Arc::new(MemoryChannel {
                inner: self.inner.clone(),
                connection: id,
            }),
            events,
        })
    }
}

struct MemoryChannel {
    inner: Arc<Inner>,
    connection: u64,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &State) -> Result<(), BrokerError> {
        if state.connections.contains_key(&self.connection) {
            Ok(())
        } else {
            Err(BrokerError::Closed)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.inner.lock();
        self.ensure_open(&state)?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        {
            let mut state = self.inner.lock();
            self.ensure_open(&state)?;
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(Stored {
                    queue: queue.to_string(),
                    payload: payload.to_vec(),
                    redelivered: false,
                });
        }
        self.inner.wake.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open(&self.inner.lock())?;

        let cursor = Cursor {
            inner: self.inner.clone(),
            connection: self.connection,
            queue: queue.to_string(),
            prefetch: usize::from(prefetch.max(1)),
        };
        let deliveries = stream::unfold(cursor, |cursor| async move {
            let delivery = cursor.next().await?;
            Some((Ok(delivery), cursor))
        });
        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        {
            let mut state = self.inner.lock();
            if let Some(live) = state.connections.remove(&self.connection) {
                state.requeue_unacked(live);
            }
        }
        self.inner.wake.notify_waiters();
        Ok(())
    }
}

struct Cursor {
    inner: Arc<Inner>,
    connection: u64,
    queue: String,
    prefetch: usize,
}

impl Cursor {
    /// Waits for the next message this consumer may hold. `None` once the
    /// connection is gone.
    async fn next(&self) -> Option<Delivery> {
        loop {
            let woken = self.inner.wake.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();

            if let Some(outcome) = self.try_take() {
                return outcome;
            }
            woken.await;
        }
    }

    fn try_take(&self) -> Option<Option<Delivery>> {
        let mut state = self.inner.lock();
        let State {
            queues,
            connections,
            next_tag,
            ..
        } = &mut *state;

        let Some(live) = connections.get_mut(&self.connection) else {
            return Some(None);
        };
        if live.unacked.len() >= self.prefetch {
            return None;
        }
        let message = queues.get_mut(&self.queue)?.pop_front()?;

        let tag = *next_tag;
        *next_tag += 1;
        live.unacked.insert(tag, message.clone());

        Some(Some(Delivery::new(
            message.payload,
            message.redelivered,
            Box::new(MemoryAcker {
                inner: self.inner.clone(),
                connection: self.connection,
                tag,
            }),
        )))
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    connection: u64,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), BrokerError> {
        let mut state = self.inner.lock();
        let message = state
            .connections
            .get_mut(&self.connection)
            .ok_or(BrokerError::Closed)?
            .unacked
            .remove(&self.tag)
            .ok_or_else(|| BrokerError::Channel(format!("unknown delivery tag {}", self.tag)))?;

        match requeue {
            None => {}
            Some(true) => {
                let queue = message.queue.clone();
                state.queues.entry(queue).or_default().push_front(Stored {
                    redelivered: true,
                    ..message
                });
            }
            Some(false) => state.rejected.push(message.payload),
        }
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        let result = self.settle(None);
        self.inner.wake.notify_waiters();
        result
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        let result = self.settle(Some(requeue));
        self.inner.wake.notify_waiters();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(broker: &MemoryBroker) -> Opened {
        broker.connect().await.unwrap()
    }

    #[tokio::test]
    async fn prefetch_limits_outstanding_deliveries() {
        let broker = MemoryBroker::new();
        let opened = open(&broker).await;
        opened.channel.declare_queue("q").await.unwrap();
        opened.channel.publish("q", b"one").await.unwrap();
        opened.channel.publish("q", b"two").await.unwrap();

        let mut deliveries = opened.channel.consume("q", 1).await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.payload, b"one");

        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(50), deliveries.next()).await;
        assert!(blocked.is_err(), "second message delivered before ack");

        first.ack().await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.payload, b"two");
    }

    #[tokio::test]
    async fn severing_requeues_unacked_and_emits_close() {
        let broker = MemoryBroker::new();
        let mut opened = open(&broker).await;
        opened.channel.publish("q", b"held").await.unwrap();
        let mut deliveries = opened.channel.consume("q", 1).await.unwrap();
        let held = deliveries.next().await.unwrap().unwrap();

        broker.sever_connections();

        assert!(matches!(opened.events.recv().await, Some(LinkEvent::Error(_))));
        assert_eq!(opened.events.recv().await, Some(LinkEvent::Closed));
        assert!(deliveries.next().await.is_none());
        assert!(matches!(held.ack().await, Err(BrokerError::Closed)));
        assert_eq!(broker.ready("q"), vec![b"held".to_vec()]);

        let again = open(&broker).await;
        let mut deliveries = again.channel.consume("q", 1).await.unwrap();
        let redelivered = deliveries.next().await.unwrap().unwrap();
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn reject_without_requeue_drops_the_message() {
        let broker = MemoryBroker::new();
        let opened = open(&broker).await;
        opened.channel.publish("q", b"bad").await.unwrap();
        let mut deliveries = opened.channel.consume("q", 1).await.unwrap();

        let bad = deliveries.next().await.unwrap().unwrap();
        bad.reject(false).await.unwrap();

        assert!(broker.ready("q").is_empty());
        assert_eq!(broker.rejected(), vec![b"bad".to_vec()]);
        assert_eq!(broker.live_connections(), 1);
    }

    #[tokio::test]
    async fn unreachable_broker_refuses_connections() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);

        assert!(matches!(broker.connect().await, Err(BrokerError::Connect(_))));
        assert_eq!(broker.connect_attempts(), 1);
    }
}
