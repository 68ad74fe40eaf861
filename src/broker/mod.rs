//! Broker transport.
//!
//! The rest of the crate talks to the broker only through [`Connector`] and
//! [`BrokerChannel`]. [`amqp`] speaks AMQP 0-9-1 through `lapin`; `memory`
//! (behind the `test-util` feature) keeps queues in-process and is what the
//! test suite runs against.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::error::BrokerError;

pub mod amqp;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub use amqp::AmqpConnector;
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryBroker;

/// Connection lifecycle notifications.
///
/// Errors are informational; only `Closed` means the connection is gone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Error(String),
    Closed,
}

/// A freshly opened connection: its channel plus the stream of lifecycle
/// events for that connection.
pub struct Opened {
    pub channel: Arc<dyn BrokerChannel>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a connection and one channel on it.
    async fn connect(&self) -> Result<Opened, BrokerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a durable queue. Safe to repeat with the same name.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Sends a persistent message through the default exchange to `queue`.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Starts consuming `queue` with at most `prefetch` unacknowledged
    /// deliveries outstanding.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, BrokerError>;

    /// Closes the channel and its connection.
    async fn close(&self) -> Result<(), BrokerError>;
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// One message handed to a consumer. Settle it with [`Delivery::ack`] or
/// [`Delivery::reject`]; dropping it unsettled leaves it with the broker,
/// which redelivers once the channel goes away.
pub struct Delivery {
    pub payload: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            payload,
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
