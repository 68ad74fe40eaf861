//! Task records with a best-effort `task.created` relay.
//!
//! The task service persists tasks and publishes an event per creation
//! through a [`publisher::Publisher`]; the notification service runs a
//! [`consumer::ConsumerLoop`] that turns each event into a
//! [`events::NotificationRecord`] and exposes recent ones over HTTP. Both
//! sides reach the broker through a [`link::BrokerLink`].

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod link;
pub mod processor;
pub mod publisher;
pub mod signals;
pub mod status;
pub mod store;
pub mod task_api;

pub use config::RelayConfig;
pub use error::{BrokerError, ConfigError, ProcessError};
pub use events::{NotificationRecord, TaskCreatedEvent, TaskStatus};
pub use link::{BrokerLink, Handle, LinkOptions, ReconnectPolicy};
