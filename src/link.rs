//! Broker link: owns the one connection handle a process has, and the retry
//! loops that (re)create it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::broker::{BrokerChannel, Connector, LinkEvent};
use crate::error::BrokerError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Give up after this many attempts and run without a broker.
    Bounded { attempts: u32 },
    /// Keep trying until shut down.
    Forever,
}

#[derive(Clone, Debug)]
pub struct LinkOptions {
    /// Durable queues declared on every (re)connect.
    pub queues: Vec<String>,
    pub policy: ReconnectPolicy,
    pub retry_delay: Duration,
}

/// A live connection plus channel. Cheap to clone; a clone does not keep the
/// link alive and goes stale once the link replaces it.
#[derive(Clone)]
pub struct Handle {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
}

impl Handle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("generation", &self.generation)
            .finish()
    }
}

pub struct BrokerLink {
    connector: Arc<dyn Connector>,
    options: LinkOptions,
    current: watch::Sender<Option<Handle>>,
    shutdown: watch::Sender<bool>,
    generations: AtomicU64,
    /// Highest generation whose loss already started a reconnect.
    reconnected_from: Mutex<u64>,
}

impl BrokerLink {
    pub fn new(connector: Arc<dyn Connector>, options: LinkOptions) -> Arc<Self> {
        let (current, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            connector,
            options,
            current,
            shutdown,
            generations: AtomicU64::new(0),
            reconnected_from: Mutex::new(0),
        })
    }

    pub fn current_handle(&self) -> Option<Handle> {
        self.current.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.current.borrow().is_some()
    }

    /// Watches handle changes. The consumer uses this to resubscribe.
    pub fn subscribe(&self) -> watch::Receiver<Option<Handle>> {
        self.current.subscribe()
    }

    pub fn options(&self) -> &LinkOptions {
        &self.options
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Runs the connect loop in the background so callers (the HTTP server
    /// in particular) can start without waiting for the broker.
    pub fn start(self: &Arc<Self>) -> JoinHandle<Result<Handle, BrokerError>> {
        let link = Arc::clone(self);
        tokio::spawn(async move { link.connect().await })
    }

    /// Connects according to the link's policy and installs the handle.
    pub async fn connect(self: &Arc<Self>) -> Result<Handle, BrokerError> {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if self.is_shutting_down() {
                return Err(BrokerError::Closed);
            }
            attempt += 1;
            match self.options.policy {
                ReconnectPolicy::Bounded { attempts } => {
                    tracing::info!("Broker connection attempt {}/{}...", attempt, attempts)
                }
                ReconnectPolicy::Forever => {
                    tracing::info!("Connecting to broker (attempt {})...", attempt)
                }
            }

            match self.try_connect().await {
                Ok(handle) => return Ok(handle),
                Err(e) => tracing::error!("Broker connection failed (attempt {}): {}", attempt, e),
            }

            if let ReconnectPolicy::Bounded { attempts } = self.options.policy {
                if attempt >= attempts {
                    tracing::error!("Failed to connect to broker after {} attempts", attempts);
                    tracing::warn!("Service will run without the broker");
                    return Err(BrokerError::RetriesExhausted { attempts });
                }
            }

            tracing::info!("Retrying in {:?}...", self.options.retry_delay);
            tokio::select! {
                _ = sleep(self.options.retry_delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => return Err(BrokerError::Closed),
            }
        }
    }

    async fn try_connect(self: &Arc<Self>) -> Result<Handle, BrokerError> {
        let opened = self.connector.connect().await?;

        for queue in &self.options.queues {
            if let Err(e) = opened.channel.declare_queue(queue).await {
                let _ = opened.channel.close().await;
                return Err(e);
            }
        }

        let handle = Handle {
            generation: self.generations.fetch_add(1, Ordering::SeqCst) + 1,
            channel: opened.channel,
        };

        if self.is_shutting_down() {
            let _ = handle.channel.close().await;
            return Err(BrokerError::Closed);
        }

        self.current.send_replace(Some(handle.clone()));
        tracing::info!(
            generation = handle.generation,
            queues = ?self.options.queues,
            "Broker connected, queues ready"
        );

        self.supervise(handle.generation, opened.events);
        Ok(handle)
    }

    /// Reacts to one connection's lifecycle events until it closes.
    fn supervise(self: &Arc<Self>, generation: u64, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        let link = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Some(LinkEvent::Error(message)) => {
                        tracing::error!("Broker connection error: {}", message);
                        link.invalidate(generation);
                    }
                    Some(LinkEvent::Closed) | None => {
                        link.report_lost(generation);
                        return;
                    }
                }
            }
        });
    }

    /// Clears the handle if it still belongs to `generation` and closes its
    /// channel and connection in the background. A failed channel can leave
    /// the connection up; the replacement must not end up next to it.
    fn invalidate(&self, generation: u64) {
        let mut lost = None;
        self.current.send_if_modified(|current| match current {
            Some(handle) if handle.generation == generation => {
                lost = current.take();
                true
            }
            _ => false,
        });

        if let Some(handle) = lost {
            tokio::spawn(async move {
                if let Err(e) = handle.channel.close().await {
                    tracing::debug!(
                        generation = handle.generation,
                        "Closing abandoned broker connection failed: {}",
                        e
                    );
                }
            });
        }
    }

    /// Treats the connection of `generation` as closed: invalidates it and
    /// starts one reconnect for it, however many parties report the loss.
    pub fn report_lost(self: &Arc<Self>, generation: u64) {
        self.invalidate(generation);
        if self.is_shutting_down() {
            return;
        }

        {
            let mut last = self
                .reconnected_from
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *last >= generation {
                return;
            }
            *last = generation;
        }

        tracing::warn!(
            "Broker connection closed, reconnecting in {:?}...",
            self.options.retry_delay
        );
        let link = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = link.shutdown.subscribe();
            tokio::select! {
                _ = sleep(link.options.retry_delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => return,
            }
            if let Err(e) = link.connect().await {
                tracing::warn!("Broker reconnect abandoned: {}", e);
            }
        });
    }

    /// Stops retrying, drops the handle and closes channel and connection.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        if let Some(handle) = self.current.send_replace(None) {
            match handle.channel.close().await {
                Ok(()) => tracing::info!("Broker channel and connection closed"),
                Err(e) => tracing::warn!("Error while closing broker connection: {}", e),
            }
        }
    }
}
