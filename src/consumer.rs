//! Consumer loop: one subscription, one message at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;

use crate::broker::Delivery;
use crate::error::ProcessError;
use crate::events::TaskCreatedEvent;
use crate::link::{BrokerLink, Handle};
use crate::processor::Processor;

#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    pub queue: String,
    pub prefetch: u16,
    pub process_timeout: Duration,
    /// Where unprocessable messages go. `None` drops them.
    pub dead_letter_queue: Option<String>,
}

/// What to tell the broker about one delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject { requeue: bool },
    DeadLetter { reason: String },
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    acked: AtomicU64,
    rejected: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub acked: u64,
    pub rejected: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            acked: self.acked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }

    fn count(&self, disposition: &Disposition) {
        let counter = match disposition {
            Disposition::Ack => &self.acked,
            Disposition::Reject { requeue: true } => &self.requeued,
            Disposition::Reject { requeue: false } => &self.rejected,
            Disposition::DeadLetter { .. } => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct ConsumerLoop {
    link: Arc<BrokerLink>,
    processor: Arc<dyn Processor>,
    options: ConsumerOptions,
    stats: Arc<ConsumerStats>,
}

impl ConsumerLoop {
    pub fn new(
        link: Arc<BrokerLink>,
        processor: Arc<dyn Processor>,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            link,
            processor,
            options,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Consumes until `shutdown` turns true. Survives any number of broker
    /// reconnects: after the delivery stream of one connection ends it waits
    /// for the link to install a newer handle and subscribes again.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut handles = self.link.subscribe();
        let mut stale: Option<u64> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let handle = tokio::select! {
                handle = next_handle(&mut handles, stale) => match handle {
                    Some(handle) => handle,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            stale = Some(handle.generation());

            let mut deliveries = match handle
                .channel()
                .consume(&self.options.queue, self.options.prefetch)
                .await
            {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    tracing::error!("Failed to subscribe to {}: {}", self.options.queue, e);
                    self.link.report_lost(handle.generation());
                    continue;
                }
            };
            tracing::info!(
                queue = %self.options.queue,
                prefetch = self.options.prefetch,
                "Consumer is ready and waiting for messages"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    next = deliveries.next() => match next {
                        Some(Ok(delivery)) => {
                            self.handle_delivery(&handle, delivery).await;
                        }
                        Some(Err(e)) => {
                            tracing::error!("Delivery stream failed: {}", e);
                            self.link.report_lost(handle.generation());
                            break;
                        }
                        None => {
                            tracing::warn!("Delivery stream ended, waiting for reconnect");
                            self.link.report_lost(handle.generation());
                            break;
                        }
                    },
                }
            }
        }

        tracing::info!("Consumer loop stopped");
    }

    /// Decides what happens to one raw message. Only a successful decode and
    /// process acknowledges; everything else is rejected or dead-lettered.
    pub async fn dispose(&self, payload: &[u8]) -> Disposition {
        let outcome = match TaskCreatedEvent::decode(payload) {
            Ok(event) => {
                tracing::debug!(task_id = %event.task_id, "Received message");
                match tokio::time::timeout(
                    self.options.process_timeout,
                    self.processor.process(event),
                )
                .await
                {
                    Ok(result) => result.map(|_| ()),
                    Err(_) => Err(ProcessError::TimedOut(self.options.process_timeout)),
                }
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => Disposition::Ack,
            Err(e) if e.is_transient() => {
                tracing::warn!("Error processing message, requeueing: {}", e);
                Disposition::Reject { requeue: true }
            }
            Err(e) => {
                tracing::error!("Error processing message: {}", e);
                match self.options.dead_letter_queue {
                    Some(_) => Disposition::DeadLetter {
                        reason: e.to_string(),
                    },
                    None => Disposition::Reject { requeue: false },
                }
            }
        }
    }

    /// Processes one delivery and settles it with the broker.
    pub async fn handle_delivery(&self, handle: &Handle, delivery: Delivery) -> Disposition {
        let mut disposition = self.dispose(&delivery.payload).await;

        if let Disposition::DeadLetter { reason } = &disposition {
            if !self.dead_letter(handle, &delivery.payload, reason).await {
                disposition = Disposition::Reject { requeue: false };
            }
        }

        let settled = match &disposition {
            Disposition::Ack | Disposition::DeadLetter { .. } => delivery.ack().await,
            Disposition::Reject { requeue } => delivery.reject(*requeue).await,
        };

        match settled {
            Ok(()) => {
                match &disposition {
                    Disposition::Ack => tracing::info!("Message acknowledged and processed"),
                    Disposition::Reject { requeue } => {
                        tracing::warn!(requeue = *requeue, "Message rejected")
                    }
                    Disposition::DeadLetter { .. } => tracing::warn!("Message dead-lettered"),
                }
                self.stats.count(&disposition);
            }
            // The broker still owns the message and redelivers it once the
            // channel is re-established.
            Err(e) => tracing::warn!("Failed to settle message: {}", e),
        }
        disposition
    }

    async fn dead_letter(&self, handle: &Handle, payload: &[u8], reason: &str) -> bool {
        let Some(queue) = self.options.dead_letter_queue.as_deref() else {
            return false;
        };
        match handle.channel().publish(queue, payload).await {
            Ok(()) => {
                tracing::warn!(queue, reason, "Moved unprocessable message to dead-letter queue");
                true
            }
            Err(e) => {
                tracing::error!("Failed to dead-letter message to {}: {}", queue, e);
                false
            }
        }
    }
}

/// Next handle whose generation differs from `stale`. `None` if the link is
/// gone.
async fn next_handle(
    handles: &mut watch::Receiver<Option<Handle>>,
    stale: Option<u64>,
) -> Option<Handle> {
    loop {
        {
            let current = handles.borrow_and_update();
            if let Some(handle) = current.as_ref() {
                if Some(handle.generation()) != stale {
                    return Some(handle.clone());
                }
            }
        }
        if handles.changed().await.is_err() {
            return None;
        }
    }
}
