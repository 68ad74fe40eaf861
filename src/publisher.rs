use std::sync::Arc;
use std::time::Duration;

use crate::events::TaskCreatedEvent;
use crate::link::BrokerLink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    /// No live connection; the event is dropped.
    Skipped,
    /// The broker did not take the event within the publish timeout.
    Failed,
}

/// Best-effort producer side of the relay.
///
/// Publishing never reports an error to its caller: the task write that
/// triggered it has already succeeded and must stay successful. With the
/// broker down the event is lost; there is no retry queue.
#[derive(Clone)]
pub struct Publisher {
    link: Arc<BrokerLink>,
    queue: String,
    timeout: Duration,
}

impl Publisher {
    pub fn new(link: Arc<BrokerLink>, queue: impl Into<String>, timeout: Duration) -> Self {
        Self {
            link,
            queue: queue.into(),
            timeout,
        }
    }

    pub fn link(&self) -> &Arc<BrokerLink> {
        &self.link
    }

    pub async fn publish(&self, event: &TaskCreatedEvent) -> PublishOutcome {
        let Some(handle) = self.link.current_handle() else {
            tracing::warn!(
                task_id = %event.task_id,
                "Broker not available, task saved without messaging"
            );
            return PublishOutcome::Skipped;
        };

        let payload = match event.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to serialize event for task {}: {}", event.task_id, e);
                return PublishOutcome::Failed;
            }
        };

        let sent = tokio::time::timeout(
            self.timeout,
            handle.channel().publish(&self.queue, &payload),
        )
        .await;

        match sent {
            Ok(Ok(())) => {
                tracing::info!(
                    task_id = %event.task_id,
                    queue = %self.queue,
                    "Message sent to broker"
                );
                PublishOutcome::Sent
            }
            Ok(Err(e)) => {
                tracing::error!("Failed to publish event for task {}: {}", event.task_id, e);
                PublishOutcome::Failed
            }
            Err(_) => {
                tracing::error!(
                    "Publishing event for task {} timed out after {:?}",
                    event.task_id,
                    self.timeout
                );
                PublishOutcome::Failed
            }
        }
    }
}
