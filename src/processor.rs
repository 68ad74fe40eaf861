use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use tokio::sync::broadcast;

use crate::error::ProcessError;
use crate::events::{NotificationRecord, TaskCreatedEvent, TASK_CREATED};

pub const DEFAULT_CAPACITY: usize = 100;

/// Turns a decoded event into a notification.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, event: TaskCreatedEvent) -> Result<NotificationRecord, ProcessError>;
}

/// Most recent notifications, oldest evicted first.
pub struct NotificationLog {
    capacity: usize,
    inner: Mutex<LogState>,
}

struct LogState {
    records: VecDeque<NotificationRecord>,
    total: u64,
    last_id: i64,
}

impl NotificationLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(LogState {
                records: VecDeque::with_capacity(capacity),
                total: 0,
                last_id: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the record for `event` and appends it. Ids are the processing
    /// time in milliseconds, bumped when needed so they strictly increase.
    pub fn record(&self, event: TaskCreatedEvent, at: DateTime<Utc>) -> NotificationRecord {
        let mut state = self.lock();
        let id = at.timestamp_millis().max(state.last_id + 1);
        state.last_id = id;

        let record = NotificationRecord::task_created(id, event, at);
        if state.records.len() == self.capacity {
            state.records.pop_front();
        }
        state.records.push_back(record.clone());
        state.total += 1;
        record
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records processed since start, including evicted ones.
    pub fn total(&self) -> u64 {
        self.lock().total
    }

    /// Up to `n` newest records, oldest of them first.
    pub fn recent(&self, n: usize) -> Vec<NotificationRecord> {
        let state = self.lock();
        let skip = state.records.len().saturating_sub(n);
        state.records.iter().skip(skip).cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<NotificationRecord> {
        self.lock().records.iter().cloned().collect()
    }
}

impl Default for NotificationLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

pub struct NotificationProcessor {
    log: Arc<NotificationLog>,
    tx: broadcast::Sender<NotificationRecord>,
}

impl NotificationProcessor {
    pub fn new(
        log: Arc<NotificationLog>,
        tx: broadcast::Sender<NotificationRecord>,
    ) -> Self {
        Self { log, tx }
    }
}

#[async_trait]
impl Processor for NotificationProcessor {
    async fn process(&self, event: TaskCreatedEvent) -> Result<NotificationRecord, ProcessError> {
        if event.event != TASK_CREATED {
            return Err(ProcessError::UnexpectedEvent(event.event));
        }

        let now = Utc::now();
        let created = event
            .created_at
            .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        tracing::info!(
            "New task created: \"{}\" | user: {} | task id: {} | created: {} | processed: {}",
            event.title,
            event.user_id.as_deref().unwrap_or("Unknown"),
            event.task_id,
            created,
            now.with_timezone(&Local).format("%H:%M:%S"),
        );

        let record = self.log.record(event, now);
        // No subscribers is the normal case.
        let _ = self.tx.send(record.clone());
        Ok(record)
    }
}
