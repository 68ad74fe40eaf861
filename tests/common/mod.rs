#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use task_relay::broker::{Connector, MemoryBroker};
use task_relay::consumer::{ConsumerLoop, ConsumerOptions, ConsumerStats};
use task_relay::events::{TaskCreatedEvent, TaskStatus, TASK_CREATED};
use task_relay::link::{BrokerLink, LinkOptions, ReconnectPolicy};
use task_relay::processor::{NotificationLog, NotificationProcessor, Processor};
use task_relay::publisher::Publisher;
use task_relay::status::StatusState;

pub const QUEUE: &str = "task_created";
pub const DEAD_LETTERS: &str = "task_created.dead";
pub const RETRY_DELAY: Duration = Duration::from_millis(10);

pub fn link_options(policy: ReconnectPolicy, dead_letters: Option<&str>) -> LinkOptions {
    let mut queues = vec![QUEUE.to_string()];
    queues.extend(dead_letters.map(str::to_string));
    LinkOptions {
        queues,
        policy,
        retry_delay: RETRY_DELAY,
    }
}

pub fn event(n: usize) -> TaskCreatedEvent {
    TaskCreatedEvent {
        event: TASK_CREATED.to_string(),
        task_id: format!("task-{n}"),
        title: format!("Task {n}"),
        description: String::new(),
        status: TaskStatus::Pending,
        user_id: None,
        created_at: Some(Utc::now()),
        timestamp: Some(Utc::now()),
    }
}

pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Producer side wired to `broker`, already connected.
pub async fn connected_publisher(broker: &MemoryBroker) -> Publisher {
    let link = BrokerLink::new(
        broker.connector(),
        link_options(ReconnectPolicy::Bounded { attempts: 3 }, None),
    );
    link.connect().await.expect("producer connects");
    Publisher::new(link, QUEUE, Duration::from_secs(1))
}

/// A running consumer loop and everything a test wants to look at.
pub struct Consumer {
    pub link: Arc<BrokerLink>,
    pub log: Arc<NotificationLog>,
    pub stats: Arc<ConsumerStats>,
    pub tx: broadcast::Sender<task_relay::NotificationRecord>,
    pub stop: watch::Sender<bool>,
    pub task: JoinHandle<()>,
}

pub struct ConsumerSetup {
    pub processor: Option<Arc<dyn Processor>>,
    pub log: Arc<NotificationLog>,
    pub dead_letters: Option<&'static str>,
    pub process_timeout: Duration,
}

impl Default for ConsumerSetup {
    fn default() -> Self {
        Self {
            processor: None,
            log: Arc::new(NotificationLog::default()),
            dead_letters: None,
            process_timeout: Duration::from_secs(5),
        }
    }
}

pub fn start_consumer(broker: &MemoryBroker, setup: ConsumerSetup) -> Consumer {
    start_consumer_on(broker.connector(), setup)
}

pub fn start_consumer_on(connector: Arc<dyn Connector>, setup: ConsumerSetup) -> Consumer {
    let link = BrokerLink::new(
        connector,
        link_options(ReconnectPolicy::Forever, setup.dead_letters),
    );
    let (tx, _rx) = broadcast::channel(16);
    let processor = setup.processor.unwrap_or_else(|| {
        Arc::new(NotificationProcessor::new(setup.log.clone(), tx.clone()))
    });

    let consumer = ConsumerLoop::new(
        link.clone(),
        processor,
        ConsumerOptions {
            queue: QUEUE.to_string(),
            prefetch: 1,
            process_timeout: setup.process_timeout,
            dead_letter_queue: setup.dead_letters.map(str::to_string),
        },
    );
    let stats = consumer.stats();
    let (stop, stop_rx) = watch::channel(false);

    link.start();
    let task = tokio::spawn(consumer.run(stop_rx));

    Consumer {
        link,
        log: setup.log,
        stats,
        tx,
        stop,
        task,
    }
}

impl Consumer {
    pub fn status_state(&self) -> StatusState {
        StatusState {
            link: self.link.clone(),
            log: self.log.clone(),
            stats: self.stats.clone(),
            queue: QUEUE.to_string(),
            started: Instant::now(),
            tx: self.tx.clone(),
            shutdown: self.stop.subscribe(),
        }
    }
}
