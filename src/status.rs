//! Status surface of the notification service. Reads in-memory state only.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;

use crate::consumer::{ConsumerStats, StatsSnapshot};
use crate::events::NotificationRecord;
use crate::link::BrokerLink;
use crate::processor::NotificationLog;

pub const SERVICE_NAME: &str = "Notification Consumer";
pub const RECENT_LIMIT: usize = 5;

#[derive(Clone)]
pub struct StatusState {
    pub link: Arc<BrokerLink>,
    pub log: Arc<NotificationLog>,
    pub stats: Arc<ConsumerStats>,
    pub queue: String,
    pub started: Instant,
    pub tx: broadcast::Sender<NotificationRecord>,
    /// Flips to true on shutdown; open event streams end then.
    pub shutdown: watch::Receiver<bool>,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/events", get(sse_handler))
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub service: &'static str,
    pub status: &'static str,
    pub queue: String,
    pub messages_processed: u64,
    pub rabbitmq: &'static str,
    pub timestamp: DateTime<Utc>,
    pub connected: bool,
    pub queue_depth_known: bool,
    pub processed_count: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub total_processed: u64,
    pub buffered: usize,
    pub last_notifications: Vec<NotificationRecord>,
    pub uptime: f64,
    pub outcomes: StatsSnapshot,
}

pub async fn health(State(state): State<StatusState>) -> Json<HealthReport> {
    let connected = state.link.is_connected();
    let processed = state.log.total();

    Json(HealthReport {
        service: SERVICE_NAME,
        status: "running",
        queue: state.queue.clone(),
        messages_processed: processed,
        rabbitmq: if connected { "connected" } else { "disconnected" },
        timestamp: Utc::now(),
        connected,
        // AMQP only reports depth on declare; the status path never asks.
        queue_depth_known: false,
        processed_count: processed,
    })
}

pub async fn stats(State(state): State<StatusState>) -> Json<StatsReport> {
    Json(StatsReport {
        total_processed: state.log.total(),
        buffered: state.log.len(),
        last_notifications: state.log.recent(RECENT_LIMIT),
        uptime: state.started.elapsed().as_secs_f64(),
        outcomes: state.stats.snapshot(),
    })
}

async fn sse_handler(
    State(state): State<StatusState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!("New SSE connection established");
    let rx = state.tx.subscribe();
    let mut shutdown = state.shutdown.clone();

    let stream = BroadcastStream::new(rx).map(|msg| match msg {
        Ok(record) => {
            let data = serde_json::to_string(&record).unwrap_or_default();
            Ok(Event::default().event("notification").data(data))
        }
        Err(_lag) => {
            tracing::warn!("SSE stream lagged");
            Ok(Event::default().comment("lagged"))
        }
    })
    .take_until(async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
