use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::sync::{broadcast, watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use task_relay::broker::AmqpConnector;
use task_relay::config::{RelayConfig, NOTIFICATION_SERVICE_PORT};
use task_relay::consumer::{ConsumerLoop, ConsumerOptions};
use task_relay::link::{BrokerLink, LinkOptions, ReconnectPolicy};
use task_relay::processor::{NotificationLog, NotificationProcessor};
use task_relay::signals::{init_tracing, shutdown_signal};
use task_relay::status::{self, StatusState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!("Starting Notification Service...");

    let config = RelayConfig::from_env(NOTIFICATION_SERVICE_PORT)?;

    let mut queues = vec![config.queue.clone()];
    queues.extend(config.dead_letter_queue.clone());
    let link = BrokerLink::new(
        Arc::new(AmqpConnector::new(&config.broker_url)),
        LinkOptions {
            queues,
            policy: ReconnectPolicy::Forever,
            retry_delay: config.retry_delay,
        },
    );

    let log = Arc::new(NotificationLog::new(config.notification_capacity));
    let (tx, _rx) = broadcast::channel(100);
    let processor = Arc::new(NotificationProcessor::new(log.clone(), tx.clone()));

    let consumer = ConsumerLoop::new(
        link.clone(),
        processor,
        ConsumerOptions {
            queue: config.queue.clone(),
            prefetch: config.prefetch,
            process_timeout: config.process_timeout,
            dead_letter_queue: config.dead_letter_queue.clone(),
        },
    );
    let (stop_tx, stop_rx) = watch::channel(false);

    let state = StatusState {
        link: link.clone(),
        log,
        stats: consumer.stats(),
        queue: config.queue.clone(),
        started: Instant::now(),
        tx,
        shutdown: stop_rx.clone(),
    };

    link.start();
    let mut consumer_task = tokio::spawn(consumer.run(stop_rx));

    let app = status::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = shutdown_signal().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down...");
            stop_tx.send_replace(true);
        })
        .await
        .context("HTTP server failed")?;

    // Let the in-flight message finish; past the grace period it is
    // abandoned unacknowledged and the broker redelivers it.
    match tokio::time::timeout(config.shutdown_grace, &mut consumer_task).await {
        Ok(_) => tracing::info!("Consumer drained"),
        Err(_) => {
            tracing::warn!(
                "Consumer still busy after {:?}, abandoning in-flight message",
                config.shutdown_grace
            );
            consumer_task.abort();
        }
    }

    link.close().await;
    Ok(())
}
