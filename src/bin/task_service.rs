use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use task_relay::broker::AmqpConnector;
use task_relay::config::{RelayConfig, TASK_SERVICE_PORT};
use task_relay::link::{BrokerLink, LinkOptions, ReconnectPolicy};
use task_relay::publisher::Publisher;
use task_relay::signals::{init_tracing, shutdown_signal};
use task_relay::store::TaskStore;
use task_relay::task_api::{self, TaskServiceState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!("Starting Task Service...");

    let config = RelayConfig::from_env(TASK_SERVICE_PORT)?;

    let store = TaskStore::new(&config.database_path)
        .with_context(|| format!("Failed to open task database {}", config.database_path))?;
    tracing::info!("Task database ready at {}", config.database_path);

    // The producer gives up after a few attempts and keeps serving without a
    // broker; tasks created meanwhile are never announced.
    let link = BrokerLink::new(
        Arc::new(AmqpConnector::new(&config.broker_url)),
        LinkOptions {
            queues: vec![config.queue.clone()],
            policy: ReconnectPolicy::Bounded {
                attempts: config.retry_count,
            },
            retry_delay: config.retry_delay,
        },
    );

    let state = TaskServiceState {
        store: Arc::new(Mutex::new(store)),
        publisher: Publisher::new(link.clone(), &config.queue, config.publish_timeout),
        port: config.port,
    };

    let app = task_api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Task Service running on http://{}", addr);

    link.start();

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = shutdown_signal().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
        .context("HTTP server failed")?;

    tracing::info!("Shutting down...");
    link.close().await;
    Ok(())
}
