mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tempfile::TempDir;
use tokio::sync::Mutex;

use common::*;
use task_relay::broker::MemoryBroker;
use task_relay::events::TaskCreatedEvent;
use task_relay::link::{BrokerLink, ReconnectPolicy};
use task_relay::publisher::Publisher;
use task_relay::store::{Priority, TaskPatch, TaskStore};
use task_relay::task_api::{self, CreateTaskRequest, TaskServiceState};
use task_relay::TaskStatus;

fn state_with(dir: &TempDir, publisher: Publisher) -> TaskServiceState {
    let store = TaskStore::new(dir.path().join("tasks.db")).unwrap();
    TaskServiceState {
        store: Arc::new(Mutex::new(store)),
        publisher,
        port: 3002,
    }
}

fn titled(title: &str) -> CreateTaskRequest {
    CreateTaskRequest {
        title: Some(title.to_string()),
        ..CreateTaskRequest::default()
    }
}

#[tokio::test]
async fn creating_a_task_publishes_task_created() {
    let dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    let state = state_with(&dir, connected_publisher(&broker).await);

    let request = CreateTaskRequest {
        title: Some("  Write report ".to_string()),
        description: Some("Quarterly numbers".to_string()),
        priority: Some(Priority::High),
        user_id: Some("user-1".to_string()),
        ..CreateTaskRequest::default()
    };
    let (status, Json(body)) = task_api::create_task(State(state.clone()), Json(request))
        .await
        .unwrap();

    assert_eq!(status, StatusCode::CREATED);
    assert!(body.success);
    assert_eq!(body.message.as_deref(), Some("Task created successfully"));
    let task = body.data.unwrap();
    assert_eq!(task.title, "Write report");
    assert_eq!(task.status, TaskStatus::Pending);

    let queued = broker.ready(QUEUE);
    assert_eq!(queued.len(), 1);
    let event = TaskCreatedEvent::decode(&queued[0]).unwrap();
    assert_eq!(event.event, "task.created");
    assert_eq!(event.task_id, task.id);
    assert_eq!(event.title, "Write report");
    assert_eq!(event.description, "Quarterly numbers");
    assert_eq!(event.user_id.as_deref(), Some("user-1"));
    assert_eq!(event.created_at, Some(task.created_at));
    assert!(event.timestamp.is_some());

    let payload: serde_json::Value = serde_json::from_slice(&queued[0]).unwrap();
    assert!(payload.get("taskId").is_some());
    assert!(payload.get("createdAt").is_some());
}

#[tokio::test]
async fn task_is_saved_when_the_broker_is_down_and_never_replayed() {
    let dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    broker.set_reachable(false);

    let link = BrokerLink::new(
        broker.connector(),
        link_options(ReconnectPolicy::Bounded { attempts: 2 }, None),
    );
    assert!(link.connect().await.is_err());
    let state = state_with(&dir, Publisher::new(link, QUEUE, Duration::from_secs(1)));

    let (status, Json(body)) = task_api::create_task(State(state.clone()), Json(titled("Offline")))
        .await
        .unwrap();
    assert_eq!(status, StatusCode::CREATED);
    let task = body.data.unwrap();

    let Json(listed) = task_api::list_tasks(State(state.clone())).await.unwrap();
    assert_eq!(listed.count, Some(1));
    assert_eq!(listed.data.unwrap()[0].id, task.id);

    let health = task_api::health_check(State(state)).await.0;
    assert_eq!(health["rabbitmq"], "disconnected");
    assert_eq!(health["database"], "connected");

    broker.set_reachable(true);
    let consumer = start_consumer(&broker, ConsumerSetup::default());
    eventually("consumer connected", || consumer.link.is_connected()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(consumer.log.is_empty());
    assert!(broker.ready(QUEUE).is_empty());
}

#[tokio::test]
async fn created_tasks_reach_the_notification_log() {
    let dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    let consumer = start_consumer(&broker, ConsumerSetup::default());
    let state = state_with(&dir, connected_publisher(&broker).await);

    let mut created = Vec::new();
    for title in ["first", "second", "third"] {
        let (_, Json(body)) = task_api::create_task(State(state.clone()), Json(titled(title)))
            .await
            .unwrap();
        created.push(body.data.unwrap().id);
    }

    eventually("three notifications", || consumer.log.total() == 3).await;
    let recorded: Vec<String> = consumer
        .log
        .snapshot()
        .into_iter()
        .map(|r| r.data.task_id)
        .collect();
    assert_eq!(recorded, created);
}

#[tokio::test]
async fn missing_or_blank_title_is_a_bad_request() {
    let dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    let state = state_with(&dir, connected_publisher(&broker).await);

    for request in [CreateTaskRequest::default(), titled("   ")] {
        let err = task_api::create_task(State(state.clone()), Json(request))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Title is required");
    }

    assert!(broker.ready(QUEUE).is_empty());
    let Json(listed) = task_api::list_tasks(State(state)).await.unwrap();
    assert_eq!(listed.count, Some(0));
}

#[tokio::test]
async fn get_update_and_delete_by_id() {
    let dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    let state = state_with(&dir, connected_publisher(&broker).await);

    let (_, Json(body)) = task_api::create_task(State(state.clone()), Json(titled("Ship it")))
        .await
        .unwrap();
    let id = body.data.unwrap().id;

    let Json(fetched) = task_api::get_task(State(state.clone()), Path(id.clone()))
        .await
        .unwrap();
    assert_eq!(fetched.data.unwrap().title, "Ship it");

    let patch = TaskPatch {
        status: Some(TaskStatus::InProgress),
        ..TaskPatch::default()
    };
    let Json(updated) = task_api::update_task(State(state.clone()), Path(id.clone()), Json(patch))
        .await
        .unwrap();
    assert_eq!(updated.message.as_deref(), Some("Task updated successfully"));
    assert_eq!(updated.data.unwrap().status, TaskStatus::InProgress);

    let blank = TaskPatch {
        title: Some("   ".to_string()),
        ..TaskPatch::default()
    };
    let err = task_api::update_task(State(state.clone()), Path(id.clone()), Json(blank))
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::BAD_REQUEST);
    assert_eq!(err.message, "Title is required");
    let Json(unchanged) = task_api::get_task(State(state.clone()), Path(id.clone()))
        .await
        .unwrap();
    assert_eq!(unchanged.data.unwrap().title, "Ship it");

    // Only creation publishes.
    assert_eq!(broker.ready(QUEUE).len(), 1);

    let Json(deleted) = task_api::delete_task(State(state.clone()), Path(id.clone()))
        .await
        .unwrap();
    assert_eq!(deleted.message.as_deref(), Some("Task deleted successfully"));

    let missing = task_api::get_task(State(state.clone()), Path(id.clone()))
        .await
        .unwrap_err();
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    let missing = task_api::delete_task(State(state.clone()), Path(id.clone()))
        .await
        .unwrap_err();
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    let missing = task_api::update_task(State(state), Path(id), Json(TaskPatch::default()))
        .await
        .unwrap_err();
    assert_eq!(missing.message, "Task not found");
}

#[tokio::test]
async fn tasks_survive_a_store_reopen() {
    let dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    let state = state_with(&dir, connected_publisher(&broker).await);
    task_api::create_task(State(state.clone()), Json(titled("Durable")))
        .await
        .unwrap();
    let _ = task_api::router(state.clone());
    drop(state);

    let reopened = TaskStore::new(dir.path().join("tasks.db")).unwrap();
    let tasks = reopened.list().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "Durable");
}
