//! HTTP surface of the task service.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::events::{TaskCreatedEvent, TaskStatus};
use crate::publisher::Publisher;
use crate::store::{NewTask, Priority, Task, TaskPatch, TaskStore};

#[derive(Clone)]
pub struct TaskServiceState {
    pub store: Arc<Mutex<TaskStore>>,
    pub publisher: Publisher,
    pub port: u16,
}

pub fn router(state: TaskServiceState) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health_check))
        .route("/tasks", get(list_tasks).post(create_task))
        .route(
            "/tasks/:id",
            get(get_task).put(update_task).delete(delete_task),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    fn data(data: T) -> Self {
        Self {
            success: true,
            message: None,
            count: None,
            data: Some(data),
        }
    }

    fn message(message: &str, data: Option<T>) -> Self {
        Self {
            success: true,
            message: Some(message.to_string()),
            count: None,
            data,
        }
    }
}

/// Error response: `{success: false, message, error?}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: &'static str,
    pub error: Option<String>,
}

impl ApiError {
    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "Task not found",
            error: None,
        }
    }

    fn title_required() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: "Title is required",
            error: None,
        }
    }

    fn internal(message: &'static str, err: rusqlite::Error) -> Self {
        tracing::error!("{}: {}", message, err);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
            error: Some(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "success": false, "message": self.message });
        if let Some(error) = self.error {
            body["error"] = Value::String(error);
        }
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub due_date: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
}

async fn service_info() -> Json<Value> {
    Json(json!({
        "service": "Task Service API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "getAllTasks": "GET /tasks",
            "getTask": "GET /tasks/:id",
            "createTask": "POST /tasks",
            "updateTask": "PUT /tasks/:id",
            "deleteTask": "DELETE /tasks/:id",
            "health": "GET /health"
        }
    }))
}

pub async fn health_check(State(state): State<TaskServiceState>) -> Json<Value> {
    let database = match state.store.lock().await.ping() {
        Ok(()) => "connected",
        Err(e) => {
            tracing::error!("Database health check failed: {}", e);
            "disconnected"
        }
    };
    let rabbitmq = if state.publisher.link().is_connected() {
        "connected"
    } else {
        "disconnected"
    };

    Json(json!({
        "service": "Task Service",
        "status": "OK",
        "timestamp": Utc::now(),
        "port": state.port,
        "database": database,
        "rabbitmq": rabbitmq,
    }))
}

pub async fn list_tasks(
    State(state): State<TaskServiceState>,
) -> Result<Json<Envelope<Vec<Task>>>, ApiError> {
    let store = state.store.lock().await;
    let tasks = store
        .list()
        .map_err(|e| ApiError::internal("Failed to fetch tasks", e))?;

    Ok(Json(Envelope {
        count: Some(tasks.len()),
        ..Envelope::data(tasks)
    }))
}

pub async fn get_task(
    State(state): State<TaskServiceState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<Task>>, ApiError> {
    let store = state.store.lock().await;
    match store.get(&id) {
        Ok(Some(task)) => Ok(Json(Envelope::data(task))),
        Ok(None) => Err(ApiError::not_found()),
        Err(e) => Err(ApiError::internal("Failed to fetch task", e)),
    }
}

/// Persists the task, then publishes `task.created`. The response is 201
/// whatever happens on the broker side.
pub async fn create_task(
    State(state): State<TaskServiceState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Envelope<Task>>), ApiError> {
    let title = req.title.as_deref().map(str::trim).unwrap_or_default();
    if title.is_empty() {
        return Err(ApiError::title_required());
    }

    let new = NewTask {
        title: title.to_string(),
        description: req.description.unwrap_or_default(),
        status: req.status.unwrap_or_default(),
        priority: req.priority.unwrap_or_default(),
        due_date: req.due_date,
        user_id: req.user_id,
    };

    // Scope the lock to the write; publishing must not hold up other requests.
    let task = {
        let store = state.store.lock().await;
        store
            .create(new)
            .map_err(|e| ApiError::internal("Failed to create task", e))?
    };
    tracing::info!(task_id = %task.id, "Task created");

    let event = TaskCreatedEvent::new(&task, Utc::now());
    state.publisher.publish(&event).await;

    Ok((
        StatusCode::CREATED,
        Json(Envelope::message("Task created successfully", Some(task))),
    ))
}

pub async fn update_task(
    State(state): State<TaskServiceState>,
    Path(id): Path<String>,
    Json(patch): Json<TaskPatch>,
) -> Result<Json<Envelope<Task>>, ApiError> {
    // A title may be left out of a patch, but not blanked.
    if patch.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(ApiError::title_required());
    }

    let store = state.store.lock().await;
    match store.update(&id, patch) {
        Ok(Some(task)) => Ok(Json(Envelope::message("Task updated successfully", Some(task)))),
        Ok(None) => Err(ApiError::not_found()),
        Err(e) => Err(ApiError::internal("Failed to update task", e)),
    }
}

pub async fn delete_task(
    State(state): State<TaskServiceState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<Task>>, ApiError> {
    let store = state.store.lock().await;
    match store.delete(&id) {
        Ok(true) => Ok(Json(Envelope::message("Task deleted successfully", None))),
        Ok(false) => Err(ApiError::not_found()),
        Err(e) => Err(ApiError::internal("Failed to delete task", e)),
    }
}
