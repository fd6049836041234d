use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::AppState;
use crate::crds::{AgentTaskSpec, AgentTaskStatus, RepositoryRef};
use crate::tasks::credentials::{CredentialError, CredentialGrant};
use crate::tasks::ingest::{self, IngestOutcome, Rejection, StatusEvent};
use crate::tasks::naming::ResourceNaming;
use crate::tasks::store::{StoreError, TaskRecord};

/// Error body: `{"error": "..."}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(id: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("task {id} not found"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::not_found(&id),
            StoreError::AlreadyExists(id) => {
                Self::new(StatusCode::CONFLICT, format!("task {id} already exists"))
            }
            StoreError::Conflict(id) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("task {id} is being updated concurrently, retry"),
            ),
            other => {
                error!(error = %other, "Task store failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default, rename = "sourceReference")]
    pub source_reference: Option<String>,
    pub repo: RepositoryRef,
    #[serde(default, rename = "callbackURL", alias = "callbackUrl")]
    pub callback_url: Option<String>,
    #[serde(default, rename = "sandboxTemplate")]
    pub sandbox_template: Option<String>,
}

/// Everything a caller may want to know about a task
#[derive(Debug, Serialize)]
pub struct TaskView {
    pub id: String,
    pub spec: AgentTaskSpec,
    pub status: AgentTaskStatus,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl From<TaskRecord> for TaskView {
    fn from(record: TaskRecord) -> Self {
        Self {
            id: record.id,
            spec: record.spec,
            status: record.status,
            created_at: record.created_at,
        }
    }
}

/// What the worker needs to start
#[derive(Debug, Serialize)]
pub struct TaskData {
    #[serde(rename = "taskID")]
    pub task_id: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(rename = "sourceReference", skip_serializing_if = "Option::is_none")]
    pub source_reference: Option<String>,
    pub repository: RepositoryRef,
}

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "sandbox-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub async fn readiness_check() -> Json<Value> {
    Json(json!({ "status": "ready" }))
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let id = request.id.unwrap_or_else(ResourceNaming::generate_task_id);
    ResourceNaming::validate_task_id(&id).map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e))?;

    if request.description.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "description must not be empty",
        ));
    }
    if request.repo.slug().is_none() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("repository URL '{}' does not name a repository", request.repo.url),
        ));
    }

    let spec = AgentTaskSpec {
        description: request.description,
        context: request.context,
        source_reference: request.source_reference,
        repository: request.repo,
        callback_url: request.callback_url,
        sandbox_template: request.sandbox_template,
    };
    state.store.create(&id, spec).await?;
    info!(task_id = %id, "Task created");

    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskView>> {
    let task = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(&id))?;
    Ok(Json(task.record.into()))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let phase = state
        .reconciler
        .cancel(&id)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| ApiError::not_found(&id))?;
    Ok(Json(json!({ "id": id, "phase": phase })))
}

pub async fn task_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskData>> {
    let record = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(&id))?
        .record;

    if record.status.phase.is_terminal() {
        return Err(ApiError::new(
            StatusCode::GONE,
            format!("task {id} is already {}", record.status.phase),
        ));
    }

    Ok(Json(TaskData {
        task_id: record.id,
        description: record.spec.description,
        context: record.spec.context,
        source_reference: record.spec.source_reference,
        repository: record.spec.repository,
    }))
}

pub async fn task_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CredentialGrant>> {
    match state.issuer.issue(&id).await {
        Ok(grant) => Ok(Json(grant)),
        Err(err) => {
            let status = match &err {
                CredentialError::UnknownTask(_) => StatusCode::NOT_FOUND,
                CredentialError::AlreadyIssued(_) => StatusCode::CONFLICT,
                CredentialError::TaskTerminal { .. } => StatusCode::GONE,
                CredentialError::NotConfigured
                | CredentialError::Exchange(_)
                | CredentialError::Store(StoreError::Conflict(_)) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                CredentialError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            if status.is_server_error() {
                warn!(task_id = %id, error = %err, "Credential request failed");
            }
            Err(ApiError::new(status, err.to_string()))
        }
    }
}

pub async fn task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(event): Json<StatusEvent>,
) -> ApiResult<Json<Value>> {
    let outcome = ingest::apply(state.store.as_ref(), &id, &event)
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    match outcome {
        IngestOutcome::Accepted { phase, changed } => {
            Ok(Json(json!({ "phase": phase, "applied": changed })))
        }
        IngestOutcome::Rejected(Rejection::AlreadyTerminal(phase)) => {
            Ok(Json(json!({ "phase": phase, "applied": false })))
        }
        IngestOutcome::Rejected(Rejection::UnknownTask) => Err(ApiError::not_found(&id)),
    }
}
