//! # Sync Handlers
//!
//! Backfill triggers return a task handle right away; the task stays pollable after the
//! response has gone out.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ApiError, IngestError, not_found};
use crate::handlers::connections::load_connection;
use crate::handlers::parse_id;
use crate::models::connection::STATUS_DISCONNECTED;
use crate::server::AppState;
use crate::sync_tasks::{SyncTask, SyncTrigger};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CancelSyncResponse {
    pub connection_id: Uuid,
    /// False when no backfill was running
    pub cancelled: bool,
}

/// Start a background backfill
#[utoipa::path(
    post,
    path = "/connections/{id}/sync",
    params(("id" = String, Path, description = "Connection UUID")),
    responses(
        (status = 202, description = "Sync task queued", body = SyncTask),
        (status = 404, description = "Not found or disconnected", body = ApiError),
        (status = 409, description = "A backfill is already running for this connection", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn trigger_sync(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<SyncTask>), ApiError> {
    let connection = load_connection(&state, parse_id(&id, "connection")?).await?;
    if connection.status == STATUS_DISCONNECTED {
        return Err(IngestError::ConnectionInactive {
            connection_id: connection.id,
            status: connection.status,
        }
        .into());
    }

    let task = state
        .orchestrator
        .spawn_sync(connection.id, SyncTrigger::Manual)?;
    tracing::info!(connection_id = %connection.id, task_id = %task.id, "manual sync queued");
    Ok((StatusCode::ACCEPTED, Json(task)))
}

/// Abort the running backfill; the cursor stays at the last written page
#[utoipa::path(
    post,
    path = "/connections/{id}/sync/cancel",
    params(("id" = String, Path, description = "Connection UUID")),
    responses(
        (status = 200, description = "Cancellation result", body = CancelSyncResponse),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn cancel_sync(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelSyncResponse>, ApiError> {
    let connection = load_connection(&state, parse_id(&id, "connection")?).await?;
    Ok(Json(CancelSyncResponse {
        connection_id: connection.id,
        cancelled: state.orchestrator.cancel_sync(connection.id),
    }))
}

/// Status of a sync task, with its report once finished
#[utoipa::path(
    get,
    path = "/sync-tasks/{task_id}",
    params(("task_id" = String, Path, description = "Sync task UUID")),
    responses(
        (status = 200, description = "Task status", body = SyncTask),
        (status = 404, description = "Unknown or evicted task", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn get_sync_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<SyncTask>, ApiError> {
    let task_id = parse_id(&task_id, "sync task")?;
    state
        .orchestrator
        .tasks()
        .get(task_id)
        .map(Json)
        .ok_or_else(|| not_found(&format!("sync task '{task_id}' not found")))
}
