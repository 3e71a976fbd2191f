//! Request handlers for the job surface.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::service::{ServiceError, StatusResponse, SubmitResponse, WorkersStatus};

use super::app::AppState;

/// The body of a request made to create a job.
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub payload: Value,
    pub webhook_url: String,
    #[serde(default)]
    pub correlation_id: Option<i64>,
    #[serde(default)]
    pub path_root: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct RecoverResponse {
    pub recovered: i64,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::UnknownOperation(_)
            | ServiceError::InvalidPayload(_)
            | ServiceError::InvalidWebhook(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::AlreadyTerminal(_) => StatusCode::CONFLICT,
            ServiceError::Store(_) | ServiceError::Scheduler(_) => {
                error!("internal error: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// `POST /jobs/{operation}` — accept a job for asynchronous execution.
pub async fn create(
    State(state): State<AppState>,
    Path(operation): Path<String>,
    Json(body): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ServiceError> {
    let accepted = state
        .service
        .create(
            &operation,
            body.payload,
            body.webhook_url,
            body.correlation_id,
            body.path_root,
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// `GET /jobs/{id}` — current state, with live chunk progress for
/// active remote jobs.
pub async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ServiceError> {
    Ok(Json(state.service.get(&id).await?))
}

/// `POST /jobs/{id}/cancel` — 200 on success, 409 once terminal.
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ServiceError> {
    Ok(Json(state.service.cancel(&id).await?))
}

/// `GET /queue/stats`.
pub async fn queue_stats(
    State(state): State<AppState>,
) -> Result<Json<render_common::store::QueueStats>, ServiceError> {
    Ok(Json(state.service.stats().await?))
}

/// `POST /admin/recover-workers` — force a reconciliation pass.
pub async fn recover_workers(
    State(state): State<AppState>,
) -> Result<Json<RecoverResponse>, ServiceError> {
    let recovered = state.service.recover_workers().await?;
    Ok(Json(RecoverResponse { recovered }))
}

/// `GET /admin/workers/status` — diagnostic counter dump.
pub async fn workers_status(
    State(state): State<AppState>,
) -> Result<Json<WorkersStatus>, ServiceError> {
    Ok(Json(state.service.workers_status().await?))
}
