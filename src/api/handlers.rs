//! Request handlers for the scheduling API.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::AppState;
use crate::models::interaction::{ClaimSource, ScheduleRequest, ScheduledInteraction};
use crate::orchestrator::reconciler::TickSummary;
use crate::publisher::BatchOutcome;
use crate::AppError;

/// Maps [`AppError`] onto an HTTP status with a JSON `{"error"}` body.
#[derive(Debug)]
pub struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            ref err if err.is_infrastructure() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Response for a single scheduling request.
#[derive(Debug, Serialize)]
pub struct ScheduleResponse {
    /// Created interaction id.
    pub id: String,
    /// Whether the broker took the signal. The row is persisted either way.
    pub accepted: bool,
    /// Publish failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `GET /health`.
pub async fn health() -> &'static str {
    "ok"
}

/// `POST /interactions`: persist a `pending` row, then publish.
pub async fn schedule_one(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ScheduleRequest>,
) -> ApiResult<(StatusCode, Json<ScheduleResponse>)> {
    request.validate()?;
    let item = state
        .interactions
        .create(&ScheduledInteraction::new(request))
        .await?;
    info!(interaction_id = %item.id, lead_id = %item.lead_id, scheduled_at = %item.scheduled_at, "interaction scheduled");

    let response = match state.publisher.schedule(&item).await {
        Ok(()) => ScheduleResponse {
            id: item.id,
            accepted: true,
            error: None,
        },
        Err(err) => {
            warn!(interaction_id = %item.id, %err, "publish failed; poller will pick the row up");
            ScheduleResponse {
                id: item.id,
                accepted: false,
                error: Some(err.to_string()),
            }
        }
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// `POST /interactions/batch`: persist every row, then publish the batch.
pub async fn schedule_batch(
    State(state): State<Arc<AppState>>,
    Json(requests): Json<Vec<ScheduleRequest>>,
) -> ApiResult<Response> {
    for (index, request) in requests.iter().enumerate() {
        request
            .validate()
            .map_err(|err| AppError::Validation(format!("item {index}: {err}")))?;
    }

    let mut items = Vec::with_capacity(requests.len());
    for request in requests {
        items.push(
            state
                .interactions
                .create(&ScheduledInteraction::new(request))
                .await?,
        );
    }
    info!(count = items.len(), "interaction batch scheduled");

    match state.publisher.schedule_batch(&items).await {
        Ok(outcome) => Ok((StatusCode::ACCEPTED, Json::<BatchOutcome>(outcome)).into_response()),
        Err(err @ AppError::BrokerUnavailable(_)) => {
            let ids: Vec<&str> = items.iter().map(|item| item.id.as_str()).collect();
            Ok((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": err.to_string(), "ids": ids })),
            )
                .into_response())
        }
        Err(err) => Err(err.into()),
    }
}

/// `GET /interactions/{id}`.
pub async fn get_interaction(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ScheduledInteraction>> {
    let item = state
        .interactions
        .get_by_id(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("interaction {id}")))?;
    Ok(Json(item))
}

/// `POST /reconcile`: one manual reconcile tick.
pub async fn reconcile(State(state): State<Arc<AppState>>) -> ApiResult<Json<TickSummary>> {
    let summary = state.reconciler.tick(ClaimSource::Manual).await?;
    Ok(Json(summary))
}
