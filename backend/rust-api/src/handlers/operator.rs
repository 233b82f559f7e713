use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;

use crate::{
    error::AttemptError,
    extractors::AppJson,
    middlewares::auth::JwtClaims,
    models::feedback::{RetryBatchRequest, RetryOneRequest},
    services::AppState,
};

pub async fn retry_attempt_feedback(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
    AppJson(req): AppJson<RetryOneRequest>,
) -> Result<impl IntoResponse, AttemptError> {
    tracing::info!(
        operator = %claims.sub,
        attempt_id = %attempt_id,
        force = req.force,
        "Feedback retry requested"
    );

    let report = state
        .feedback_orchestrator()
        .retry_one(&attempt_id, req.force)
        .await?;
    Ok(Json(report))
}

pub async fn retry_feedback_batch(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    AppJson(req): AppJson<RetryBatchRequest>,
) -> Result<impl IntoResponse, AttemptError> {
    tracing::info!(operator = %claims.sub, "Bulk feedback retry requested");

    let response = state.feedback_orchestrator().retry_batch(req).await?;
    tracing::info!(
        processed = response.processed,
        succeeded = response.succeeded,
        failed = response.failed,
        "Bulk feedback retry finished"
    );
    Ok(Json(response))
}
