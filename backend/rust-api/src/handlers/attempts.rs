use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;

use crate::{
    error::AttemptError,
    extractors::AppJson,
    middlewares::auth::JwtClaims,
    models::attempt::{AutosaveRequest, StartAttemptRequest, SubmitAttemptRequest},
    services::{attempt_service::AttemptService, AppState},
};

pub async fn start_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    AppJson(req): AppJson<StartAttemptRequest>,
) -> Result<impl IntoResponse, AttemptError> {
    tracing::info!(learner_id = %claims.sub, quiz_id = %req.quiz_id, "Start attempt");

    let service = AttemptService::new(&state);
    let response = service.start(&claims.learner(), req).await?;

    let status = if response.resumed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(response)))
}

pub async fn autosave_answers(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
    AppJson(req): AppJson<AutosaveRequest>,
) -> Result<impl IntoResponse, AttemptError> {
    let service = AttemptService::new(&state);
    let response = service.autosave(&claims.learner(), &attempt_id, req).await?;
    Ok(Json(response))
}

pub async fn resume_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, AttemptError> {
    let service = AttemptService::new(&state);
    let response = service.resume(&claims.learner(), &attempt_id).await?;
    Ok(Json(response))
}

pub async fn submit_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
    AppJson(req): AppJson<SubmitAttemptRequest>,
) -> Result<impl IntoResponse, AttemptError> {
    tracing::info!(learner_id = %claims.sub, attempt_id = %attempt_id, "Submit attempt");

    let service = AttemptService::new(&state);
    let response = service.submit(&claims.learner(), &attempt_id, req).await?;
    Ok(Json(response))
}

pub async fn get_attempt_result(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, AttemptError> {
    let service = AttemptService::new(&state);
    let attempt = service.get_result(&claims.learner(), &attempt_id).await?;
    Ok(Json(attempt))
}
