use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::CurrentTeacher;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::schemas::training::{ModelResponse, ModelSeed, TrainingSessionResponse, TrainingStart};
use crate::services::training;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/templates/:template_id/training",
            post(start_training).get(list_training_sessions),
        )
        .route("/training/:session_id", get(get_training_session))
        .route("/templates/:template_id/models", get(list_models))
        .route("/templates/:template_id/models/seed", post(seed_model))
        .route("/models/:model_id/activate", post(activate_model))
        .route("/models/:model_id/deactivate", post(deactivate_model))
}

/// Queues a session; a worker picks it up and calls the ML service.
async fn start_training(
    Path(template_id): Path<String>,
    CurrentTeacher(teacher_id): CurrentTeacher,
    State(state): State<AppState>,
    payload: Option<Json<TrainingStart>>,
) -> Result<(StatusCode, Json<TrainingSessionResponse>), ApiError> {
    let payload = payload.map(|Json(body)| body).unwrap_or_default();
    let min_annotations = state.settings().grading().min_training_annotations;

    let session = training::start_training(
        state.store(),
        min_annotations,
        &template_id,
        &teacher_id,
        payload.config,
        primitive_now_utc(),
    )
    .await?;

    Ok((StatusCode::ACCEPTED, Json(session.into())))
}

async fn list_training_sessions(
    Path(template_id): Path<String>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<Vec<TrainingSessionResponse>>, ApiError> {
    let sessions = training::list_training_sessions(state.store(), &template_id).await?;
    Ok(Json(sessions.into_iter().map(TrainingSessionResponse::from).collect()))
}

async fn get_training_session(
    Path(session_id): Path<String>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<TrainingSessionResponse>, ApiError> {
    Ok(Json(training::get_training_session(state.store(), &session_id).await?.into()))
}

async fn list_models(
    Path(template_id): Path<String>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<Vec<ModelResponse>>, ApiError> {
    let models = training::list_models(state.store(), &template_id).await?;
    Ok(Json(models.into_iter().map(ModelResponse::from).collect()))
}

/// Registers a model trained outside the service; it starts inactive.
async fn seed_model(
    Path(template_id): Path<String>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
    Json(payload): Json<ModelSeed>,
) -> Result<(StatusCode, Json<ModelResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let model = training::seed_model(
        state.store(),
        &template_id,
        &payload.artifact_url,
        payload.accuracy,
        primitive_now_utc(),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(model.into())))
}

async fn activate_model(
    Path(model_id): Path<String>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<ModelResponse>, ApiError> {
    Ok(Json(training::activate_model(state.store(), &model_id, primitive_now_utc()).await?.into()))
}

async fn deactivate_model(
    Path(model_id): Path<String>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<ModelResponse>, ApiError> {
    Ok(Json(training::deactivate_model(state.store(), &model_id).await?.into()))
}
