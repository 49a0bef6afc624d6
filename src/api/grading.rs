use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::CurrentTeacher;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::schemas::grading::{
    GradingJobResponse, GradingResultResponse, GradingStart, ResultsQuery,
};
use crate::services::grading;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/templates/:template_id/grading-jobs", post(start_grading).get(list_jobs))
        .route("/grading-jobs/:job_id", get(get_job))
        .route("/grading-jobs/:job_id/results", get(list_results))
}

async fn start_grading(
    Path(template_id): Path<String>,
    CurrentTeacher(teacher_id): CurrentTeacher,
    State(state): State<AppState>,
    Json(payload): Json<GradingStart>,
) -> Result<(StatusCode, Json<GradingJobResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let job = grading::start_grading(
        state.store(),
        &template_id,
        &teacher_id,
        payload.sheet_ids,
        primitive_now_utc(),
    )
    .await?;

    Ok((StatusCode::ACCEPTED, Json(job.into())))
}

async fn list_jobs(
    Path(template_id): Path<String>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<Vec<GradingJobResponse>>, ApiError> {
    let jobs = grading::list_jobs(state.store(), &template_id).await?;
    Ok(Json(jobs.into_iter().map(GradingJobResponse::from).collect()))
}

async fn get_job(
    Path(job_id): Path<String>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<GradingJobResponse>, ApiError> {
    Ok(Json(grading::get_job(state.store(), &job_id).await?.into()))
}

async fn list_results(
    Path(job_id): Path<String>,
    Query(query): Query<ResultsQuery>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<Vec<GradingResultResponse>>, ApiError> {
    let results = grading::list_results(state.store(), &job_id, query.needs_review).await?;
    Ok(Json(results.into_iter().map(GradingResultResponse::from).collect()))
}
