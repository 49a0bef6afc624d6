use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::CurrentTeacher;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::schemas::grading::{BulkReviewPayload, GradingResultResponse, ReviewPayload};
use crate::services::review::{self, BulkReviewOutcome, ReviewAction};
use crate::services::report_cache;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/results/bulk-review", post(bulk_review))
        .route("/results/:result_id/review", post(review_result))
        .route("/templates/:template_id/review-queue", get(review_queue))
}

async fn review_result(
    Path(result_id): Path<String>,
    CurrentTeacher(teacher_id): CurrentTeacher,
    State(state): State<AppState>,
    Json(payload): Json<ReviewPayload>,
) -> Result<Json<GradingResultResponse>, ApiError> {
    let action = ReviewAction::from(payload);
    let reviewed =
        review::review_result(state.store(), &result_id, &teacher_id, &action, primitive_now_utc())
            .await?;
    report_cache::invalidate(state.redis(), &reviewed.template_id).await;

    Ok(Json(reviewed.result.into()))
}

async fn bulk_review(
    CurrentTeacher(teacher_id): CurrentTeacher,
    State(state): State<AppState>,
    Json(payload): Json<BulkReviewPayload>,
) -> Result<Json<BulkReviewOutcome>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let action = ReviewAction::from(payload.action);
    let outcome = review::bulk_review(
        state.store(),
        &payload.result_ids,
        &teacher_id,
        &action,
        primitive_now_utc(),
    )
    .await?;

    for template_id in &outcome.templates {
        report_cache::invalidate(state.redis(), template_id).await;
    }

    Ok(Json(outcome))
}

async fn review_queue(
    Path(template_id): Path<String>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<Vec<GradingResultResponse>>, ApiError> {
    let queue = review::review_queue(state.store(), &template_id).await?;
    Ok(Json(queue.into_iter().map(GradingResultResponse::from).collect()))
}
