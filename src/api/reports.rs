use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};

use crate::api::errors::ApiError;
use crate::api::guards::CurrentTeacher;
use crate::core::state::AppState;
use crate::schemas::grading::ReportQuery;
use crate::services::report_cache::{self, ReportKind};
use crate::services::reporting::{
    self, ClassSummary, QuestionAnalysis, ScoreDistribution, DEFAULT_BUCKETS,
};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/templates/:template_id/reports/summary", get(summary))
        .route("/templates/:template_id/reports/questions", get(questions))
        .route("/templates/:template_id/reports/distribution", get(distribution))
}

async fn summary(
    Path(template_id): Path<String>,
    Query(query): Query<ReportQuery>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<ClassSummary>, ApiError> {
    let report = report_cache::cached_or_compute(
        state.redis(),
        state.settings().grading().report_cache_ttl_seconds,
        &template_id,
        ReportKind::Summary,
        query.refresh,
        || reporting::class_summary(state.store(), &template_id),
    )
    .await?;

    Ok(Json(report))
}

async fn questions(
    Path(template_id): Path<String>,
    Query(query): Query<ReportQuery>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<QuestionAnalysis>, ApiError> {
    let report = report_cache::cached_or_compute(
        state.redis(),
        state.settings().grading().report_cache_ttl_seconds,
        &template_id,
        ReportKind::Questions,
        query.refresh,
        || reporting::question_analysis(state.store(), &template_id),
    )
    .await?;

    Ok(Json(report))
}

async fn distribution(
    Path(template_id): Path<String>,
    Query(query): Query<ReportQuery>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<ScoreDistribution>, ApiError> {
    let buckets = query.buckets.unwrap_or(DEFAULT_BUCKETS);
    let report = report_cache::cached_or_compute(
        state.redis(),
        state.settings().grading().report_cache_ttl_seconds,
        &template_id,
        ReportKind::Distribution(buckets),
        query.refresh,
        || reporting::score_distribution(state.store(), &template_id, buckets),
    )
    .await?;

    Ok(Json(report))
}
