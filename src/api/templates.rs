use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::CurrentTeacher;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::schemas::template::{
    RegionsReplace, TemplateCreate, TemplateResponse, TemplateRevisionResponse,
    TemplateSummaryResponse,
};
use crate::services::{report_cache, templates};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/templates", post(create_template).get(list_templates))
        .route("/templates/:template_id", get(get_template).delete(delete_template))
        .route("/templates/:template_id/regions", put(replace_regions))
}

async fn create_template(
    CurrentTeacher(teacher_id): CurrentTeacher,
    State(state): State<AppState>,
    Json(payload): Json<TemplateCreate>,
) -> Result<(StatusCode, Json<TemplateResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let template =
        templates::create_template(state.store(), payload.into(), &teacher_id, primitive_now_utc())
            .await?;

    Ok((StatusCode::CREATED, Json(template.into())))
}

async fn list_templates(
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<Vec<TemplateSummaryResponse>>, ApiError> {
    let templates = templates::list_templates(state.store()).await?;
    Ok(Json(templates.into_iter().map(TemplateSummaryResponse::from).collect()))
}

async fn get_template(
    Path(template_id): Path<String>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<TemplateResponse>, ApiError> {
    let template = templates::get_template(state.store(), &template_id).await?;
    Ok(Json(template.into()))
}

/// Region edits on a template that already has graded results fork a new
/// version instead of rewriting history.
async fn replace_regions(
    Path(template_id): Path<String>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
    Json(payload): Json<RegionsReplace>,
) -> Result<Json<TemplateRevisionResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let regions = payload.regions.into_iter().map(Into::into).collect();
    let revision =
        templates::revise_template(state.store(), &template_id, regions, primitive_now_utc())
            .await?;
    if !revision.new_version {
        report_cache::invalidate(state.redis(), &template_id).await;
    }

    Ok(Json(revision.into()))
}

async fn delete_template(
    Path(template_id): Path<String>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    templates::delete_template(state.store(), &template_id).await?;
    report_cache::invalidate(state.redis(), &template_id).await;
    Ok(StatusCode::NO_CONTENT)
}
