use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::CurrentTeacher;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::schemas::sheet::{
    ExtractionPayload, SheetCreate, SheetErrorPayload, SheetListQuery, SheetResponse,
};
use crate::services::sheets;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/templates/:template_id/sheets", post(register_sheet).get(list_sheets))
        .route("/sheets/:sheet_id", get(get_sheet))
        .route("/sheets/:sheet_id/extraction", post(record_extraction))
        .route("/sheets/:sheet_id/error", post(mark_sheet_error))
}

async fn register_sheet(
    Path(template_id): Path<String>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
    Json(payload): Json<SheetCreate>,
) -> Result<(StatusCode, Json<SheetResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let sheet = sheets::register_sheet(
        state.store(),
        &template_id,
        payload.student_id,
        &payload.original_url,
        primitive_now_utc(),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(sheet.into())))
}

async fn list_sheets(
    Path(template_id): Path<String>,
    Query(query): Query<SheetListQuery>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<Vec<SheetResponse>>, ApiError> {
    let sheets = sheets::list_sheets(state.store(), &template_id, query.status).await?;
    Ok(Json(sheets.into_iter().map(SheetResponse::from).collect()))
}

async fn get_sheet(
    Path(sheet_id): Path<String>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<SheetResponse>, ApiError> {
    Ok(Json(sheets::get_sheet(state.store(), &sheet_id).await?.into()))
}

async fn record_extraction(
    Path(sheet_id): Path<String>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
    Json(payload): Json<ExtractionPayload>,
) -> Result<Json<SheetResponse>, ApiError> {
    let sheet =
        sheets::record_extraction(state.store(), &sheet_id, payload.extracted_data, primitive_now_utc())
            .await?;
    Ok(Json(sheet.into()))
}

async fn mark_sheet_error(
    Path(sheet_id): Path<String>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
    Json(payload): Json<SheetErrorPayload>,
) -> Result<Json<SheetResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let sheet =
        sheets::mark_sheet_error(state.store(), &sheet_id, &payload.reason, primitive_now_utc())
            .await?;
    Ok(Json(sheet.into()))
}
