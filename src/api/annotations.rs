use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{patch, post};
use axum::{Json, Router};

use crate::api::errors::ApiError;
use crate::api::guards::CurrentTeacher;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::schemas::annotation::{AnnotationCreate, AnnotationResponse, AnnotationUpdate};
use crate::services::annotations;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/sheets/:sheet_id/annotations", post(create_annotation).get(list_annotations))
        .route("/annotations/:annotation_id", patch(update_annotation).delete(delete_annotation))
}

async fn create_annotation(
    Path(sheet_id): Path<String>,
    CurrentTeacher(teacher_id): CurrentTeacher,
    State(state): State<AppState>,
    Json(payload): Json<AnnotationCreate>,
) -> Result<(StatusCode, Json<AnnotationResponse>), ApiError> {
    let annotation = annotations::create_annotation(
        state.store(),
        &sheet_id,
        &teacher_id,
        payload.into(),
        primitive_now_utc(),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(annotation.into())))
}

async fn list_annotations(
    Path(sheet_id): Path<String>,
    CurrentTeacher(_): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<Vec<AnnotationResponse>>, ApiError> {
    let annotations = annotations::list_annotations(state.store(), &sheet_id).await?;
    Ok(Json(annotations.into_iter().map(AnnotationResponse::from).collect()))
}

async fn update_annotation(
    Path(annotation_id): Path<String>,
    CurrentTeacher(teacher_id): CurrentTeacher,
    State(state): State<AppState>,
    Json(payload): Json<AnnotationUpdate>,
) -> Result<Json<AnnotationResponse>, ApiError> {
    let annotation = annotations::update_annotation(
        state.store(),
        &annotation_id,
        &teacher_id,
        payload.into(),
        primitive_now_utc(),
    )
    .await?;

    Ok(Json(annotation.into()))
}

async fn delete_annotation(
    Path(annotation_id): Path<String>,
    CurrentTeacher(teacher_id): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    annotations::delete_annotation(state.store(), &annotation_id, &teacher_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
