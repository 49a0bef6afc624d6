use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::services::errors::GradingError;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: u16,
    detail: String,
}

#[derive(Debug)]
pub(crate) enum ApiError {
    Unauthorized(&'static str),
    Forbidden(&'static str),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    UnprocessableEntity(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl ApiError {
    /// Log the underlying error with context and return an `Internal` variant.
    pub(crate) fn internal(err: impl std::fmt::Display, context: &str) -> Self {
        tracing::error!(error = %err, "{context}");
        Self::Internal(context.to_string())
    }
}

impl From<GradingError> for ApiError {
    fn from(err: GradingError) -> Self {
        match err {
            GradingError::Validation(message) => ApiError::BadRequest(message),
            GradingError::Precondition(precondition) => {
                ApiError::UnprocessableEntity(precondition.to_string())
            }
            GradingError::Oracle(oracle) => {
                tracing::warn!(error = %oracle, "ML service call failed");
                ApiError::ServiceUnavailable(format!("ML service unavailable: {oracle}"))
            }
            GradingError::Conflict(message) => ApiError::Conflict(message),
            GradingError::NotFound(entity) => ApiError::NotFound(capitalized(entity) + " not found"),
            GradingError::Forbidden(message) => ApiError::Forbidden(message),
            GradingError::Store(store) => ApiError::internal(store, "Storage failure"),
        }
    }
}

fn capitalized(entity: &str) -> String {
    let mut chars = entity.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(message) => {
                let status = StatusCode::UNAUTHORIZED;
                let mut response = (
                    status,
                    Json(ErrorResponse { status: status.as_u16(), detail: message.to_string() }),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                response
            }
            ApiError::Forbidden(message) => {
                let status = StatusCode::FORBIDDEN;
                (
                    status,
                    Json(ErrorResponse { status: status.as_u16(), detail: message.to_string() }),
                )
                    .into_response()
            }
            ApiError::BadRequest(message) => {
                let status = StatusCode::BAD_REQUEST;
                (status, Json(ErrorResponse { status: status.as_u16(), detail: message }))
                    .into_response()
            }
            ApiError::NotFound(message) => {
                let status = StatusCode::NOT_FOUND;
                (status, Json(ErrorResponse { status: status.as_u16(), detail: message }))
                    .into_response()
            }
            ApiError::Conflict(message) => {
                let status = StatusCode::CONFLICT;
                (status, Json(ErrorResponse { status: status.as_u16(), detail: message }))
                    .into_response()
            }
            ApiError::UnprocessableEntity(message) => {
                let status = StatusCode::UNPROCESSABLE_ENTITY;
                (status, Json(ErrorResponse { status: status.as_u16(), detail: message }))
                    .into_response()
            }
            ApiError::ServiceUnavailable(message) => {
                tracing::error!(error = %message, "Service unavailable");
                let status = StatusCode::SERVICE_UNAVAILABLE;
                (status, Json(ErrorResponse { status: status.as_u16(), detail: message }))
                    .into_response()
            }
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal server error");
                let status = StatusCode::INTERNAL_SERVER_ERROR;
                (status, Json(ErrorResponse { status: status.as_u16(), detail: message }))
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::errors::Precondition;
    use crate::store::StoreError;

    #[test]
    fn grading_errors_map_to_status_codes() {
        let cases = [
            (GradingError::validation("bad"), StatusCode::BAD_REQUEST),
            (Precondition::NoActiveModel.into(), StatusCode::UNPROCESSABLE_ENTITY),
            (GradingError::Conflict("busy".to_string()), StatusCode::CONFLICT),
            (GradingError::NotFound("template"), StatusCode::NOT_FOUND),
            (GradingError::Forbidden("not yours"), StatusCode::FORBIDDEN),
            (
                GradingError::Store(StoreError::Database(sqlx::Error::PoolTimedOut)),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn not_found_detail_names_the_entity() {
        let ApiError::NotFound(detail) = ApiError::from(GradingError::NotFound("grading job")) else {
            panic!("expected not found");
        };
        assert_eq!(detail, "Grading job not found");
    }
}
