use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::Sheet;
use crate::db::types::SheetStatus;

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct SheetCreate {
    #[serde(default)]
    #[serde(alias = "studentId")]
    #[validate(length(max = 100, message = "student_id must be at most 100 characters"))]
    pub(crate) student_id: Option<String>,
    #[serde(alias = "originalUrl")]
    #[validate(length(min = 1, max = 2048, message = "original_url must be 1-2048 characters"))]
    pub(crate) original_url: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExtractionPayload {
    #[serde(alias = "extractedData")]
    pub(crate) extracted_data: serde_json::Value,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct SheetErrorPayload {
    #[validate(length(min = 1, max = 2000, message = "reason must be 1-2000 characters"))]
    pub(crate) reason: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SheetListQuery {
    #[serde(default)]
    pub(crate) status: Option<SheetStatus>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SheetResponse {
    pub(crate) id: String,
    pub(crate) template_id: String,
    pub(crate) student_id: Option<String>,
    pub(crate) original_url: String,
    pub(crate) status: SheetStatus,
    pub(crate) extracted_data: Option<serde_json::Value>,
    pub(crate) error_message: Option<String>,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl From<Sheet> for SheetResponse {
    fn from(sheet: Sheet) -> Self {
        Self {
            id: sheet.id,
            template_id: sheet.template_id,
            student_id: sheet.student_id,
            original_url: sheet.original_url,
            status: sheet.status,
            extracted_data: sheet.extracted_data.map(|data| data.0),
            error_message: sheet.error_message,
            created_at: format_primitive(sheet.created_at),
            updated_at: format_primitive(sheet.updated_at),
        }
    }
}
