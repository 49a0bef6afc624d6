use serde::{Deserialize, Serialize};

use crate::core::time::format_primitive;
use crate::db::models::{Annotation, Markup, QuestionLabel};
use crate::services::annotations::{AnnotationPatch, NewAnnotation};

#[derive(Debug, Deserialize)]
pub(crate) struct AnnotationCreate {
    pub(crate) markup: Markup,
    #[serde(default)]
    #[serde(alias = "isTrainingData")]
    pub(crate) is_training_data: bool,
    #[serde(default)]
    pub(crate) labels: Vec<QuestionLabel>,
}

impl From<AnnotationCreate> for NewAnnotation {
    fn from(payload: AnnotationCreate) -> Self {
        Self {
            markup: payload.markup,
            is_training_data: payload.is_training_data,
            labels: payload.labels,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct AnnotationUpdate {
    #[serde(default)]
    pub(crate) markup: Option<Markup>,
    #[serde(default)]
    #[serde(alias = "isTrainingData")]
    pub(crate) is_training_data: Option<bool>,
    #[serde(default)]
    pub(crate) labels: Option<Vec<QuestionLabel>>,
}

impl From<AnnotationUpdate> for AnnotationPatch {
    fn from(payload: AnnotationUpdate) -> Self {
        Self {
            markup: payload.markup,
            is_training_data: payload.is_training_data,
            labels: payload.labels,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct AnnotationResponse {
    pub(crate) id: String,
    pub(crate) sheet_id: String,
    pub(crate) teacher_id: String,
    pub(crate) markup: Markup,
    pub(crate) is_training_data: bool,
    pub(crate) labels: Vec<QuestionLabel>,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl From<Annotation> for AnnotationResponse {
    fn from(annotation: Annotation) -> Self {
        Self {
            id: annotation.id,
            sheet_id: annotation.sheet_id,
            teacher_id: annotation.teacher_id,
            markup: annotation.markup.0,
            is_training_data: annotation.is_training_data,
            labels: annotation.labels.0,
            created_at: format_primitive(annotation.created_at),
            updated_at: format_primitive(annotation.updated_at),
        }
    }
}
