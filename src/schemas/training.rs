use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::{GradingModel, TrainingConfig, TrainingMetrics, TrainingSession};
use crate::db::types::RunStatus;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TrainingStart {
    #[serde(default)]
    pub(crate) config: TrainingConfig,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ModelSeed {
    #[serde(alias = "artifactUrl")]
    #[validate(length(min = 1, max = 2048, message = "artifact_url must be 1-2048 characters"))]
    pub(crate) artifact_url: String,
    #[validate(range(min = 0.0, max = 1.0, message = "accuracy must be within [0, 1]"))]
    pub(crate) accuracy: f64,
}

#[derive(Debug, Serialize)]
pub(crate) struct TrainingSessionResponse {
    pub(crate) id: String,
    pub(crate) template_id: String,
    pub(crate) teacher_id: String,
    pub(crate) status: RunStatus,
    pub(crate) config: TrainingConfig,
    pub(crate) metrics: Option<TrainingMetrics>,
    pub(crate) error_message: Option<String>,
    pub(crate) model_id: Option<String>,
    pub(crate) created_at: String,
    pub(crate) started_at: Option<String>,
    pub(crate) completed_at: Option<String>,
}

impl From<TrainingSession> for TrainingSessionResponse {
    fn from(session: TrainingSession) -> Self {
        Self {
            id: session.id,
            template_id: session.template_id,
            teacher_id: session.teacher_id,
            status: session.status,
            config: session.config.0,
            metrics: session.metrics.map(|metrics| metrics.0),
            error_message: session.error_message,
            model_id: session.model_id,
            created_at: format_primitive(session.created_at),
            started_at: session.started_at.map(format_primitive),
            completed_at: session.completed_at.map(format_primitive),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ModelResponse {
    pub(crate) id: String,
    pub(crate) template_id: String,
    pub(crate) training_id: Option<String>,
    pub(crate) version: i32,
    pub(crate) artifact_url: String,
    pub(crate) accuracy: f64,
    pub(crate) is_active: bool,
    pub(crate) created_at: String,
    pub(crate) activated_at: Option<String>,
}

impl From<GradingModel> for ModelResponse {
    fn from(model: GradingModel) -> Self {
        Self {
            id: model.id,
            template_id: model.template_id,
            training_id: model.training_id,
            version: model.version,
            artifact_url: model.artifact_url,
            accuracy: model.accuracy,
            is_active: model.is_active,
            created_at: format_primitive(model.created_at),
            activated_at: model.activated_at.map(format_primitive),
        }
    }
}
