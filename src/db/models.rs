use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::{Correctness, QuestionType, RunStatus, SheetStatus};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Template {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) version: i32,
    pub(crate) pass_threshold: f64,
    pub(crate) created_by: String,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, FromRow)]
pub(crate) struct BoundingBox {
    pub(crate) x: f64,
    pub(crate) y: f64,
    pub(crate) width: f64,
    pub(crate) height: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Region {
    pub(crate) id: String,
    pub(crate) template_id: String,
    pub(crate) label: String,
    pub(crate) question_type: QuestionType,
    pub(crate) points: f64,
    #[sqlx(flatten)]
    pub(crate) bbox: BoundingBox,
    pub(crate) order_index: i32,
    pub(crate) expected_answer: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct TemplateWithRegions {
    #[serde(flatten)]
    pub(crate) template: Template,
    pub(crate) regions: Vec<Region>,
}

impl TemplateWithRegions {
    pub(crate) fn max_points(&self) -> f64 {
        self.regions.iter().map(|region| region.points).sum()
    }

    pub(crate) fn region(&self, region_id: &str) -> Option<&Region> {
        self.regions.iter().find(|region| region.id == region_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Sheet {
    pub(crate) id: String,
    pub(crate) template_id: String,
    pub(crate) student_id: Option<String>,
    pub(crate) original_url: String,
    pub(crate) status: SheetStatus,
    pub(crate) extracted_data: Option<Json<serde_json::Value>>,
    pub(crate) error_message: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct InkStroke {
    pub(crate) points: Vec<[f64; 2]>,
    #[serde(default)]
    pub(crate) color: Option<String>,
    #[serde(default)]
    pub(crate) width: Option<f64>,
}

/// Free-form teacher markup attached to an annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum Markup {
    Ink { strokes: Vec<InkStroke> },
    ReviewOverride { result_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct QuestionLabel {
    pub(crate) region_id: String,
    pub(crate) correctness: Correctness,
    pub(crate) score: f64,
    #[serde(default)]
    pub(crate) confidence: Option<f64>,
    #[serde(default)]
    pub(crate) comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Annotation {
    pub(crate) id: String,
    pub(crate) sheet_id: String,
    pub(crate) teacher_id: String,
    pub(crate) markup: Json<Markup>,
    pub(crate) is_training_data: bool,
    pub(crate) labels: Json<Vec<QuestionLabel>>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

/// A training-flagged annotation together with what its sheet extracted.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct TrainingAnnotation {
    pub(crate) annotation_id: String,
    pub(crate) sheet_id: String,
    pub(crate) labels: Json<Vec<QuestionLabel>>,
    pub(crate) extracted_data: Option<Json<serde_json::Value>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ModelType {
    #[default]
    RandomForest,
    GradientBoosting,
    NeuralNetwork,
}

fn default_validation_split() -> f64 {
    0.2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TrainingConfig {
    #[serde(default)]
    pub(crate) model_type: ModelType,
    #[serde(default = "default_validation_split")]
    pub(crate) validation_split: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) n_estimators: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) max_depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) learning_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) epochs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) hidden_layers: Option<Vec<u32>>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model_type: ModelType::default(),
            validation_split: default_validation_split(),
            n_estimators: None,
            max_depth: None,
            learning_rate: None,
            epochs: None,
            hidden_layers: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TrainingMetrics {
    pub(crate) accuracy: f64,
    pub(crate) validation_accuracy: f64,
    #[serde(default)]
    pub(crate) confusion_matrix: Vec<Vec<i64>>,
    pub(crate) training_time_seconds: f64,
    pub(crate) sample_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct TrainingSession {
    pub(crate) id: String,
    pub(crate) template_id: String,
    pub(crate) teacher_id: String,
    pub(crate) status: RunStatus,
    pub(crate) config: Json<TrainingConfig>,
    pub(crate) metrics: Option<Json<TrainingMetrics>>,
    pub(crate) error_message: Option<String>,
    pub(crate) model_id: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) started_at: Option<PrimitiveDateTime>,
    pub(crate) completed_at: Option<PrimitiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct GradingModel {
    pub(crate) id: String,
    pub(crate) template_id: String,
    pub(crate) training_id: Option<String>,
    pub(crate) version: i32,
    pub(crate) artifact_url: String,
    pub(crate) accuracy: f64,
    pub(crate) is_active: bool,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) activated_at: Option<PrimitiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct GradingJob {
    pub(crate) id: String,
    pub(crate) template_id: String,
    pub(crate) model_id: String,
    pub(crate) teacher_id: String,
    pub(crate) status: RunStatus,
    pub(crate) total_sheets: i32,
    pub(crate) processed_sheets: i32,
    pub(crate) error_message: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) started_at: Option<PrimitiveDateTime>,
    pub(crate) completed_at: Option<PrimitiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub(crate) struct GradingResult {
    pub(crate) id: String,
    pub(crate) job_id: String,
    pub(crate) sheet_id: String,
    pub(crate) region_id: String,
    pub(crate) predicted_correctness: Correctness,
    pub(crate) confidence: f64,
    pub(crate) assigned_score: f64,
    pub(crate) explanation: String,
    pub(crate) needs_review: bool,
    pub(crate) reviewed_at: Option<PrimitiveDateTime>,
    pub(crate) reviewed_by: Option<String>,
    pub(crate) teacher_override_score: Option<f64>,
    pub(crate) override_correctness: Option<Correctness>,
    pub(crate) review_comment: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
}

impl GradingResult {
    /// Correctness after review, falling back to the prediction.
    pub(crate) fn effective_correctness(&self) -> Correctness {
        self.override_correctness.unwrap_or(self.predicted_correctness)
    }
}

/// A committed result row joined with what reporting needs from its job and region.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct CommittedResult {
    pub(crate) job_id: String,
    pub(crate) sheet_id: String,
    pub(crate) region_id: String,
    pub(crate) correctness: Correctness,
    pub(crate) assigned_score: f64,
    pub(crate) job_created_at: PrimitiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markup_is_tagged_by_kind() {
        let markup: Markup = serde_json::from_value(serde_json::json!({
            "kind": "ink",
            "strokes": [{"points": [[1.0, 2.0], [3.0, 4.5]], "color": "#f00"}]
        }))
        .unwrap();

        match markup {
            Markup::Ink { strokes } => {
                assert_eq!(strokes.len(), 1);
                assert_eq!(strokes[0].points[1], [3.0, 4.5]);
                assert_eq!(strokes[0].width, None);
            }
            other => panic!("unexpected markup {other:?}"),
        }

        let value = serde_json::to_value(Markup::ReviewOverride { result_id: "r1".into() }).unwrap();
        assert_eq!(value, serde_json::json!({"kind": "review_override", "result_id": "r1"}));
    }

    #[test]
    fn training_config_defaults_match_ml_service() {
        let config: TrainingConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(config, TrainingConfig::default());
        assert_eq!(config.validation_split, 0.2);
        assert_eq!(config.model_type, ModelType::RandomForest);
    }
}
