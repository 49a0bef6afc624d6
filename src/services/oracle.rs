//! Seams to the external ML service.
//!
//! Grading and training talk to the model only through these traits; the
//! production adapter is [`crate::services::ml_client::MlServiceClient`].

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::db::models::{GradingModel, Region, Sheet, TrainingConfig, TrainingMetrics};
use crate::db::types::{Correctness, QuestionType};

#[derive(Debug, Clone, PartialEq, Error)]
pub(crate) enum OracleError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// What upstream extraction recorded for one region.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RegionExtraction {
    pub(crate) text: String,
    pub(crate) confidence: Option<f64>,
    pub(crate) raw: Value,
}

impl RegionExtraction {
    /// Reads `regions.{region_id}` out of a sheet's extracted data; a region
    /// the extractor skipped yields empty text.
    pub(crate) fn from_extracted(extracted: Option<&Value>, region_id: &str) -> Self {
        let raw = extracted
            .and_then(|data| data.get("regions"))
            .and_then(|regions| regions.get(region_id))
            .cloned()
            .unwrap_or(Value::Null);

        let text = match raw.get("text") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let confidence = raw.get("confidence").and_then(Value::as_f64);

        Self { text, confidence, raw }
    }
}

pub(crate) struct ScoreRequest<'a> {
    pub(crate) sheet: &'a Sheet,
    pub(crate) region: &'a Region,
    pub(crate) extraction: &'a RegionExtraction,
    pub(crate) model: &'a GradingModel,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OracleScore {
    pub(crate) correctness: Correctness,
    pub(crate) confidence: f64,
    pub(crate) assigned_score: f64,
    pub(crate) explanation: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TrainingSample {
    pub(crate) region_id: String,
    pub(crate) text: String,
    pub(crate) question_type: QuestionType,
    pub(crate) expected_answer: Option<String>,
    pub(crate) label: Correctness,
    pub(crate) score: f64,
}

pub(crate) struct TrainRequest<'a> {
    pub(crate) model_id: &'a str,
    pub(crate) template_id: &'a str,
    pub(crate) samples: &'a [TrainingSample],
    pub(crate) config: &'a TrainingConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TrainOutcome {
    pub(crate) artifact_url: String,
    pub(crate) accuracy: f64,
    pub(crate) metrics: TrainingMetrics,
}

#[async_trait]
pub(crate) trait ScoringOracle: Send + Sync {
    async fn score(&self, request: ScoreRequest<'_>) -> Result<OracleScore, OracleError>;

    async fn health(&self) -> Result<(), OracleError>;
}

#[async_trait]
pub(crate) trait TrainingOracle: Send + Sync {
    async fn train(&self, request: TrainRequest<'_>) -> Result<TrainOutcome, OracleError>;
}
