use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::core::config::Settings;
use crate::db::models::{TrainingConfig, TrainingMetrics};
use crate::db::types::Correctness;
use crate::services::oracle::{
    OracleError, OracleScore, ScoreRequest, ScoringOracle, TrainOutcome, TrainRequest,
    TrainingOracle,
};

const ARTIFACT_PREFIX: &str = "ml://models/";

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    model_id: &'a str,
    region_id: &'a str,
    text: &'a str,
    ocr_data: &'a Value,
    question_type: &'static str,
    expected_answer: Option<&'a str>,
    max_points: f64,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    predicted_correctness: String,
    confidence: f64,
    assigned_score: f64,
    #[serde(default)]
    explanation: String,
}

#[derive(Debug, Serialize)]
struct TrainingDataPoint<'a> {
    text: &'a str,
    question_type: &'static str,
    expected_answer: Option<&'a str>,
    label: &'static str,
    score: f64,
}

#[derive(Debug, Serialize)]
struct TrainPayload<'a> {
    model_id: &'a str,
    template_id: &'a str,
    training_data: Vec<TrainingDataPoint<'a>>,
    config: &'a TrainingConfig,
}

#[derive(Debug, Deserialize)]
struct TrainResponse {
    accuracy: f64,
    validation_accuracy: f64,
    #[serde(default)]
    confusion_matrix: Vec<Vec<i64>>,
    #[serde(default)]
    training_time_seconds: f64,
}

/// HTTP adapter for the ML service (`/predict`, `/train`, `/health`).
///
/// Calls are never retried here; a failed prediction fails the grading job
/// and a failed training call fails the session.
#[derive(Debug, Clone)]
pub(crate) struct MlServiceClient {
    client: Client,
    base_url: String,
    api_key: String,
    request_timeout: Duration,
    training_timeout: Duration,
}

impl MlServiceClient {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build ML service HTTP client")?;

        Ok(Self {
            client,
            base_url: settings.ml().base_url.trim_end_matches('/').to_string(),
            api_key: settings.ml().api_key.clone(),
            request_timeout: Duration::from_secs(settings.ml().request_timeout_seconds),
            training_timeout: Duration::from_secs(settings.ml().training_timeout_seconds),
        })
    }

    fn request(&self, builder: RequestBuilder, timeout: Duration) -> RequestBuilder {
        let builder = builder.timeout(timeout);
        if self.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.api_key)
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        timeout: Duration,
    ) -> Result<T, OracleError> {
        let response = self.request(builder, timeout).send().await.map_err(|err| {
            if err.is_timeout() {
                OracleError::Timeout(timeout.as_secs())
            } else {
                OracleError::Transport(err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Status { status: status.as_u16(), body });
        }

        response.json::<T>().await.map_err(|err| {
            if err.is_timeout() {
                OracleError::Timeout(timeout.as_secs())
            } else {
                OracleError::InvalidPayload(err.to_string())
            }
        })
    }
}

/// ML-side model id for an artifact reference; seeded artifacts that do not
/// follow the `ml://models/` scheme fall back to the local model id.
pub(crate) fn ml_model_id<'a>(artifact_url: &'a str, fallback: &'a str) -> &'a str {
    artifact_url.strip_prefix(ARTIFACT_PREFIX).filter(|id| !id.is_empty()).unwrap_or(fallback)
}

pub(crate) fn artifact_url(model_id: &str) -> String {
    format!("{ARTIFACT_PREFIX}{model_id}")
}

fn parse_correctness(value: &str) -> Result<Correctness, OracleError> {
    match value.trim().to_ascii_uppercase().as_str() {
        "CORRECT" => Ok(Correctness::Correct),
        "PARTIAL" => Ok(Correctness::Partial),
        "INCORRECT" => Ok(Correctness::Incorrect),
        "SKIPPED" => Ok(Correctness::Skipped),
        other => Err(OracleError::InvalidPayload(format!("unknown correctness {other:?}"))),
    }
}

fn correctness_label(value: Correctness) -> &'static str {
    match value {
        Correctness::Correct => "CORRECT",
        Correctness::Partial => "PARTIAL",
        Correctness::Incorrect => "INCORRECT",
        Correctness::Skipped => "SKIPPED",
    }
}

#[async_trait]
impl ScoringOracle for MlServiceClient {
    async fn score(&self, request: ScoreRequest<'_>) -> Result<OracleScore, OracleError> {
        let payload = PredictRequest {
            model_id: ml_model_id(&request.model.artifact_url, &request.model.id),
            region_id: &request.region.id,
            text: &request.extraction.text,
            ocr_data: &request.extraction.raw,
            question_type: request.region.question_type.wire_name(),
            expected_answer: request.region.expected_answer.as_deref(),
            max_points: request.region.points,
        };

        let url = format!("{}/predict", self.base_url);
        let response: PredictResponse =
            self.send_json(self.client.post(&url).json(&payload), self.request_timeout).await?;

        Ok(OracleScore {
            correctness: parse_correctness(&response.predicted_correctness)?,
            confidence: response.confidence,
            assigned_score: response.assigned_score,
            explanation: response.explanation,
        })
    }

    async fn health(&self) -> Result<(), OracleError> {
        let url = format!("{}/health", self.base_url);
        let _: Value = self.send_json(self.client.get(&url), self.request_timeout).await?;
        Ok(())
    }
}

#[async_trait]
impl TrainingOracle for MlServiceClient {
    async fn train(&self, request: TrainRequest<'_>) -> Result<TrainOutcome, OracleError> {
        let timer = Instant::now();
        let payload = TrainPayload {
            model_id: request.model_id,
            template_id: request.template_id,
            training_data: request
                .samples
                .iter()
                .map(|sample| TrainingDataPoint {
                    text: &sample.text,
                    question_type: sample.question_type.wire_name(),
                    expected_answer: sample.expected_answer.as_deref(),
                    label: correctness_label(sample.label),
                    score: sample.score,
                })
                .collect(),
            config: request.config,
        };

        tracing::info!(
            template_id = request.template_id,
            model_id = request.model_id,
            samples = request.samples.len(),
            "Sending training request"
        );

        let url = format!("{}/train", self.base_url);
        let response: TrainResponse =
            self.send_json(self.client.post(&url).json(&payload), self.training_timeout).await?;

        if !response.validation_accuracy.is_finite() || !response.accuracy.is_finite() {
            return Err(OracleError::InvalidPayload("non-finite accuracy".to_string()));
        }

        tracing::info!(
            template_id = request.template_id,
            model_id = request.model_id,
            accuracy = response.validation_accuracy,
            duration_seconds = timer.elapsed().as_secs_f64(),
            "Training completed"
        );

        Ok(TrainOutcome {
            artifact_url: artifact_url(request.model_id),
            accuracy: response.validation_accuracy,
            metrics: TrainingMetrics {
                accuracy: response.accuracy,
                validation_accuracy: response.validation_accuracy,
                confusion_matrix: response.confusion_matrix,
                training_time_seconds: response.training_time_seconds,
                sample_count: request.samples.len(),
            },
        })
    }
}
