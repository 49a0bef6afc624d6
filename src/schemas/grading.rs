use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::{GradingJob, GradingResult};
use crate::db::types::{Correctness, RunStatus};
use crate::services::review::ReviewAction;

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct GradingStart {
    #[serde(alias = "sheetIds")]
    #[validate(length(min = 1, max = 1000, message = "sheet_ids must list 1-1000 sheets"))]
    pub(crate) sheet_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResultsQuery {
    #[serde(default)]
    pub(crate) needs_review: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub(crate) enum ReviewPayload {
    Accept,
    Override {
        score: f64,
        correctness: Correctness,
        #[serde(default)]
        comment: Option<String>,
    },
}

impl From<ReviewPayload> for ReviewAction {
    fn from(payload: ReviewPayload) -> Self {
        match payload {
            ReviewPayload::Accept => ReviewAction::Accept,
            ReviewPayload::Override { score, correctness, comment } => {
                ReviewAction::Override { score, correctness, comment }
            }
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct BulkReviewPayload {
    #[serde(alias = "resultIds")]
    #[validate(length(min = 1, max = 1000, message = "result_ids must list 1-1000 results"))]
    pub(crate) result_ids: Vec<String>,
    #[serde(flatten)]
    pub(crate) action: ReviewPayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReportQuery {
    #[serde(default)]
    pub(crate) refresh: bool,
    #[serde(default)]
    pub(crate) buckets: Option<usize>,
}

#[derive(Debug, Serialize)]
pub(crate) struct GradingJobResponse {
    pub(crate) id: String,
    pub(crate) template_id: String,
    pub(crate) model_id: String,
    pub(crate) teacher_id: String,
    pub(crate) status: RunStatus,
    pub(crate) total_sheets: i32,
    pub(crate) processed_sheets: i32,
    pub(crate) error_message: Option<String>,
    pub(crate) created_at: String,
    pub(crate) started_at: Option<String>,
    pub(crate) completed_at: Option<String>,
}

impl From<GradingJob> for GradingJobResponse {
    fn from(job: GradingJob) -> Self {
        Self {
            id: job.id,
            template_id: job.template_id,
            model_id: job.model_id,
            teacher_id: job.teacher_id,
            status: job.status,
            total_sheets: job.total_sheets,
            processed_sheets: job.processed_sheets,
            error_message: job.error_message,
            created_at: format_primitive(job.created_at),
            started_at: job.started_at.map(format_primitive),
            completed_at: job.completed_at.map(format_primitive),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct GradingResultResponse {
    pub(crate) id: String,
    pub(crate) job_id: String,
    pub(crate) sheet_id: String,
    pub(crate) region_id: String,
    pub(crate) predicted_correctness: Correctness,
    pub(crate) effective_correctness: Correctness,
    pub(crate) confidence: f64,
    pub(crate) assigned_score: f64,
    pub(crate) explanation: String,
    pub(crate) needs_review: bool,
    pub(crate) reviewed_at: Option<String>,
    pub(crate) reviewed_by: Option<String>,
    pub(crate) teacher_override_score: Option<f64>,
    pub(crate) override_correctness: Option<Correctness>,
    pub(crate) review_comment: Option<String>,
    pub(crate) created_at: String,
}

impl From<GradingResult> for GradingResultResponse {
    fn from(result: GradingResult) -> Self {
        let effective_correctness = result.effective_correctness();
        Self {
            id: result.id,
            job_id: result.job_id,
            sheet_id: result.sheet_id,
            region_id: result.region_id,
            predicted_correctness: result.predicted_correctness,
            effective_correctness,
            confidence: result.confidence,
            assigned_score: result.assigned_score,
            explanation: result.explanation,
            needs_review: result.needs_review,
            reviewed_at: result.reviewed_at.map(format_primitive),
            reviewed_by: result.reviewed_by,
            teacher_override_score: result.teacher_override_score,
            override_correctness: result.override_correctness,
            review_comment: result.review_comment,
            created_at: format_primitive(result.created_at),
        }
    }
}
