//! Persistence boundary for the grading pipeline.
//!
//! Every method that changes more than one row is a single atomic unit in
//! both implementations: a Postgres transaction or one critical section over
//! the in-memory arena.

pub(crate) mod memory;
pub(crate) mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use time::PrimitiveDateTime;

use crate::db::models::{
    Annotation, CommittedResult, GradingJob, GradingModel, GradingResult, Region, Sheet, Template,
    TemplateWithRegions, TrainingAnnotation, TrainingMetrics, TrainingSession,
};
use crate::db::types::{Correctness, RunStatus, SheetStatus};

pub(crate) use memory::MemoryStore;
pub(crate) use postgres::PgGradingStore;

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.code().as_deref() {
                // lock_not_available
                Some("55P03") => return StoreError::Conflict("row lock timed out".to_string()),
                Some("23505") => {
                    return StoreError::Conflict(format!("duplicate row: {}", db_err.message()))
                }
                _ => {}
            }
        }
        StoreError::Database(err)
    }
}

/// Result row plus the context review needs to validate an action.
#[derive(Debug, Clone)]
pub(crate) struct ResultContext {
    pub(crate) result: GradingResult,
    pub(crate) job_status: RunStatus,
    pub(crate) template_id: String,
    pub(crate) region_points: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct OverrideUpdate {
    pub(crate) score: f64,
    pub(crate) correctness: Correctness,
    pub(crate) comment: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct ReviewUpdate {
    pub(crate) reviewed_by: String,
    pub(crate) reviewed_at: PrimitiveDateTime,
    /// `None` accepts the prediction; an already reviewed result keeps its `reviewed_at`.
    pub(crate) override_with: Option<OverrideUpdate>,
}

#[async_trait]
pub(crate) trait GradingStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn insert_template(&self, template: &TemplateWithRegions) -> Result<(), StoreError>;
    async fn find_template(&self, id: &str) -> Result<Option<TemplateWithRegions>, StoreError>;
    async fn list_templates(&self) -> Result<Vec<Template>, StoreError>;
    async fn latest_template_version(&self, name: &str) -> Result<i32, StoreError>;
    /// `true` once a result references the template or a grading job that has not failed targets it.
    async fn template_has_results(&self, id: &str) -> Result<bool, StoreError>;
    /// Swaps the region layout in place; `Conflict` once `template_has_results` holds.
    async fn replace_regions(
        &self,
        template_id: &str,
        regions: &[Region],
        now: PrimitiveDateTime,
    ) -> Result<TemplateWithRegions, StoreError>;
    async fn delete_template(&self, id: &str) -> Result<bool, StoreError>;

    async fn insert_sheet(&self, sheet: &Sheet) -> Result<(), StoreError>;
    async fn find_sheet(&self, id: &str) -> Result<Option<Sheet>, StoreError>;
    async fn find_sheets(&self, ids: &[String]) -> Result<Vec<Sheet>, StoreError>;
    async fn list_sheets(
        &self,
        template_id: &str,
        status: Option<SheetStatus>,
    ) -> Result<Vec<Sheet>, StoreError>;
    /// `uploaded|error -> processed`; `Conflict` when data is already recorded.
    async fn record_extraction(
        &self,
        sheet_id: &str,
        extracted_data: &serde_json::Value,
        now: PrimitiveDateTime,
    ) -> Result<Sheet, StoreError>;
    async fn mark_sheet_error(
        &self,
        sheet_id: &str,
        reason: &str,
        now: PrimitiveDateTime,
    ) -> Result<Sheet, StoreError>;

    /// Inserts the annotation and advances a `processed` sheet to `annotated`.
    async fn insert_annotation(&self, annotation: &Annotation) -> Result<(), StoreError>;
    async fn find_annotation(&self, id: &str) -> Result<Option<Annotation>, StoreError>;
    async fn update_annotation(&self, annotation: &Annotation) -> Result<Annotation, StoreError>;
    async fn delete_annotation(&self, id: &str) -> Result<bool, StoreError>;
    async fn list_annotations(&self, sheet_id: &str) -> Result<Vec<Annotation>, StoreError>;
    async fn count_training_annotations(&self, template_id: &str) -> Result<i64, StoreError>;
    async fn list_training_annotations(
        &self,
        template_id: &str,
    ) -> Result<Vec<TrainingAnnotation>, StoreError>;

    async fn insert_training_session(&self, session: &TrainingSession) -> Result<(), StoreError>;
    async fn find_training_session(&self, id: &str)
        -> Result<Option<TrainingSession>, StoreError>;
    async fn list_training_sessions(
        &self,
        template_id: &str,
    ) -> Result<Vec<TrainingSession>, StoreError>;
    async fn claim_next_training_session(
        &self,
        now: PrimitiveDateTime,
    ) -> Result<Option<TrainingSession>, StoreError>;
    /// Creates the model (version = max + 1) and completes the session atomically.
    /// `Conflict` if the session is no longer running.
    async fn complete_training(
        &self,
        session_id: &str,
        metrics: &TrainingMetrics,
        model: &GradingModel,
        now: PrimitiveDateTime,
    ) -> Result<GradingModel, StoreError>;
    /// Returns `false` when the session was already terminal.
    async fn fail_training(
        &self,
        session_id: &str,
        message: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError>;

    /// Inserts an inactive model with the next version for its template.
    async fn insert_model(&self, model: &GradingModel) -> Result<GradingModel, StoreError>;
    async fn find_model(&self, id: &str) -> Result<Option<GradingModel>, StoreError>;
    async fn list_models(&self, template_id: &str) -> Result<Vec<GradingModel>, StoreError>;
    async fn find_active_model(
        &self,
        template_id: &str,
    ) -> Result<Option<GradingModel>, StoreError>;
    async fn activate_model(
        &self,
        model_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<GradingModel, StoreError>;
    async fn deactivate_model(&self, model_id: &str) -> Result<GradingModel, StoreError>;

    async fn insert_grading_job(
        &self,
        job: &GradingJob,
        sheet_ids: &[String],
    ) -> Result<(), StoreError>;
    async fn find_grading_job(&self, id: &str) -> Result<Option<GradingJob>, StoreError>;
    async fn list_grading_jobs(&self, template_id: &str) -> Result<Vec<GradingJob>, StoreError>;
    async fn list_job_sheet_ids(&self, job_id: &str) -> Result<Vec<String>, StoreError>;
    async fn claim_next_grading_job(
        &self,
        now: PrimitiveDateTime,
    ) -> Result<Option<GradingJob>, StoreError>;
    /// Inserts one sheet's results and bumps `processed_sheets`; returns the new count.
    async fn commit_sheet_results(
        &self,
        job_id: &str,
        results: &[GradingResult],
    ) -> Result<i32, StoreError>;
    /// Completes a running job and marks its sheets graded.
    async fn complete_grading_job(
        &self,
        job_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<GradingJob, StoreError>;
    async fn fail_grading_job(
        &self,
        job_id: &str,
        message: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError>;

    async fn find_result(&self, id: &str) -> Result<Option<ResultContext>, StoreError>;
    async fn list_results(
        &self,
        job_id: &str,
        needs_review: Option<bool>,
    ) -> Result<Vec<GradingResult>, StoreError>;
    async fn list_review_queue(&self, template_id: &str)
        -> Result<Vec<GradingResult>, StoreError>;
    async fn apply_review(
        &self,
        result_id: &str,
        update: &ReviewUpdate,
    ) -> Result<GradingResult, StoreError>;
    /// Results of completed jobs for the template, with the job's creation time.
    async fn list_committed_results(
        &self,
        template_id: &str,
    ) -> Result<Vec<CommittedResult>, StoreError>;

    async fn fail_stale_training(
        &self,
        cutoff: PrimitiveDateTime,
        message: &str,
        now: PrimitiveDateTime,
    ) -> Result<u64, StoreError>;
    async fn fail_stale_grading(
        &self,
        cutoff: PrimitiveDateTime,
        message: &str,
        now: PrimitiveDateTime,
    ) -> Result<u64, StoreError>;
}
