use async_trait::async_trait;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use super::{GradingStore, ResultContext, ReviewUpdate, StoreError};
use crate::db::models::{
    Annotation, CommittedResult, GradingJob, GradingModel, GradingResult, Region, Sheet, Template,
    TemplateWithRegions, TrainingAnnotation, TrainingMetrics, TrainingSession,
};
use crate::db::types::SheetStatus;
use crate::repositories;

const LOCK_TIMEOUT: &str = "SET LOCAL lock_timeout = '5s'";

#[derive(Clone)]
pub(crate) struct PgGradingStore {
    pool: PgPool,
}

impl PgGradingStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GradingStore for PgGradingStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_template(&self, template: &TemplateWithRegions) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        repositories::templates::insert(&mut *tx, &template.template).await?;
        repositories::templates::insert_regions(&mut tx, &template.regions).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_template(&self, id: &str) -> Result<Option<TemplateWithRegions>, StoreError> {
        let Some(template) = repositories::templates::find(&self.pool, id).await? else {
            return Ok(None);
        };
        let regions = repositories::templates::list_regions(&self.pool, id).await?;
        Ok(Some(TemplateWithRegions { template, regions }))
    }

    async fn list_templates(&self) -> Result<Vec<Template>, StoreError> {
        Ok(repositories::templates::list(&self.pool).await?)
    }

    async fn latest_template_version(&self, name: &str) -> Result<i32, StoreError> {
        Ok(repositories::templates::latest_version(&self.pool, name).await?)
    }

    async fn template_has_results(&self, id: &str) -> Result<bool, StoreError> {
        Ok(repositories::templates::has_results(&self.pool, id).await?)
    }

    async fn replace_regions(
        &self,
        template_id: &str,
        regions: &[Region],
        now: PrimitiveDateTime,
    ) -> Result<TemplateWithRegions, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(LOCK_TIMEOUT).execute(&mut *tx).await?;

        if repositories::templates::lock(&mut *tx, template_id).await?.is_none() {
            return Err(StoreError::NotFound("template"));
        }
        if repositories::templates::has_results(&mut *tx, template_id).await? {
            return Err(StoreError::Conflict("template is graded or has a grading job in flight".to_string()));
        }

        repositories::templates::delete_regions(&mut *tx, template_id).await?;
        repositories::templates::insert_regions(&mut tx, regions).await?;
        let template = repositories::templates::touch(&mut *tx, template_id, now)
            .await?
            .ok_or(StoreError::NotFound("template"))?;
        let regions = repositories::templates::list_regions(&mut *tx, template_id).await?;

        tx.commit().await?;
        Ok(TemplateWithRegions { template, regions })
    }

    async fn delete_template(&self, id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let deleted = repositories::templates::delete_cascade(&mut tx, id).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn insert_sheet(&self, sheet: &Sheet) -> Result<(), StoreError> {
        Ok(repositories::sheets::insert(&self.pool, sheet).await?)
    }

    async fn find_sheet(&self, id: &str) -> Result<Option<Sheet>, StoreError> {
        Ok(repositories::sheets::find(&self.pool, id).await?)
    }

    async fn find_sheets(&self, ids: &[String]) -> Result<Vec<Sheet>, StoreError> {
        Ok(repositories::sheets::find_many(&self.pool, ids).await?)
    }

    async fn list_sheets(
        &self,
        template_id: &str,
        status: Option<SheetStatus>,
    ) -> Result<Vec<Sheet>, StoreError> {
        Ok(repositories::sheets::list(&self.pool, template_id, status).await?)
    }

    async fn record_extraction(
        &self,
        sheet_id: &str,
        extracted_data: &serde_json::Value,
        now: PrimitiveDateTime,
    ) -> Result<Sheet, StoreError> {
        if let Some(sheet) =
            repositories::sheets::record_extraction(&self.pool, sheet_id, extracted_data, now)
                .await?
        {
            return Ok(sheet);
        }

        match repositories::sheets::find(&self.pool, sheet_id).await? {
            Some(sheet) => Err(StoreError::Conflict(format!(
                "sheet is {} and cannot accept extracted data",
                sheet.status.as_str()
            ))),
            None => Err(StoreError::NotFound("sheet")),
        }
    }

    async fn mark_sheet_error(
        &self,
        sheet_id: &str,
        reason: &str,
        now: PrimitiveDateTime,
    ) -> Result<Sheet, StoreError> {
        if let Some(sheet) =
            repositories::sheets::mark_error(&self.pool, sheet_id, reason, now).await?
        {
            return Ok(sheet);
        }

        match repositories::sheets::find(&self.pool, sheet_id).await? {
            Some(sheet) => Err(StoreError::Conflict(format!(
                "sheet is {} and cannot move to error",
                sheet.status.as_str()
            ))),
            None => Err(StoreError::NotFound("sheet")),
        }
    }

    async fn insert_annotation(&self, annotation: &Annotation) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        repositories::annotations::insert(&mut *tx, annotation).await?;
        repositories::sheets::mark_annotated(&mut *tx, &annotation.sheet_id, annotation.created_at)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_annotation(&self, id: &str) -> Result<Option<Annotation>, StoreError> {
        Ok(repositories::annotations::find(&self.pool, id).await?)
    }

    async fn update_annotation(&self, annotation: &Annotation) -> Result<Annotation, StoreError> {
        repositories::annotations::update(&self.pool, annotation)
            .await?
            .ok_or(StoreError::NotFound("annotation"))
    }

    async fn delete_annotation(&self, id: &str) -> Result<bool, StoreError> {
        Ok(repositories::annotations::delete(&self.pool, id).await?)
    }

    async fn list_annotations(&self, sheet_id: &str) -> Result<Vec<Annotation>, StoreError> {
        Ok(repositories::annotations::list_for_sheet(&self.pool, sheet_id).await?)
    }

    async fn count_training_annotations(&self, template_id: &str) -> Result<i64, StoreError> {
        Ok(repositories::annotations::count_training(&self.pool, template_id).await?)
    }

    async fn list_training_annotations(
        &self,
        template_id: &str,
    ) -> Result<Vec<TrainingAnnotation>, StoreError> {
        Ok(repositories::annotations::list_training(&self.pool, template_id).await?)
    }

    async fn insert_training_session(&self, session: &TrainingSession) -> Result<(), StoreError> {
        Ok(repositories::training_sessions::insert(&self.pool, session).await?)
    }

    async fn find_training_session(
        &self,
        id: &str,
    ) -> Result<Option<TrainingSession>, StoreError> {
        Ok(repositories::training_sessions::find(&self.pool, id).await?)
    }

    async fn list_training_sessions(
        &self,
        template_id: &str,
    ) -> Result<Vec<TrainingSession>, StoreError> {
        Ok(repositories::training_sessions::list_for_template(&self.pool, template_id).await?)
    }

    async fn claim_next_training_session(
        &self,
        now: PrimitiveDateTime,
    ) -> Result<Option<TrainingSession>, StoreError> {
        Ok(repositories::training_sessions::claim_next(&self.pool, now).await?)
    }

    async fn complete_training(
        &self,
        session_id: &str,
        metrics: &TrainingMetrics,
        model: &GradingModel,
        now: PrimitiveDateTime,
    ) -> Result<GradingModel, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(LOCK_TIMEOUT).execute(&mut *tx).await?;

        // Serializes version allocation with concurrent seeds for the same template.
        if repositories::templates::lock(&mut *tx, &model.template_id).await?.is_none() {
            return Err(StoreError::NotFound("template"));
        }

        let created = repositories::models::insert_next_version(&mut *tx, model).await?;
        let completed =
            repositories::training_sessions::complete(&mut *tx, session_id, metrics, &created.id, now)
                .await?;
        if completed.is_none() {
            return Err(StoreError::Conflict("training session is no longer running".to_string()));
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn fail_training(
        &self,
        session_id: &str,
        message: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        Ok(repositories::training_sessions::fail(&self.pool, session_id, message, now).await?)
    }

    async fn insert_model(&self, model: &GradingModel) -> Result<GradingModel, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(LOCK_TIMEOUT).execute(&mut *tx).await?;
        if repositories::templates::lock(&mut *tx, &model.template_id).await?.is_none() {
            return Err(StoreError::NotFound("template"));
        }
        let created = repositories::models::insert_next_version(&mut *tx, model).await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn find_model(&self, id: &str) -> Result<Option<GradingModel>, StoreError> {
        Ok(repositories::models::find(&self.pool, id).await?)
    }

    async fn list_models(&self, template_id: &str) -> Result<Vec<GradingModel>, StoreError> {
        Ok(repositories::models::list_for_template(&self.pool, template_id).await?)
    }

    async fn find_active_model(
        &self,
        template_id: &str,
    ) -> Result<Option<GradingModel>, StoreError> {
        Ok(repositories::models::find_active(&self.pool, template_id).await?)
    }

    async fn activate_model(
        &self,
        model_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<GradingModel, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(LOCK_TIMEOUT).execute(&mut *tx).await?;

        let model = repositories::models::find(&mut *tx, model_id)
            .await?
            .ok_or(StoreError::NotFound("model"))?;
        if repositories::templates::lock(&mut *tx, &model.template_id).await?.is_none() {
            return Err(StoreError::NotFound("template"));
        }

        repositories::models::deactivate_others(&mut *tx, &model.template_id, model_id).await?;
        let activated = repositories::models::set_active(&mut *tx, model_id, true, Some(now))
            .await?
            .ok_or(StoreError::NotFound("model"))?;

        tx.commit().await?;
        Ok(activated)
    }

    async fn deactivate_model(&self, model_id: &str) -> Result<GradingModel, StoreError> {
        repositories::models::set_active(&self.pool, model_id, false, None)
            .await?
            .ok_or(StoreError::NotFound("model"))
    }

    async fn insert_grading_job(
        &self,
        job: &GradingJob,
        sheet_ids: &[String],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(LOCK_TIMEOUT).execute(&mut *tx).await?;
        if repositories::templates::lock(&mut *tx, &job.template_id).await?.is_none() {
            return Err(StoreError::NotFound("template"));
        }
        repositories::grading_jobs::insert(&mut tx, job, sheet_ids).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_grading_job(&self, id: &str) -> Result<Option<GradingJob>, StoreError> {
        Ok(repositories::grading_jobs::find(&self.pool, id).await?)
    }

    async fn list_grading_jobs(&self, template_id: &str) -> Result<Vec<GradingJob>, StoreError> {
        Ok(repositories::grading_jobs::list_for_template(&self.pool, template_id).await?)
    }

    async fn list_job_sheet_ids(&self, job_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(repositories::grading_jobs::list_sheet_ids(&self.pool, job_id).await?)
    }

    async fn claim_next_grading_job(
        &self,
        now: PrimitiveDateTime,
    ) -> Result<Option<GradingJob>, StoreError> {
        Ok(repositories::grading_jobs::claim_next(&self.pool, now).await?)
    }

    async fn commit_sheet_results(
        &self,
        job_id: &str,
        results: &[GradingResult],
    ) -> Result<i32, StoreError> {
        let mut tx = self.pool.begin().await?;
        let processed = repositories::grading_jobs::increment_processed(&mut *tx, job_id)
            .await?
            .ok_or_else(|| StoreError::Conflict("grading job is no longer running".to_string()))?;
        repositories::grading_results::insert_many(&mut tx, results).await?;
        tx.commit().await?;
        Ok(processed)
    }

    async fn complete_grading_job(
        &self,
        job_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<GradingJob, StoreError> {
        let mut tx = self.pool.begin().await?;
        let job = repositories::grading_jobs::complete(&mut *tx, job_id, now)
            .await?
            .ok_or_else(|| StoreError::Conflict("grading job is no longer running".to_string()))?;
        repositories::sheets::mark_job_sheets_graded(&mut *tx, job_id, now).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn fail_grading_job(
        &self,
        job_id: &str,
        message: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        Ok(repositories::grading_jobs::fail(&self.pool, job_id, message, now).await?)
    }

    async fn find_result(&self, id: &str) -> Result<Option<ResultContext>, StoreError> {
        Ok(repositories::grading_results::find_with_context(&self.pool, id).await?.map(|row| {
            ResultContext {
                result: row.result,
                job_status: row.job_status,
                template_id: row.template_id,
                region_points: row.region_points,
            }
        }))
    }

    async fn list_results(
        &self,
        job_id: &str,
        needs_review: Option<bool>,
    ) -> Result<Vec<GradingResult>, StoreError> {
        Ok(repositories::grading_results::list_for_job(&self.pool, job_id, needs_review).await?)
    }

    async fn list_review_queue(
        &self,
        template_id: &str,
    ) -> Result<Vec<GradingResult>, StoreError> {
        Ok(repositories::grading_results::list_review_queue(&self.pool, template_id).await?)
    }

    async fn apply_review(
        &self,
        result_id: &str,
        update: &ReviewUpdate,
    ) -> Result<GradingResult, StoreError> {
        let updated = match &update.override_with {
            None => {
                repositories::grading_results::accept(
                    &self.pool,
                    result_id,
                    &update.reviewed_by,
                    update.reviewed_at,
                )
                .await?
            }
            Some(change) => {
                repositories::grading_results::apply_override(
                    &self.pool,
                    result_id,
                    &update.reviewed_by,
                    update.reviewed_at,
                    change.score,
                    change.correctness,
                    change.comment.as_deref(),
                )
                .await?
            }
        };
        updated.ok_or(StoreError::NotFound("result"))
    }

    async fn list_committed_results(
        &self,
        template_id: &str,
    ) -> Result<Vec<CommittedResult>, StoreError> {
        Ok(repositories::grading_results::list_committed(&self.pool, template_id).await?)
    }

    async fn fail_stale_training(
        &self,
        cutoff: PrimitiveDateTime,
        message: &str,
        now: PrimitiveDateTime,
    ) -> Result<u64, StoreError> {
        Ok(repositories::training_sessions::fail_stale(&self.pool, cutoff, message, now).await?)
    }

    async fn fail_stale_grading(
        &self,
        cutoff: PrimitiveDateTime,
        message: &str,
        now: PrimitiveDateTime,
    ) -> Result<u64, StoreError> {
        Ok(repositories::grading_jobs::fail_stale(&self.pool, cutoff, message, now).await?)
    }
}
