use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::types::Json;
use time::PrimitiveDateTime;
use tokio::sync::Mutex;

use super::{GradingStore, ResultContext, ReviewUpdate, StoreError};
use crate::db::models::{
    Annotation, CommittedResult, GradingJob, GradingModel, GradingResult, Region, Sheet, Template,
    TemplateWithRegions, TrainingAnnotation, TrainingMetrics, TrainingSession,
};
use crate::db::types::{RunStatus, SheetStatus};

/// In-process arena keyed by id. Children point at their parent through the
/// same foreign keys the relational schema uses; one lock guards the whole
/// arena so every trait method is atomic.
#[derive(Default)]
pub(crate) struct MemoryStore {
    arena: Mutex<Arena>,
}

#[derive(Default)]
struct Arena {
    templates: HashMap<String, Template>,
    regions: HashMap<String, Region>,
    sheets: HashMap<String, Sheet>,
    annotations: HashMap<String, Annotation>,
    sessions: HashMap<String, TrainingSession>,
    models: HashMap<String, GradingModel>,
    jobs: HashMap<String, GradingJob>,
    job_sheets: HashMap<String, Vec<String>>,
    results: HashMap<String, GradingResult>,
}

impl Arena {
    fn template_with_regions(&self, id: &str) -> Option<TemplateWithRegions> {
        let template = self.templates.get(id)?.clone();
        let mut regions: Vec<Region> =
            self.regions.values().filter(|region| region.template_id == id).cloned().collect();
        regions.sort_by(|a, b| a.order_index.cmp(&b.order_index).then(a.label.cmp(&b.label)));
        Some(TemplateWithRegions { template, regions })
    }

    /// A template is graded once any job that has not failed targets it.
    fn template_has_results(&self, template_id: &str) -> bool {
        let has_live_job = self
            .jobs
            .values()
            .any(|job| job.template_id == template_id && job.status != RunStatus::Failed);
        has_live_job
            || self.results.values().any(|result| {
                self.regions
                    .get(&result.region_id)
                    .is_some_and(|region| region.template_id == template_id)
            })
    }

    fn sheet_template(&self, sheet_id: &str) -> Option<&str> {
        self.sheets.get(sheet_id).map(|sheet| sheet.template_id.as_str())
    }

    fn check_region_labels(&self, regions: &[Region]) -> Result<(), StoreError> {
        let mut seen = std::collections::HashSet::new();
        for region in regions {
            if !seen.insert((region.template_id.as_str(), region.label.as_str())) {
                return Err(StoreError::Conflict(format!("duplicate region label {}", region.label)));
            }
        }
        Ok(())
    }

    fn next_model_version(&self, template_id: &str) -> i32 {
        self.models
            .values()
            .filter(|model| model.template_id == template_id)
            .map(|model| model.version)
            .max()
            .unwrap_or(0)
            + 1
    }

    fn insert_model(&mut self, model: &GradingModel) -> Result<GradingModel, StoreError> {
        if !self.templates.contains_key(&model.template_id) {
            return Err(StoreError::NotFound("template"));
        }
        if self.models.contains_key(&model.id) {
            return Err(StoreError::Conflict(format!("model {} already exists", model.id)));
        }
        let mut created = model.clone();
        created.version = self.next_model_version(&model.template_id);
        created.is_active = false;
        created.activated_at = None;
        self.models.insert(created.id.clone(), created.clone());
        Ok(created)
    }
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

fn sorted<T, K: Ord>(mut items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    items.sort_by_key(|item| key(item));
    items
}

fn is_open(status: RunStatus) -> bool {
    matches!(status, RunStatus::Pending | RunStatus::Running)
}

#[async_trait]
impl GradingStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_template(&self, template: &TemplateWithRegions) -> Result<(), StoreError> {
        let mut arena = self.arena.lock().await;
        let header = &template.template;
        if arena.templates.contains_key(&header.id)
            || arena
                .templates
                .values()
                .any(|existing| existing.name == header.name && existing.version == header.version)
        {
            return Err(StoreError::Conflict(format!(
                "template {} v{} already exists",
                header.name, header.version
            )));
        }
        arena.check_region_labels(&template.regions)?;

        arena.templates.insert(header.id.clone(), header.clone());
        for region in &template.regions {
            arena.regions.insert(region.id.clone(), region.clone());
        }
        Ok(())
    }

    async fn find_template(&self, id: &str) -> Result<Option<TemplateWithRegions>, StoreError> {
        Ok(self.arena.lock().await.template_with_regions(id))
    }

    async fn list_templates(&self) -> Result<Vec<Template>, StoreError> {
        let arena = self.arena.lock().await;
        Ok(sorted(arena.templates.values().cloned().collect(), |template| {
            (template.name.clone(), template.version)
        }))
    }

    async fn latest_template_version(&self, name: &str) -> Result<i32, StoreError> {
        let arena = self.arena.lock().await;
        Ok(arena
            .templates
            .values()
            .filter(|template| template.name == name)
            .map(|template| template.version)
            .max()
            .unwrap_or(0))
    }

    async fn template_has_results(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.arena.lock().await.template_has_results(id))
    }

    async fn replace_regions(
        &self,
        template_id: &str,
        regions: &[Region],
        now: PrimitiveDateTime,
    ) -> Result<TemplateWithRegions, StoreError> {
        let mut arena = self.arena.lock().await;
        if !arena.templates.contains_key(template_id) {
            return Err(StoreError::NotFound("template"));
        }
        if arena.template_has_results(template_id) {
            return Err(StoreError::Conflict("template is graded or has a grading job in flight".to_string()));
        }
        arena.check_region_labels(regions)?;

        arena.regions.retain(|_, region| region.template_id != template_id);
        for region in regions {
            arena.regions.insert(region.id.clone(), region.clone());
        }
        if let Some(template) = arena.templates.get_mut(template_id) {
            template.updated_at = now;
        }

        arena.template_with_regions(template_id).ok_or(StoreError::NotFound("template"))
    }

    async fn delete_template(&self, id: &str) -> Result<bool, StoreError> {
        let mut arena = self.arena.lock().await;
        if arena.templates.remove(id).is_none() {
            return Ok(false);
        }

        let job_ids: Vec<String> =
            arena.jobs.values().filter(|job| job.template_id == id).map(|job| job.id.clone()).collect();
        let sheet_ids: Vec<String> = arena
            .sheets
            .values()
            .filter(|sheet| sheet.template_id == id)
            .map(|sheet| sheet.id.clone())
            .collect();

        arena.results.retain(|_, result| !job_ids.contains(&result.job_id));
        for job_id in &job_ids {
            arena.job_sheets.remove(job_id);
            arena.jobs.remove(job_id);
        }
        arena.models.retain(|_, model| model.template_id != id);
        arena.sessions.retain(|_, session| session.template_id != id);
        arena.annotations.retain(|_, annotation| !sheet_ids.contains(&annotation.sheet_id));
        arena.sheets.retain(|_, sheet| sheet.template_id != id);
        arena.regions.retain(|_, region| region.template_id != id);
        Ok(true)
    }

    async fn insert_sheet(&self, sheet: &Sheet) -> Result<(), StoreError> {
        let mut arena = self.arena.lock().await;
        if !arena.templates.contains_key(&sheet.template_id) {
            return Err(StoreError::NotFound("template"));
        }
        arena.sheets.insert(sheet.id.clone(), sheet.clone());
        Ok(())
    }

    async fn find_sheet(&self, id: &str) -> Result<Option<Sheet>, StoreError> {
        Ok(self.arena.lock().await.sheets.get(id).cloned())
    }

    async fn find_sheets(&self, ids: &[String]) -> Result<Vec<Sheet>, StoreError> {
        let arena = self.arena.lock().await;
        Ok(ids.iter().filter_map(|id| arena.sheets.get(id).cloned()).collect())
    }

    async fn list_sheets(
        &self,
        template_id: &str,
        status: Option<SheetStatus>,
    ) -> Result<Vec<Sheet>, StoreError> {
        let arena = self.arena.lock().await;
        let sheets = arena
            .sheets
            .values()
            .filter(|sheet| sheet.template_id == template_id)
            .filter(|sheet| status.map_or(true, |wanted| sheet.status == wanted))
            .cloned()
            .collect();
        Ok(sorted(sheets, |sheet| (sheet.created_at, sheet.id.clone())))
    }

    async fn record_extraction(
        &self,
        sheet_id: &str,
        extracted_data: &serde_json::Value,
        now: PrimitiveDateTime,
    ) -> Result<Sheet, StoreError> {
        let mut arena = self.arena.lock().await;
        let sheet = arena.sheets.get_mut(sheet_id).ok_or(StoreError::NotFound("sheet"))?;
        if sheet.extracted_data.is_some()
            || !matches!(sheet.status, SheetStatus::Uploaded | SheetStatus::Error)
        {
            return Err(StoreError::Conflict(format!(
                "sheet is {} and cannot accept extracted data",
                sheet.status.as_str()
            )));
        }

        sheet.status = SheetStatus::Processed;
        sheet.extracted_data = Some(Json(extracted_data.clone()));
        sheet.error_message = None;
        sheet.updated_at = now;
        Ok(sheet.clone())
    }

    async fn mark_sheet_error(
        &self,
        sheet_id: &str,
        reason: &str,
        now: PrimitiveDateTime,
    ) -> Result<Sheet, StoreError> {
        let mut arena = self.arena.lock().await;
        let sheet = arena.sheets.get_mut(sheet_id).ok_or(StoreError::NotFound("sheet"))?;
        if sheet.status != SheetStatus::Uploaded {
            return Err(StoreError::Conflict(format!(
                "sheet is {} and cannot move to error",
                sheet.status.as_str()
            )));
        }

        sheet.status = SheetStatus::Error;
        sheet.error_message = Some(reason.to_string());
        sheet.updated_at = now;
        Ok(sheet.clone())
    }

    async fn insert_annotation(&self, annotation: &Annotation) -> Result<(), StoreError> {
        let mut arena = self.arena.lock().await;
        let sheet =
            arena.sheets.get_mut(&annotation.sheet_id).ok_or(StoreError::NotFound("sheet"))?;
        if sheet.status == SheetStatus::Processed {
            sheet.status = SheetStatus::Annotated;
            sheet.updated_at = annotation.created_at;
        }
        arena.annotations.insert(annotation.id.clone(), annotation.clone());
        Ok(())
    }

    async fn find_annotation(&self, id: &str) -> Result<Option<Annotation>, StoreError> {
        Ok(self.arena.lock().await.annotations.get(id).cloned())
    }

    async fn update_annotation(&self, annotation: &Annotation) -> Result<Annotation, StoreError> {
        let mut arena = self.arena.lock().await;
        let stored =
            arena.annotations.get_mut(&annotation.id).ok_or(StoreError::NotFound("annotation"))?;
        stored.markup = annotation.markup.clone();
        stored.is_training_data = annotation.is_training_data;
        stored.labels = annotation.labels.clone();
        stored.updated_at = annotation.updated_at;
        Ok(stored.clone())
    }

    async fn delete_annotation(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.arena.lock().await.annotations.remove(id).is_some())
    }

    async fn list_annotations(&self, sheet_id: &str) -> Result<Vec<Annotation>, StoreError> {
        let arena = self.arena.lock().await;
        let annotations = arena
            .annotations
            .values()
            .filter(|annotation| annotation.sheet_id == sheet_id)
            .cloned()
            .collect();
        Ok(sorted(annotations, |annotation| (annotation.created_at, annotation.id.clone())))
    }

    async fn count_training_annotations(&self, template_id: &str) -> Result<i64, StoreError> {
        let arena = self.arena.lock().await;
        Ok(arena
            .annotations
            .values()
            .filter(|annotation| annotation.is_training_data)
            .filter(|annotation| arena.sheet_template(&annotation.sheet_id) == Some(template_id))
            .count() as i64)
    }

    async fn list_training_annotations(
        &self,
        template_id: &str,
    ) -> Result<Vec<TrainingAnnotation>, StoreError> {
        let arena = self.arena.lock().await;
        let annotations: Vec<&Annotation> = sorted(
            arena
                .annotations
                .values()
                .filter(|annotation| annotation.is_training_data)
                .filter(|annotation| {
                    arena.sheet_template(&annotation.sheet_id) == Some(template_id)
                })
                .collect(),
            |annotation| (annotation.created_at, annotation.id.clone()),
        );

        Ok(annotations
            .into_iter()
            .map(|annotation| TrainingAnnotation {
                annotation_id: annotation.id.clone(),
                sheet_id: annotation.sheet_id.clone(),
                labels: annotation.labels.clone(),
                extracted_data: arena
                    .sheets
                    .get(&annotation.sheet_id)
                    .and_then(|sheet| sheet.extracted_data.clone()),
            })
            .collect())
    }

    async fn insert_training_session(&self, session: &TrainingSession) -> Result<(), StoreError> {
        let mut arena = self.arena.lock().await;
        if !arena.templates.contains_key(&session.template_id) {
            return Err(StoreError::NotFound("template"));
        }
        arena.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find_training_session(
        &self,
        id: &str,
    ) -> Result<Option<TrainingSession>, StoreError> {
        Ok(self.arena.lock().await.sessions.get(id).cloned())
    }

    async fn list_training_sessions(
        &self,
        template_id: &str,
    ) -> Result<Vec<TrainingSession>, StoreError> {
        let arena = self.arena.lock().await;
        let mut sessions: Vec<TrainingSession> = arena
            .sessions
            .values()
            .filter(|session| session.template_id == template_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn claim_next_training_session(
        &self,
        now: PrimitiveDateTime,
    ) -> Result<Option<TrainingSession>, StoreError> {
        let mut arena = self.arena.lock().await;
        let next = arena
            .sessions
            .values()
            .filter(|session| session.status == RunStatus::Pending)
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .map(|session| session.id.clone());

        Ok(next.and_then(|id| {
            arena.sessions.get_mut(&id).map(|session| {
                session.status = RunStatus::Running;
                session.started_at = Some(now);
                session.clone()
            })
        }))
    }

    async fn complete_training(
        &self,
        session_id: &str,
        metrics: &TrainingMetrics,
        model: &GradingModel,
        now: PrimitiveDateTime,
    ) -> Result<GradingModel, StoreError> {
        let mut arena = self.arena.lock().await;
        let status = arena
            .sessions
            .get(session_id)
            .map(|session| session.status)
            .ok_or(StoreError::NotFound("training session"))?;
        if status != RunStatus::Running {
            return Err(StoreError::Conflict("training session is no longer running".to_string()));
        }

        let created = arena.insert_model(model)?;
        if let Some(session) = arena.sessions.get_mut(session_id) {
            session.status = RunStatus::Completed;
            session.metrics = Some(Json(metrics.clone()));
            session.model_id = Some(created.id.clone());
            session.error_message = None;
            session.completed_at = Some(now);
        }
        Ok(created)
    }

    async fn fail_training(
        &self,
        session_id: &str,
        message: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        let mut arena = self.arena.lock().await;
        match arena.sessions.get_mut(session_id) {
            Some(session) if is_open(session.status) => {
                session.status = RunStatus::Failed;
                session.error_message = Some(message.to_string());
                session.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_model(&self, model: &GradingModel) -> Result<GradingModel, StoreError> {
        self.arena.lock().await.insert_model(model)
    }

    async fn find_model(&self, id: &str) -> Result<Option<GradingModel>, StoreError> {
        Ok(self.arena.lock().await.models.get(id).cloned())
    }

    async fn list_models(&self, template_id: &str) -> Result<Vec<GradingModel>, StoreError> {
        let arena = self.arena.lock().await;
        let mut models: Vec<GradingModel> =
            arena.models.values().filter(|model| model.template_id == template_id).cloned().collect();
        models.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(models)
    }

    async fn find_active_model(
        &self,
        template_id: &str,
    ) -> Result<Option<GradingModel>, StoreError> {
        let arena = self.arena.lock().await;
        Ok(arena
            .models
            .values()
            .find(|model| model.template_id == template_id && model.is_active)
            .cloned())
    }

    async fn activate_model(
        &self,
        model_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<GradingModel, StoreError> {
        let mut arena = self.arena.lock().await;
        let template_id = arena
            .models
            .get(model_id)
            .map(|model| model.template_id.clone())
            .ok_or(StoreError::NotFound("model"))?;

        for model in arena.models.values_mut() {
            if model.template_id == template_id && model.id != model_id {
                model.is_active = false;
            }
        }

        let model = arena.models.get_mut(model_id).ok_or(StoreError::NotFound("model"))?;
        if !model.is_active {
            model.is_active = true;
            model.activated_at = Some(now);
        }
        Ok(model.clone())
    }

    async fn deactivate_model(&self, model_id: &str) -> Result<GradingModel, StoreError> {
        let mut arena = self.arena.lock().await;
        let model = arena.models.get_mut(model_id).ok_or(StoreError::NotFound("model"))?;
        model.is_active = false;
        Ok(model.clone())
    }

    async fn insert_grading_job(
        &self,
        job: &GradingJob,
        sheet_ids: &[String],
    ) -> Result<(), StoreError> {
        let mut arena = self.arena.lock().await;
        if !arena.templates.contains_key(&job.template_id) {
            return Err(StoreError::NotFound("template"));
        }
        if !arena.models.contains_key(&job.model_id) {
            return Err(StoreError::NotFound("model"));
        }
        if let Some(missing) = sheet_ids.iter().find(|id| !arena.sheets.contains_key(*id)) {
            return Err(StoreError::Conflict(format!("sheet {missing} disappeared")));
        }
        arena.jobs.insert(job.id.clone(), job.clone());
        arena.job_sheets.insert(job.id.clone(), sheet_ids.to_vec());
        Ok(())
    }

    async fn find_grading_job(&self, id: &str) -> Result<Option<GradingJob>, StoreError> {
        Ok(self.arena.lock().await.jobs.get(id).cloned())
    }

    async fn list_grading_jobs(&self, template_id: &str) -> Result<Vec<GradingJob>, StoreError> {
        let arena = self.arena.lock().await;
        let mut jobs: Vec<GradingJob> =
            arena.jobs.values().filter(|job| job.template_id == template_id).cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn list_job_sheet_ids(&self, job_id: &str) -> Result<Vec<String>, StoreError> {
        let arena = self.arena.lock().await;
        let mut ids = arena.job_sheets.get(job_id).cloned().unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    async fn claim_next_grading_job(
        &self,
        now: PrimitiveDateTime,
    ) -> Result<Option<GradingJob>, StoreError> {
        let mut arena = self.arena.lock().await;
        let next = arena
            .jobs
            .values()
            .filter(|job| job.status == RunStatus::Pending)
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .map(|job| job.id.clone());

        Ok(next.and_then(|id| {
            arena.jobs.get_mut(&id).map(|job| {
                job.status = RunStatus::Running;
                job.started_at = Some(now);
                job.clone()
            })
        }))
    }

    async fn commit_sheet_results(
        &self,
        job_id: &str,
        results: &[GradingResult],
    ) -> Result<i32, StoreError> {
        let mut arena = self.arena.lock().await;
        let job = arena.jobs.get(job_id).ok_or(StoreError::NotFound("grading job"))?;
        if job.status != RunStatus::Running || job.processed_sheets >= job.total_sheets {
            return Err(StoreError::Conflict("grading job is no longer running".to_string()));
        }
        for result in results {
            if !arena.regions.contains_key(&result.region_id) {
                return Err(StoreError::NotFound("region"));
            }
            let duplicate = arena.results.contains_key(&result.id)
                || arena.results.values().any(|existing| {
                    existing.job_id == result.job_id
                        && existing.sheet_id == result.sheet_id
                        && existing.region_id == result.region_id
                });
            if duplicate {
                return Err(StoreError::Conflict(format!(
                    "result for sheet {} region {} already committed",
                    result.sheet_id, result.region_id
                )));
            }
        }

        for result in results {
            arena.results.insert(result.id.clone(), result.clone());
        }
        let job = arena.jobs.get_mut(job_id).ok_or(StoreError::NotFound("grading job"))?;
        job.processed_sheets += 1;
        Ok(job.processed_sheets)
    }

    async fn complete_grading_job(
        &self,
        job_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<GradingJob, StoreError> {
        let mut arena = self.arena.lock().await;
        let job = arena.jobs.get_mut(job_id).ok_or(StoreError::NotFound("grading job"))?;
        if job.status != RunStatus::Running {
            return Err(StoreError::Conflict("grading job is no longer running".to_string()));
        }
        job.status = RunStatus::Completed;
        job.completed_at = Some(now);
        job.error_message = None;
        let job = job.clone();

        let sheet_ids = arena.job_sheets.get(job_id).cloned().unwrap_or_default();
        for sheet_id in sheet_ids {
            if let Some(sheet) = arena.sheets.get_mut(&sheet_id) {
                if sheet.status.is_gradable() {
                    sheet.status = SheetStatus::Graded;
                    sheet.updated_at = now;
                }
            }
        }
        Ok(job)
    }

    async fn fail_grading_job(
        &self,
        job_id: &str,
        message: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        let mut arena = self.arena.lock().await;
        match arena.jobs.get_mut(job_id) {
            Some(job) if is_open(job.status) => {
                job.status = RunStatus::Failed;
                job.error_message = Some(message.to_string());
                job.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_result(&self, id: &str) -> Result<Option<ResultContext>, StoreError> {
        let arena = self.arena.lock().await;
        let Some(result) = arena.results.get(id) else {
            return Ok(None);
        };
        let job = arena.jobs.get(&result.job_id).ok_or(StoreError::NotFound("grading job"))?;
        let region = arena.regions.get(&result.region_id).ok_or(StoreError::NotFound("region"))?;

        Ok(Some(ResultContext {
            result: result.clone(),
            job_status: job.status,
            template_id: job.template_id.clone(),
            region_points: region.points,
        }))
    }

    async fn list_results(
        &self,
        job_id: &str,
        needs_review: Option<bool>,
    ) -> Result<Vec<GradingResult>, StoreError> {
        let arena = self.arena.lock().await;
        let results = arena
            .results
            .values()
            .filter(|result| result.job_id == job_id)
            .filter(|result| needs_review.map_or(true, |wanted| result.needs_review == wanted))
            .cloned()
            .collect();
        Ok(sorted(results, |result| {
            (result.sheet_id.clone(), result.created_at, result.id.clone())
        }))
    }

    async fn list_review_queue(
        &self,
        template_id: &str,
    ) -> Result<Vec<GradingResult>, StoreError> {
        let arena = self.arena.lock().await;
        let mut results: Vec<GradingResult> = arena
            .results
            .values()
            .filter(|result| result.needs_review)
            .filter(|result| {
                arena.jobs.get(&result.job_id).is_some_and(|job| {
                    job.template_id == template_id && job.status == RunStatus::Completed
                })
            })
            .cloned()
            .collect();
        results.sort_by(|a, b| {
            a.confidence
                .total_cmp(&b.confidence)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(results)
    }

    async fn apply_review(
        &self,
        result_id: &str,
        update: &ReviewUpdate,
    ) -> Result<GradingResult, StoreError> {
        let mut arena = self.arena.lock().await;
        let result = arena.results.get_mut(result_id).ok_or(StoreError::NotFound("result"))?;

        result.needs_review = false;
        match &update.override_with {
            None => {
                if result.reviewed_at.is_none() {
                    result.reviewed_at = Some(update.reviewed_at);
                }
                if result.reviewed_by.is_none() {
                    result.reviewed_by = Some(update.reviewed_by.clone());
                }
            }
            Some(change) => {
                result.reviewed_at = Some(update.reviewed_at);
                result.reviewed_by = Some(update.reviewed_by.clone());
                result.teacher_override_score = Some(change.score);
                result.assigned_score = change.score;
                result.override_correctness = Some(change.correctness);
                result.review_comment = change.comment.clone();
            }
        }
        Ok(result.clone())
    }

    async fn list_committed_results(
        &self,
        template_id: &str,
    ) -> Result<Vec<CommittedResult>, StoreError> {
        let arena = self.arena.lock().await;
        let rows = arena
            .results
            .values()
            .filter_map(|result| {
                let job = arena.jobs.get(&result.job_id)?;
                (job.template_id == template_id && job.status == RunStatus::Completed).then(|| {
                    CommittedResult {
                        job_id: result.job_id.clone(),
                        sheet_id: result.sheet_id.clone(),
                        region_id: result.region_id.clone(),
                        correctness: result.effective_correctness(),
                        assigned_score: result.assigned_score,
                        job_created_at: job.created_at,
                    }
                })
            })
            .collect();
        Ok(sorted(rows, |row: &CommittedResult| {
            (row.sheet_id.clone(), row.job_created_at, row.region_id.clone())
        }))
    }

    async fn fail_stale_training(
        &self,
        cutoff: PrimitiveDateTime,
        message: &str,
        now: PrimitiveDateTime,
    ) -> Result<u64, StoreError> {
        let mut arena = self.arena.lock().await;
        let mut swept = 0;
        for session in arena.sessions.values_mut() {
            if is_open(session.status) && session.started_at.unwrap_or(session.created_at) < cutoff
            {
                session.status = RunStatus::Failed;
                session.error_message = Some(message.to_string());
                session.completed_at = Some(now);
                swept += 1;
            }
        }
        Ok(swept)
    }

    async fn fail_stale_grading(
        &self,
        cutoff: PrimitiveDateTime,
        message: &str,
        now: PrimitiveDateTime,
    ) -> Result<u64, StoreError> {
        let mut arena = self.arena.lock().await;
        let mut swept = 0;
        for job in arena.jobs.values_mut() {
            if is_open(job.status) && job.started_at.unwrap_or(job.created_at) < cutoff {
                job.status = RunStatus::Failed;
                job.error_message = Some(message.to_string());
                job.completed_at = Some(now);
                swept += 1;
            }
        }
        Ok(swept)
    }
}
