use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use time::PrimitiveDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::core::config::Settings;
use crate::core::time::primitive_now_utc;
use crate::db::models::{GradingJob, GradingModel, GradingResult, Region, Sheet, TemplateWithRegions};
use crate::db::types::{Correctness, RunStatus};
use crate::services::errors::{GradingError, Precondition};
use crate::services::oracle::{OracleError, OracleScore, RegionExtraction, ScoreRequest, ScoringOracle};
use crate::store::GradingStore;

#[derive(Debug, Clone, Copy)]
pub(crate) struct GradingOptions {
    pub(crate) review_threshold: f64,
    pub(crate) sheet_concurrency: usize,
    pub(crate) oracle_timeout: Duration,
}

impl GradingOptions {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        Self {
            review_threshold: settings.grading().review_threshold,
            sheet_concurrency: settings.grading().sheet_concurrency.max(1),
            oracle_timeout: Duration::from_secs(settings.ml().request_timeout_seconds),
        }
    }
}

/// Low confidence and partial credit both go to a human.
pub(crate) fn needs_review(confidence: f64, correctness: Correctness, threshold: f64) -> bool {
    confidence < threshold || correctness == Correctness::Partial
}

/// Rejects payloads outside the oracle contract and clamps over-awarded scores.
pub(crate) fn check_oracle_score(
    score: OracleScore,
    region: &Region,
) -> Result<OracleScore, OracleError> {
    if !score.confidence.is_finite() || !(0.0..=1.0).contains(&score.confidence) {
        return Err(OracleError::InvalidPayload(format!(
            "confidence {} outside [0, 1]",
            score.confidence
        )));
    }
    if !score.assigned_score.is_finite() || score.assigned_score < 0.0 {
        return Err(OracleError::InvalidPayload(format!(
            "assigned score {} is not a non-negative number",
            score.assigned_score
        )));
    }
    if score.assigned_score > region.points {
        tracing::warn!(
            region_id = %region.id,
            assigned_score = score.assigned_score,
            points = region.points,
            "Oracle awarded more than the region is worth; clamping"
        );
        return Ok(OracleScore { assigned_score: region.points, ..score });
    }
    Ok(score)
}

/// Validates the request and persists a PENDING job with the active model frozen into it.
pub(crate) async fn start_grading(
    store: &dyn GradingStore,
    template_id: &str,
    teacher_id: &str,
    sheet_ids: Vec<String>,
    now: PrimitiveDateTime,
) -> Result<GradingJob, GradingError> {
    if sheet_ids.is_empty() {
        return Err(GradingError::validation("sheet_ids must not be empty"));
    }
    let mut seen = HashSet::new();
    if let Some(duplicate) = sheet_ids.iter().find(|id| !seen.insert(id.as_str())) {
        return Err(GradingError::validation(format!("sheet {duplicate} is listed twice")));
    }

    if store.find_template(template_id).await?.is_none() {
        return Err(GradingError::NotFound("template"));
    }
    let model = store.find_active_model(template_id).await?.ok_or(Precondition::NoActiveModel)?;

    let sheets = store.find_sheets(&sheet_ids).await?;
    for sheet_id in &sheet_ids {
        let Some(sheet) = sheets.iter().find(|sheet| &sheet.id == sheet_id) else {
            return Err(not_ready(sheet_id, "sheet does not exist"));
        };
        if sheet.template_id != template_id {
            return Err(not_ready(sheet_id, "sheet belongs to another template"));
        }
        if !sheet.status.is_gradable() {
            return Err(not_ready(sheet_id, &format!("status is {}", sheet.status.as_str())));
        }
    }

    let job = GradingJob {
        id: Uuid::new_v4().to_string(),
        template_id: template_id.to_string(),
        model_id: model.id.clone(),
        teacher_id: teacher_id.to_string(),
        status: RunStatus::Pending,
        total_sheets: sheet_ids.len() as i32,
        processed_sheets: 0,
        error_message: None,
        created_at: now,
        started_at: None,
        completed_at: None,
    };
    store.insert_grading_job(&job, &sheet_ids).await?;

    tracing::info!(
        job_id = %job.id,
        template_id,
        model_id = %model.id,
        model_version = model.version,
        sheets = job.total_sheets,
        "Grading job queued"
    );
    Ok(job)
}

fn not_ready(sheet_id: &str, reason: &str) -> GradingError {
    Precondition::SheetNotReady { sheet_id: sheet_id.to_string(), reason: reason.to_string() }
        .into()
}

pub(crate) async fn get_job(store: &dyn GradingStore, job_id: &str) -> Result<GradingJob, GradingError> {
    store.find_grading_job(job_id).await?.ok_or(GradingError::NotFound("grading job"))
}

pub(crate) async fn list_jobs(
    store: &dyn GradingStore,
    template_id: &str,
) -> Result<Vec<GradingJob>, GradingError> {
    if store.find_template(template_id).await?.is_none() {
        return Err(GradingError::NotFound("template"));
    }
    Ok(store.list_grading_jobs(template_id).await?)
}

pub(crate) async fn list_results(
    store: &dyn GradingStore,
    job_id: &str,
    needs_review: Option<bool>,
) -> Result<Vec<GradingResult>, GradingError> {
    get_job(store, job_id).await?;
    Ok(store.list_results(job_id, needs_review).await?)
}

struct SheetContext {
    job_id: String,
    model: GradingModel,
    template: TemplateWithRegions,
    options: GradingOptions,
}

/// Runs a claimed (RUNNING) job. Sheets are scored concurrently; the first
/// sheet failure aborts the rest and fails the job with sheet statuses untouched.
pub(crate) async fn run_grading_job(
    store: Arc<dyn GradingStore>,
    oracle: Arc<dyn ScoringOracle>,
    options: GradingOptions,
    job: &GradingJob,
) -> Result<GradingJob, GradingError> {
    match grade_sheets(store.clone(), oracle, options, job).await {
        Ok(()) => {
            let completed = store.complete_grading_job(&job.id, primitive_now_utc()).await?;
            metrics::counter!("grading_jobs_total", "status" => "completed").increment(1);
            tracing::info!(
                job_id = %job.id,
                template_id = %job.template_id,
                sheets = completed.processed_sheets,
                "Grading job completed"
            );
            Ok(completed)
        }
        Err(GradingError::Conflict(reason)) => {
            tracing::warn!(job_id = %job.id, %reason, "Grading job left RUNNING while in flight");
            Err(GradingError::Conflict(reason))
        }
        Err(err) => {
            let message = err.to_string();
            if store.fail_grading_job(&job.id, &message, primitive_now_utc()).await? {
                metrics::counter!("grading_jobs_total", "status" => "failed").increment(1);
            }
            tracing::error!(job_id = %job.id, error = %message, "Grading job failed");
            Err(err)
        }
    }
}

async fn grade_sheets(
    store: Arc<dyn GradingStore>,
    oracle: Arc<dyn ScoringOracle>,
    options: GradingOptions,
    job: &GradingJob,
) -> Result<(), GradingError> {
    let model =
        store.find_model(&job.model_id).await?.ok_or(GradingError::NotFound("model"))?;
    let template = store
        .find_template(&job.template_id)
        .await?
        .ok_or(GradingError::NotFound("template"))?;
    let sheet_ids = store.list_job_sheet_ids(&job.id).await?;
    let sheets = store.find_sheets(&sheet_ids).await?;
    if sheets.len() != sheet_ids.len() {
        return Err(GradingError::NotFound("sheet"));
    }

    let context = Arc::new(SheetContext { job_id: job.id.clone(), model, template, options });
    let permits = Arc::new(Semaphore::new(options.sheet_concurrency));
    let mut tasks = JoinSet::new();

    for sheet in sheets {
        let store = store.clone();
        let oracle = oracle.clone();
        let context = context.clone();
        let permits = permits.clone();
        tasks.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| OracleError::Transport("sheet scheduling stopped".to_string()))?;
            grade_sheet(store.as_ref(), oracle.as_ref(), &context, &sheet).await
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.unwrap_or_else(|err| {
            Err(GradingError::Oracle(OracleError::Transport(format!("sheet task aborted: {err}"))))
        });
        if let Err(err) = outcome {
            tasks.abort_all();
            return Err(err);
        }
    }
    Ok(())
}

async fn grade_sheet(
    store: &dyn GradingStore,
    oracle: &dyn ScoringOracle,
    context: &SheetContext,
    sheet: &Sheet,
) -> Result<(), GradingError> {
    let timer = Instant::now();
    let extracted = sheet.extracted_data.as_ref().map(|data| &data.0);
    let mut results = Vec::with_capacity(context.template.regions.len());

    for region in &context.template.regions {
        let extraction = RegionExtraction::from_extracted(extracted, &region.id);
        let request = ScoreRequest { sheet, region, extraction: &extraction, model: &context.model };
        let timeout = context.options.oracle_timeout;

        let scored = tokio::time::timeout(timeout, oracle.score(request))
            .await
            .map_err(|_| OracleError::Timeout(timeout.as_secs()))
            .and_then(|result| result)
            .and_then(|score| check_oracle_score(score, region))
            .map_err(|err| locate(err, &sheet.id, &region.label))?;

        let flagged =
            needs_review(scored.confidence, scored.correctness, context.options.review_threshold);
        results.push(GradingResult {
            id: Uuid::new_v4().to_string(),
            job_id: context.job_id.clone(),
            sheet_id: sheet.id.clone(),
            region_id: region.id.clone(),
            predicted_correctness: scored.correctness,
            confidence: scored.confidence,
            assigned_score: scored.assigned_score,
            explanation: scored.explanation,
            needs_review: flagged,
            reviewed_at: None,
            reviewed_by: None,
            teacher_override_score: None,
            override_correctness: None,
            review_comment: None,
            created_at: primitive_now_utc(),
        });
    }

    let flagged = results.iter().filter(|result| result.needs_review).count() as u64;
    let processed = store.commit_sheet_results(&context.job_id, &results).await?;

    metrics::histogram!("grading_sheet_duration_seconds").record(timer.elapsed().as_secs_f64());
    metrics::counter!("grading_results_total", "triage" => "review").increment(flagged);
    metrics::counter!("grading_results_total", "triage" => "auto")
        .increment(results.len() as u64 - flagged);
    tracing::debug!(
        job_id = %context.job_id,
        sheet_id = %sheet.id,
        processed,
        flagged,
        "Sheet graded"
    );
    Ok(())
}

/// Prefixes an oracle failure with the sheet and region it happened on.
fn locate(err: OracleError, sheet_id: &str, region_label: &str) -> GradingError {
    let at = format!("sheet {sheet_id} region {region_label}");
    GradingError::Oracle(match err {
        OracleError::Transport(message) => OracleError::Transport(format!("{at}: {message}")),
        OracleError::Timeout(seconds) => {
            OracleError::Transport(format!("{at}: timed out after {seconds}s"))
        }
        OracleError::Status { status, body } => {
            OracleError::Status { status, body: format!("{at}: {body}") }
        }
        OracleError::InvalidPayload(message) => {
            OracleError::InvalidPayload(format!("{at}: {message}"))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::types::{QuestionType, SheetStatus};
    use crate::services::training::{activate_model, seed_model};
    use crate::store::MemoryStore;
    use crate::test_support::{self, ScriptedScoring};

    const OPTIONS: GradingOptions = GradingOptions {
        review_threshold: 0.75,
        sheet_concurrency: 2,
        oracle_timeout: Duration::from_secs(5),
    };

    fn score(correctness: Correctness, confidence: f64, assigned_score: f64) -> OracleScore {
        OracleScore { correctness, confidence, assigned_score, explanation: "scripted".to_string() }
    }

    async fn claimed(store: &dyn GradingStore) -> GradingJob {
        store
            .claim_next_grading_job(primitive_now_utc())
            .await
            .expect("claim")
            .expect("pending job")
    }

    #[test]
    fn triage_flags_low_confidence_and_partial_credit() {
        assert!(needs_review(0.6, Correctness::Correct, 0.75));
        assert!(needs_review(0.9, Correctness::Partial, 0.75));
        assert!(!needs_review(0.9, Correctness::Correct, 0.75));
        assert!(!needs_review(0.75, Correctness::Incorrect, 0.75));
    }

    #[test]
    fn oracle_scores_outside_contract_are_rejected_or_clamped() {
        let region = test_support::sample_region("tpl", "q1", QuestionType::Numeric, 10.0);

        for confidence in [f64::NAN, -0.1, 1.2] {
            let err = check_oracle_score(score(Correctness::Correct, confidence, 1.0), &region)
                .expect_err("bad confidence");
            assert!(matches!(err, OracleError::InvalidPayload(_)));
        }
        assert!(check_oracle_score(score(Correctness::Correct, 0.9, -1.0), &region).is_err());
        assert!(check_oracle_score(score(Correctness::Correct, 0.9, f64::INFINITY), &region).is_err());

        let clamped = check_oracle_score(score(Correctness::Correct, 0.9, 15.0), &region)
            .expect("clamped");
        assert_eq!(clamped.assigned_score, 10.0);
    }

    #[tokio::test]
    async fn start_rejects_requests_before_creating_a_job() {
        let store = MemoryStore::new();
        let template = test_support::seed_template(&store, &[("q1", 10.0)]).await;
        let template_id = template.template.id.clone();
        let ready = test_support::processed_sheet(&store, &template, "42").await;

        let err = start_grading(&store, &template_id, "t", vec![ready.id.clone()], primitive_now_utc())
            .await
            .expect_err("no model");
        assert!(matches!(err, GradingError::Precondition(Precondition::NoActiveModel)));

        test_support::seed_active_model(&store, &template_id).await;
        let uploaded = crate::services::sheets::register_sheet(
            &store,
            &template_id,
            None,
            "s3://sheets/raw.png",
            primitive_now_utc(),
        )
        .await
        .expect("sheet");
        let other = test_support::seed_template(&store, &[("q1", 1.0)]).await;
        let foreign = test_support::processed_sheet(&store, &other, "1").await;

        assert!(matches!(
            start_grading(&store, &template_id, "t", vec![], primitive_now_utc()).await,
            Err(GradingError::Validation(_))
        ));
        assert!(matches!(
            start_grading(
                &store,
                &template_id,
                "t",
                vec![ready.id.clone(), ready.id.clone()],
                primitive_now_utc()
            )
            .await,
            Err(GradingError::Validation(_))
        ));
        for bad in [uploaded.id.clone(), foreign.id.clone(), "missing".to_string()] {
            let err = start_grading(
                &store,
                &template_id,
                "t",
                vec![ready.id.clone(), bad.clone()],
                primitive_now_utc(),
            )
            .await
            .expect_err("not ready");
            assert!(matches!(
                err,
                GradingError::Precondition(Precondition::SheetNotReady { ref sheet_id, .. })
                    if *sheet_id == bad
            ));
        }
        assert!(store.list_grading_jobs(&template_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn results_are_triaged_and_job_completes() {
        let store: Arc<dyn GradingStore> = Arc::new(MemoryStore::new());
        let template = test_support::seed_template(store.as_ref(), &[("q1", 10.0)]).await;
        let template_id = template.template.id.clone();
        test_support::seed_active_model(store.as_ref(), &template_id).await;

        let mut sheet_ids = Vec::new();
        for text in ["unsure", "partial", "sure"] {
            sheet_ids.push(test_support::processed_sheet(store.as_ref(), &template, text).await.id);
        }
        let oracle = Arc::new(ScriptedScoring::new(|request| {
            Ok(match request.extraction.text.as_str() {
                "unsure" => score(Correctness::Correct, 0.6, 10.0),
                "partial" => score(Correctness::Partial, 0.9, 5.0),
                _ => score(Correctness::Correct, 0.9, 10.0),
            })
        }));

        start_grading(store.as_ref(), &template_id, "t", sheet_ids.clone(), primitive_now_utc())
            .await
            .expect("start");
        let job = claimed(store.as_ref()).await;
        let done = run_grading_job(store.clone(), oracle.clone(), OPTIONS, &job)
            .await
            .expect("run");

        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.processed_sheets, 3);
        assert_eq!(oracle.calls().len(), 3);

        let results = list_results(store.as_ref(), &job.id, None).await.expect("results");
        assert_eq!(results.len(), 3);
        for result in &results {
            let expected = result.sheet_id != sheet_ids[2];
            assert_eq!(result.needs_review, expected, "sheet {}", result.sheet_id);
        }
        let flagged = list_results(store.as_ref(), &job.id, Some(true)).await.expect("flagged");
        assert_eq!(flagged.len(), 2);

        for sheet in store.find_sheets(&sheet_ids).await.unwrap() {
            assert_eq!(sheet.status, SheetStatus::Graded);
        }
    }

    #[tokio::test]
    async fn job_uses_the_model_active_when_it_was_started() {
        let store: Arc<dyn GradingStore> = Arc::new(MemoryStore::new());
        let template = test_support::seed_template(store.as_ref(), &[("q1", 4.0), ("q2", 6.0)]).await;
        let template_id = template.template.id.clone();
        let first = test_support::seed_active_model(store.as_ref(), &template_id).await;
        let mut sheet_ids = Vec::new();
        for text in ["a", "b", "c", "d"] {
            sheet_ids.push(test_support::processed_sheet(store.as_ref(), &template, text).await.id);
        }

        let now = primitive_now_utc();
        let early = start_grading(store.as_ref(), &template_id, "t", sheet_ids.clone(), now)
            .await
            .expect("early job");

        let second = seed_model(store.as_ref(), &template_id, "ml://models/v2", 0.93, primitive_now_utc())
            .await
            .expect("seed");
        activate_model(store.as_ref(), &second.id, primitive_now_utc()).await.expect("activate");

        let later = now + time::Duration::seconds(1);
        let late = start_grading(store.as_ref(), &template_id, "t", sheet_ids, later)
            .await
            .expect("late job");
        assert_eq!(early.model_id, first.id);
        assert_eq!(late.model_id, second.id);

        for expected_model in [&first.id, &second.id] {
            let oracle = Arc::new(ScriptedScoring::constant(Correctness::Correct, 0.95));
            let job = claimed(store.as_ref()).await;
            run_grading_job(store.clone(), oracle.clone(), OPTIONS, &job).await.expect("run");

            let calls = oracle.calls();
            assert_eq!(calls.len(), 8);
            assert!(calls.iter().all(|call| &call.model_id == expected_model));
        }
    }

    /// Revises the template layout from inside the first scoring call.
    struct RevisingOracle {
        store: Arc<dyn GradingStore>,
        template_id: String,
        revisions: std::sync::Mutex<Vec<crate::services::templates::TemplateRevision>>,
    }

    #[async_trait::async_trait]
    impl ScoringOracle for RevisingOracle {
        async fn score(&self, request: ScoreRequest<'_>) -> Result<OracleScore, OracleError> {
            let regions = test_support::template_input("ignored", &[("q1", 2.0)]).regions;
            let revision = crate::services::templates::revise_template(
                self.store.as_ref(),
                &self.template_id,
                regions,
                primitive_now_utc(),
            )
            .await
            .map_err(|err| OracleError::Transport(err.to_string()))?;
            if let Ok(mut revisions) = self.revisions.lock() {
                revisions.push(revision);
            }
            Ok(score(Correctness::Correct, 0.9, request.region.points))
        }

        async fn health(&self) -> Result<(), OracleError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn revising_a_template_mid_job_leaves_its_layout_intact() {
        let store: Arc<dyn GradingStore> = Arc::new(MemoryStore::new());
        let template = test_support::seed_template(store.as_ref(), &[("q1", 10.0)]).await;
        let template_id = template.template.id.clone();
        test_support::seed_active_model(store.as_ref(), &template_id).await;
        let sheet = test_support::processed_sheet(store.as_ref(), &template, "x").await;
        let oracle = Arc::new(RevisingOracle {
            store: store.clone(),
            template_id: template_id.clone(),
            revisions: std::sync::Mutex::new(Vec::new()),
        });

        start_grading(store.as_ref(), &template_id, "t", vec![sheet.id.clone()], primitive_now_utc())
            .await
            .expect("start");
        let job = claimed(store.as_ref()).await;
        let done = run_grading_job(store.clone(), oracle.clone(), OPTIONS, &job)
            .await
            .expect("run");
        assert_eq!(done.status, RunStatus::Completed);

        let revisions = oracle.revisions.lock().expect("revisions").clone();
        assert_eq!(revisions.len(), 1);
        assert!(revisions[0].new_version);
        assert_ne!(revisions[0].template.template.id, template_id);

        let current = store.find_template(&template_id).await.unwrap().expect("template");
        assert_eq!(current.regions.len(), 1);
        assert_eq!(current.regions[0].id, template.regions[0].id);
        assert_eq!(current.regions[0].points, 10.0);
        assert!(store.template_has_results(&template_id).await.unwrap());

        let results = list_results(store.as_ref(), &job.id, None).await.expect("results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].assigned_score, 10.0);
        let context = store.find_result(&results[0].id).await.unwrap().expect("result");
        assert_eq!(context.region_points, 10.0);
        assert_eq!(context.template_id, template_id);
    }

    #[tokio::test]
    async fn sheet_failure_fails_the_job_and_leaves_sheets_alone() {
        let store: Arc<dyn GradingStore> = Arc::new(MemoryStore::new());
        let template = test_support::seed_template(store.as_ref(), &[("q1", 10.0)]).await;
        let template_id = template.template.id.clone();
        test_support::seed_active_model(store.as_ref(), &template_id).await;
        let mut sheet_ids = Vec::new();
        for text in ["fine", "boom", "fine", "fine"] {
            sheet_ids.push(test_support::processed_sheet(store.as_ref(), &template, text).await.id);
        }
        let oracle = Arc::new(ScriptedScoring::new(|request| {
            if request.extraction.text == "boom" {
                return Err(OracleError::Status { status: 500, body: "model crashed".to_string() });
            }
            Ok(score(Correctness::Correct, 0.9, 10.0))
        }));

        start_grading(store.as_ref(), &template_id, "t", sheet_ids.clone(), primitive_now_utc())
            .await
            .expect("start");
        let job = claimed(store.as_ref()).await;
        let err = run_grading_job(store.clone(), oracle, OPTIONS, &job).await.expect_err("fails");
        assert!(matches!(err, GradingError::Oracle(OracleError::Status { status: 500, .. })));

        let failed = get_job(store.as_ref(), &job.id).await.expect("job");
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(failed.error_message.as_deref().is_some_and(|message| message.contains("model crashed")));
        assert!(failed.processed_sheets < failed.total_sheets);

        let committed = list_results(store.as_ref(), &job.id, None).await.expect("results");
        assert_eq!(committed.len() as i32, failed.processed_sheets);
        for sheet in store.find_sheets(&sheet_ids).await.unwrap() {
            assert_eq!(sheet.status, SheetStatus::Processed);
        }
    }

    #[tokio::test]
    async fn over_awarded_scores_are_stored_clamped() {
        let store: Arc<dyn GradingStore> = Arc::new(MemoryStore::new());
        let template = test_support::seed_template(store.as_ref(), &[("q1", 3.0)]).await;
        let template_id = template.template.id.clone();
        test_support::seed_active_model(store.as_ref(), &template_id).await;
        let sheet = test_support::processed_sheet(store.as_ref(), &template, "x").await;
        let oracle = Arc::new(ScriptedScoring::new(|_| Ok(score(Correctness::Correct, 0.99, 7.5))));

        start_grading(store.as_ref(), &template_id, "t", vec![sheet.id], primitive_now_utc())
            .await
            .expect("start");
        let job = claimed(store.as_ref()).await;
        run_grading_job(store.clone(), oracle, OPTIONS, &job).await.expect("run");

        let results = list_results(store.as_ref(), &job.id, None).await.expect("results");
        assert_eq!(results[0].assigned_score, 3.0);
    }
}
