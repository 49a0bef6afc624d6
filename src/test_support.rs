use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
    Router,
};
use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::api;
use crate::core::{
    config::Settings, redis::RedisHandle, security, state::AppState, time::primitive_now_utc,
};
use crate::db::models::{
    BoundingBox, GradingJob, GradingModel, GradingResult, Markup, QuestionLabel, Region, Sheet,
    TemplateWithRegions, TrainingMetrics,
};
use crate::db::types::{Correctness, QuestionType, SheetStatus};
use crate::services::annotations::{create_annotation, NewAnnotation};
use crate::services::grading::{run_grading_job, start_grading, GradingOptions};
use crate::services::oracle::{
    OracleError, OracleScore, ScoreRequest, ScoringOracle, TrainOutcome, TrainRequest,
    TrainingOracle,
};
use crate::services::sheets::{record_extraction, register_sheet};
use crate::services::templates::{create_template, NewTemplate, RegionSpec};
use crate::services::training::{activate_model, seed_model};
use crate::store::{GradingStore, MemoryStore};

const TEST_SECRET_KEY: &str = "test-secret";
const TEST_REDIS_DB: &str = "1";
pub(crate) const TEST_TEACHER: &str = "teacher-1";

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

pub(crate) fn set_test_env() {
    std::env::set_var("GRADING_ENV", "test");
    std::env::set_var("GRADING_STRICT_CONFIG", "0");
    std::env::set_var("PERSISTENCE_BACKEND", "memory");
    std::env::set_var("SECRET_KEY", TEST_SECRET_KEY);
    std::env::set_var("REDIS_HOST", "127.0.0.1");
    std::env::set_var("REDIS_PORT", "6379");
    std::env::set_var("REDIS_DB", TEST_REDIS_DB);
    std::env::remove_var("REDIS_PASSWORD");
    std::env::remove_var("ML_SERVICE_URL");
    std::env::remove_var("ML_SERVICE_API_KEY");
    std::env::set_var("PROMETHEUS_ENABLED", "0");
}

pub(crate) fn template_input(name: &str, regions: &[(&str, f64)]) -> NewTemplate {
    NewTemplate {
        name: name.to_string(),
        pass_threshold: None,
        regions: regions
            .iter()
            .enumerate()
            .map(|(index, (label, points))| RegionSpec {
                label: label.to_string(),
                question_type: QuestionType::ShortAnswer,
                points: *points,
                bbox: BoundingBox { x: 40.0, y: 60.0 + index as f64 * 120.0, width: 520.0, height: 100.0 },
                order_index: None,
                expected_answer: Some(format!("answer {label}")),
            })
            .collect(),
    }
}

pub(crate) async fn seed_template(
    store: &dyn GradingStore,
    regions: &[(&str, f64)],
) -> TemplateWithRegions {
    let name = format!("Quiz {}", Uuid::new_v4().simple());
    create_template(store, template_input(&name, regions), TEST_TEACHER, primitive_now_utc())
        .await
        .expect("seed template")
}

/// A sheet whose extraction reads `text` for every region.
pub(crate) async fn processed_sheet(
    store: &dyn GradingStore,
    template: &TemplateWithRegions,
    text: &str,
) -> Sheet {
    let sheet = register_sheet(
        store,
        &template.template.id,
        Some(format!("student-{}", Uuid::new_v4().simple())),
        "s3://sheets/scan.png",
        primitive_now_utc(),
    )
    .await
    .expect("register sheet");

    let mut regions = serde_json::Map::new();
    for region in &template.regions {
        regions.insert(region.id.clone(), json!({"text": text, "confidence": 0.97}));
    }
    record_extraction(store, &sheet.id, json!({"regions": regions}), primitive_now_utc())
        .await
        .expect("record extraction")
}

/// `count` processed sheets, each with one training annotation labelling every region.
pub(crate) async fn training_annotations(
    store: &dyn GradingStore,
    template: &TemplateWithRegions,
    count: usize,
    correctness: Correctness,
) {
    for index in 0..count {
        let sheet = processed_sheet(store, template, &format!("answer {index}")).await;
        let labels = template
            .regions
            .iter()
            .map(|region| QuestionLabel {
                region_id: region.id.clone(),
                correctness,
                score: if correctness == Correctness::Correct { region.points } else { 0.0 },
                confidence: Some(1.0),
                comment: None,
            })
            .collect();
        let input =
            NewAnnotation { markup: Markup::Ink { strokes: Vec::new() }, is_training_data: true, labels };
        create_annotation(store, &sheet.id, TEST_TEACHER, input, primitive_now_utc())
            .await
            .expect("training annotation");
    }
}

pub(crate) async fn seed_active_model(store: &dyn GradingStore, template_id: &str) -> GradingModel {
    let model = seed_model(store, template_id, "ml://models/seeded", 0.9, primitive_now_utc())
        .await
        .expect("seed model");
    activate_model(store, &model.id, primitive_now_utc()).await.expect("activate model")
}

pub(crate) fn sample_sheet(template_id: &str) -> Sheet {
    let now = primitive_now_utc();
    Sheet {
        id: Uuid::new_v4().to_string(),
        template_id: template_id.to_string(),
        student_id: Some("student-1".to_string()),
        original_url: "s3://sheets/sample.png".to_string(),
        status: SheetStatus::Processed,
        extracted_data: None,
        error_message: None,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn sample_region(
    template_id: &str,
    region_id: &str,
    question_type: QuestionType,
    points: f64,
) -> Region {
    Region {
        id: region_id.to_string(),
        template_id: template_id.to_string(),
        label: region_id.to_string(),
        question_type,
        points,
        bbox: BoundingBox { x: 0.0, y: 0.0, width: 100.0, height: 40.0 },
        order_index: 0,
        expected_answer: None,
    }
}

pub(crate) fn sample_model(template_id: &str, artifact_url: &str) -> GradingModel {
    GradingModel {
        id: Uuid::new_v4().to_string(),
        template_id: template_id.to_string(),
        training_id: None,
        version: 1,
        artifact_url: artifact_url.to_string(),
        accuracy: 0.9,
        is_active: true,
        created_at: primitive_now_utc(),
        activated_at: Some(primitive_now_utc()),
    }
}

pub(crate) fn sample_result(job_id: &str, sheet_id: &str, region_id: &str) -> GradingResult {
    GradingResult {
        id: Uuid::new_v4().to_string(),
        job_id: job_id.to_string(),
        sheet_id: sheet_id.to_string(),
        region_id: region_id.to_string(),
        predicted_correctness: Correctness::Correct,
        confidence: 0.5,
        assigned_score: 1.0,
        explanation: "sample".to_string(),
        needs_review: true,
        reviewed_at: None,
        reviewed_by: None,
        teacher_override_score: None,
        override_correctness: None,
        review_comment: None,
        created_at: primitive_now_utc(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ScoredCall {
    pub(crate) sheet_id: String,
    pub(crate) region_id: String,
    pub(crate) model_id: String,
}

type ScoreScript = dyn Fn(&ScoreRequest<'_>) -> Result<OracleScore, OracleError> + Send + Sync;

/// Scoring oracle driven by a closure; records every call.
pub(crate) struct ScriptedScoring {
    script: Box<ScoreScript>,
    calls: StdMutex<Vec<ScoredCall>>,
}

impl ScriptedScoring {
    pub(crate) fn new(
        script: impl Fn(&ScoreRequest<'_>) -> Result<OracleScore, OracleError> + Send + Sync + 'static,
    ) -> Self {
        Self { script: Box::new(script), calls: StdMutex::new(Vec::new()) }
    }

    /// Full marks for CORRECT, half for PARTIAL, nothing otherwise.
    pub(crate) fn constant(correctness: Correctness, confidence: f64) -> Self {
        Self::new(move |request| {
            let points = request.region.points;
            let assigned_score = match correctness {
                Correctness::Correct => points,
                Correctness::Partial => points / 2.0,
                Correctness::Incorrect | Correctness::Skipped => 0.0,
            };
            Ok(OracleScore {
                correctness,
                confidence,
                assigned_score,
                explanation: "scripted".to_string(),
            })
        })
    }

    pub(crate) fn calls(&self) -> Vec<ScoredCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ScoringOracle for ScriptedScoring {
    async fn score(&self, request: ScoreRequest<'_>) -> Result<OracleScore, OracleError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ScoredCall {
                sheet_id: request.sheet.id.clone(),
                region_id: request.region.id.clone(),
                model_id: request.model.id.clone(),
            });
        }
        (self.script)(&request)
    }

    async fn health(&self) -> Result<(), OracleError> {
        Ok(())
    }
}

/// Training oracle that either succeeds with a fixed accuracy or fails.
pub(crate) struct ScriptedTraining {
    outcome: Result<f64, OracleError>,
    sample_counts: StdMutex<Vec<usize>>,
}

impl ScriptedTraining {
    pub(crate) fn succeeding(accuracy: f64) -> Self {
        Self { outcome: Ok(accuracy), sample_counts: StdMutex::new(Vec::new()) }
    }

    pub(crate) fn failing(err: OracleError) -> Self {
        Self { outcome: Err(err), sample_counts: StdMutex::new(Vec::new()) }
    }

    pub(crate) fn sample_counts(&self) -> Vec<usize> {
        self.sample_counts.lock().map(|counts| counts.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TrainingOracle for ScriptedTraining {
    async fn train(&self, request: TrainRequest<'_>) -> Result<TrainOutcome, OracleError> {
        if let Ok(mut counts) = self.sample_counts.lock() {
            counts.push(request.samples.len());
        }
        let accuracy = self.outcome.clone()?;
        Ok(TrainOutcome {
            artifact_url: format!("ml://models/{}", request.model_id),
            accuracy,
            metrics: TrainingMetrics {
                accuracy,
                validation_accuracy: accuracy,
                confusion_matrix: vec![vec![1, 0], vec![0, 1]],
                training_time_seconds: 0.5,
                sample_count: request.samples.len(),
            },
        })
    }
}

pub(crate) struct GradedFixture {
    pub(crate) store: Arc<dyn GradingStore>,
    pub(crate) template: TemplateWithRegions,
    pub(crate) sheets: Vec<Sheet>,
    pub(crate) model: GradingModel,
    pub(crate) job: GradingJob,
    /// One result per sheet, in sheet order.
    pub(crate) results: Vec<GradingResult>,
}

/// A completed job over a one-region (10 point) template; sheet `i` is scored
/// CORRECT with `confidences[i]`.
pub(crate) async fn graded_fixture(confidences: &[f64]) -> GradedFixture {
    let store: Arc<dyn GradingStore> = Arc::new(MemoryStore::new());
    graded_fixture_in(store, confidences).await
}

pub(crate) async fn graded_fixture_in(
    store: Arc<dyn GradingStore>,
    confidences: &[f64],
) -> GradedFixture {
    let template = seed_template(store.as_ref(), &[("q1", 10.0)]).await;
    let model = seed_active_model(store.as_ref(), &template.template.id).await;

    let mut sheets = Vec::with_capacity(confidences.len());
    for index in 0..confidences.len() {
        sheets.push(processed_sheet(store.as_ref(), &template, &format!("sheet-{index}")).await);
    }
    let by_text: Vec<(String, f64)> = confidences
        .iter()
        .enumerate()
        .map(|(index, confidence)| (format!("sheet-{index}"), *confidence))
        .collect();
    let oracle = Arc::new(ScriptedScoring::new(move |request| {
        let confidence = by_text
            .iter()
            .find(|(text, _)| *text == request.extraction.text)
            .map(|(_, confidence)| *confidence)
            .unwrap_or(1.0);
        Ok(OracleScore {
            correctness: Correctness::Correct,
            confidence,
            assigned_score: request.region.points,
            explanation: "scripted".to_string(),
        })
    }));

    let sheet_ids = sheets.iter().map(|sheet| sheet.id.clone()).collect();
    let queued =
        start_grading(store.as_ref(), &template.template.id, TEST_TEACHER, sheet_ids, primitive_now_utc())
            .await
            .expect("start grading");
    let claimed = store
        .claim_next_grading_job(primitive_now_utc())
        .await
        .expect("claim")
        .filter(|job| job.id == queued.id)
        .expect("claimed fixture job");
    let options = GradingOptions {
        review_threshold: 0.75,
        sheet_concurrency: 2,
        oracle_timeout: std::time::Duration::from_secs(5),
    };
    let job = run_grading_job(store.clone(), oracle, options, &claimed).await.expect("grade");

    let all = store.list_results(&job.id, None).await.expect("results");
    let results = sheets
        .iter()
        .map(|sheet| {
            all.iter().find(|result| result.sheet_id == sheet.id).cloned().expect("sheet result")
        })
        .collect();

    GradedFixture { store, template, sheets, model, job, results }
}

pub(crate) struct TestContext {
    pub(crate) state: AppState,
    pub(crate) app: Router,
    _guard: OwnedMutexGuard<()>,
}

/// Router over an in-memory store, an unconnected cache and scripted oracles.
pub(crate) async fn setup_test_context() -> TestContext {
    let guard = env_lock().await;
    set_test_env();

    let state = memory_state(Settings::load().expect("settings"));
    let app = api::router::router(state.clone());

    TestContext { state, app, _guard: guard }
}

pub(crate) fn memory_state(settings: Settings) -> AppState {
    let redis = RedisHandle::new(settings.redis().redis_url());
    AppState::new(
        settings,
        Arc::new(MemoryStore::new()),
        redis,
        Arc::new(ScriptedScoring::constant(Correctness::Correct, 0.95)),
        Arc::new(ScriptedTraining::succeeding(0.9)),
    )
}

pub(crate) fn bearer_token(teacher_id: &str, settings: &Settings) -> String {
    security::create_access_token(teacher_id, settings, None).expect("token")
}

pub(crate) fn json_request(
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);

    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    if let Some(body) = body {
        let bytes = serde_json::to_vec(&body).expect("serialize body");
        builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .expect("request body")
    } else {
        builder.body(Body::empty()).expect("request body")
    }
}

pub(crate) async fn read_json(response: axum::response::Response<Body>) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("response body");
    serde_json::from_slice(&body).unwrap_or_else(|err| {
        let body_text = String::from_utf8_lossy(&body);
        panic!("json parse: {err}; body: {body_text}");
    })
}
