use std::time::Duration;

use sqlx::types::Json;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::core::config::Settings;
use crate::core::time::primitive_now_utc;
use crate::db::models::{GradingModel, TemplateWithRegions, TrainingConfig, TrainingSession};
use crate::db::types::RunStatus;
use crate::services::errors::{GradingError, Precondition};
use crate::services::oracle::{
    OracleError, RegionExtraction, TrainRequest, TrainingOracle, TrainingSample,
};
use crate::store::{GradingStore, StoreError};

/// Creates a PENDING session once enough training annotations exist.
pub(crate) async fn start_training(
    store: &dyn GradingStore,
    min_annotations: u32,
    template_id: &str,
    teacher_id: &str,
    config: TrainingConfig,
    now: PrimitiveDateTime,
) -> Result<TrainingSession, GradingError> {
    validate_config(&config)?;
    if store.find_template(template_id).await?.is_none() {
        return Err(GradingError::NotFound("template"));
    }

    let found = store.count_training_annotations(template_id).await?;
    if found < i64::from(min_annotations) {
        return Err(Precondition::InsufficientTrainingData { required: min_annotations, found }
            .into());
    }

    let session = TrainingSession {
        id: Uuid::new_v4().to_string(),
        template_id: template_id.to_string(),
        teacher_id: teacher_id.to_string(),
        status: RunStatus::Pending,
        config: Json(config),
        metrics: None,
        error_message: None,
        model_id: None,
        created_at: now,
        started_at: None,
        completed_at: None,
    };
    store.insert_training_session(&session).await?;

    tracing::info!(session_id = %session.id, template_id, annotations = found, "Training queued");
    Ok(session)
}

pub(crate) async fn get_training_session(
    store: &dyn GradingStore,
    session_id: &str,
) -> Result<TrainingSession, GradingError> {
    store.find_training_session(session_id).await?.ok_or(GradingError::NotFound("training session"))
}

pub(crate) async fn list_training_sessions(
    store: &dyn GradingStore,
    template_id: &str,
) -> Result<Vec<TrainingSession>, GradingError> {
    if store.find_template(template_id).await?.is_none() {
        return Err(GradingError::NotFound("template"));
    }
    Ok(store.list_training_sessions(template_id).await?)
}

/// Runs a claimed (RUNNING) session to completion or failure.
///
/// Either a model is created and the session completes, or the session
/// fails and nothing else is written.
pub(crate) async fn run_training_session(
    store: &dyn GradingStore,
    oracle: &dyn TrainingOracle,
    timeout: Duration,
    session: &TrainingSession,
) -> Result<GradingModel, GradingError> {
    match train_model(store, oracle, timeout, session).await {
        Ok(model) => {
            metrics::counter!("training_sessions_total", "status" => "completed").increment(1);
            tracing::info!(
                session_id = %session.id,
                template_id = %session.template_id,
                model_id = %model.id,
                version = model.version,
                accuracy = model.accuracy,
                "Training session completed"
            );
            Ok(model)
        }
        Err(GradingError::Conflict(reason)) => {
            tracing::warn!(
                session_id = %session.id,
                %reason,
                "Training finished after the session left RUNNING; discarding result"
            );
            Err(GradingError::Conflict(reason))
        }
        Err(err) => {
            let message = err.to_string();
            let failed = store.fail_training(&session.id, &message, primitive_now_utc()).await?;
            if failed {
                metrics::counter!("training_sessions_total", "status" => "failed").increment(1);
            }
            tracing::error!(session_id = %session.id, error = %message, "Training session failed");
            Err(err)
        }
    }
}

async fn train_model(
    store: &dyn GradingStore,
    oracle: &dyn TrainingOracle,
    timeout: Duration,
    session: &TrainingSession,
) -> Result<GradingModel, GradingError> {
    let template = store
        .find_template(&session.template_id)
        .await?
        .ok_or(GradingError::NotFound("template"))?;
    let samples = training_set(store, &template).await?;
    if samples.is_empty() {
        return Err(GradingError::validation("no usable training samples for template"));
    }

    let model_id = Uuid::new_v4().to_string();
    let request = TrainRequest {
        model_id: &model_id,
        template_id: &template.template.id,
        samples: &samples,
        config: &session.config.0,
    };
    let outcome = tokio::time::timeout(timeout, oracle.train(request))
        .await
        .map_err(|_| OracleError::Timeout(timeout.as_secs()))??;
    if !outcome.accuracy.is_finite() {
        return Err(OracleError::InvalidPayload("non-finite accuracy".to_string()).into());
    }

    let now = primitive_now_utc();
    let model = GradingModel {
        id: model_id,
        template_id: template.template.id.clone(),
        training_id: Some(session.id.clone()),
        version: 0,
        artifact_url: outcome.artifact_url,
        accuracy: outcome.accuracy,
        is_active: false,
        created_at: now,
        activated_at: None,
    };
    Ok(store.complete_training(&session.id, &outcome.metrics, &model, now).await?)
}

/// Training-flagged labels joined with the text extracted for their region.
pub(crate) async fn training_set(
    store: &dyn GradingStore,
    template: &TemplateWithRegions,
) -> Result<Vec<TrainingSample>, GradingError> {
    let annotations = store.list_training_annotations(&template.template.id).await?;

    let mut samples = Vec::new();
    for annotation in &annotations {
        let extracted = annotation.extracted_data.as_ref().map(|data| &data.0);
        for label in &annotation.labels.0 {
            let Some(region) = template.region(&label.region_id) else {
                tracing::debug!(
                    annotation_id = %annotation.annotation_id,
                    region_id = %label.region_id,
                    "Skipping label for region outside the template"
                );
                continue;
            };
            let extraction = RegionExtraction::from_extracted(extracted, &region.id);
            samples.push(TrainingSample {
                region_id: region.id.clone(),
                text: extraction.text,
                question_type: region.question_type,
                expected_answer: region.expected_answer.clone(),
                label: label.correctness,
                score: label.score,
            });
        }
    }
    Ok(samples)
}

/// Registers an externally trained artifact as the next model version.
pub(crate) async fn seed_model(
    store: &dyn GradingStore,
    template_id: &str,
    artifact_url: &str,
    accuracy: f64,
    now: PrimitiveDateTime,
) -> Result<GradingModel, GradingError> {
    if artifact_url.trim().is_empty() {
        return Err(GradingError::validation("artifact_url must not be empty"));
    }
    if !accuracy.is_finite() || !(0.0..=1.0).contains(&accuracy) {
        return Err(GradingError::validation("accuracy must be within [0, 1]"));
    }

    let model = GradingModel {
        id: Uuid::new_v4().to_string(),
        template_id: template_id.to_string(),
        training_id: None,
        version: 0,
        artifact_url: artifact_url.trim().to_string(),
        accuracy,
        is_active: false,
        created_at: now,
        activated_at: None,
    };
    let created = store.insert_model(&model).await?;
    tracing::info!(model_id = %created.id, template_id, version = created.version, "Model seeded");
    Ok(created)
}

pub(crate) async fn list_models(
    store: &dyn GradingStore,
    template_id: &str,
) -> Result<Vec<GradingModel>, GradingError> {
    if store.find_template(template_id).await?.is_none() {
        return Err(GradingError::NotFound("template"));
    }
    Ok(store.list_models(template_id).await?)
}

pub(crate) async fn active_model(
    store: &dyn GradingStore,
    template_id: &str,
) -> Result<Option<GradingModel>, GradingError> {
    Ok(store.find_active_model(template_id).await?)
}

pub(crate) async fn activate_model(
    store: &dyn GradingStore,
    model_id: &str,
    now: PrimitiveDateTime,
) -> Result<GradingModel, GradingError> {
    let model = store.activate_model(model_id, now).await.map_err(|err| match err {
        StoreError::Conflict(reason) => {
            GradingError::Conflict(format!("model activation lost a concurrent update: {reason}"))
        }
        other => other.into(),
    })?;
    tracing::info!(model_id, template_id = %model.template_id, version = model.version, "Model activated");
    Ok(model)
}

pub(crate) async fn deactivate_model(
    store: &dyn GradingStore,
    model_id: &str,
) -> Result<GradingModel, GradingError> {
    let model = store.deactivate_model(model_id).await?;
    tracing::info!(model_id, template_id = %model.template_id, "Model deactivated");
    Ok(model)
}

pub(crate) fn training_timeout(settings: &Settings) -> Duration {
    Duration::from_secs(settings.ml().training_timeout_seconds)
}

fn validate_config(config: &TrainingConfig) -> Result<(), GradingError> {
    if !config.validation_split.is_finite()
        || config.validation_split <= 0.0
        || config.validation_split >= 1.0
    {
        return Err(GradingError::validation("validation_split must be within (0, 1)"));
    }
    if let Some(rate) = config.learning_rate {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(GradingError::validation("learning_rate must be positive"));
        }
    }
    if config.n_estimators == Some(0) || config.epochs == Some(0) || config.max_depth == Some(0) {
        return Err(GradingError::validation("n_estimators, epochs and max_depth must be positive"));
    }
    if config.hidden_layers.as_ref().is_some_and(|layers| layers.is_empty() || layers.contains(&0))
    {
        return Err(GradingError::validation("hidden_layers must list positive sizes"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::types::Correctness;
    use crate::store::MemoryStore;
    use crate::test_support::{self, ScriptedTraining};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn ten_annotations_train_version_one() {
        let store = MemoryStore::new();
        let template = test_support::seed_template(&store, &[("q1", 10.0)]).await;
        test_support::training_annotations(&store, &template, 5, Correctness::Correct).await;
        test_support::training_annotations(&store, &template, 5, Correctness::Incorrect).await;

        let session = start_training(
            &store,
            5,
            &template.template.id,
            "teacher-1",
            TrainingConfig::default(),
            primitive_now_utc(),
        )
        .await
        .expect("session");
        assert_eq!(session.status, RunStatus::Pending);

        let claimed = store.claim_next_training_session(primitive_now_utc()).await.unwrap().unwrap();
        let oracle = ScriptedTraining::succeeding(0.8);
        let model = run_training_session(&store, &oracle, TIMEOUT, &claimed).await.expect("train");

        assert_eq!(model.version, 1);
        assert!(!model.is_active);
        assert_eq!(model.artifact_url, format!("ml://models/{}", model.id));
        assert_eq!(oracle.sample_counts(), vec![10]);

        let session = store.find_training_session(&session.id).await.unwrap().unwrap();
        assert_eq!(session.status, RunStatus::Completed);
        assert_eq!(session.model_id.as_deref(), Some(model.id.as_str()));
        assert_eq!(session.metrics.expect("metrics").0.sample_count, 10);
    }

    #[tokio::test]
    async fn five_correct_annotations_train_version_one() {
        let store = MemoryStore::new();
        let template = test_support::seed_template(&store, &[("q1", 10.0)]).await;
        test_support::training_annotations(&store, &template, 5, Correctness::Correct).await;

        start_training(
            &store,
            5,
            &template.template.id,
            "teacher-1",
            TrainingConfig::default(),
            primitive_now_utc(),
        )
        .await
        .expect("session");
        let claimed = store.claim_next_training_session(primitive_now_utc()).await.unwrap().unwrap();
        let oracle = ScriptedTraining::succeeding(0.9);
        let model = run_training_session(&store, &oracle, TIMEOUT, &claimed).await.expect("train");

        assert_eq!(model.version, 1);
        assert_eq!(oracle.sample_counts(), vec![5]);
        assert!(store.find_active_model(&template.template.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn four_annotations_are_insufficient() {
        let store = MemoryStore::new();
        let template = test_support::seed_template(&store, &[("q1", 10.0)]).await;
        test_support::training_annotations(&store, &template, 4, Correctness::Correct).await;

        let err = start_training(
            &store,
            5,
            &template.template.id,
            "teacher-1",
            TrainingConfig::default(),
            primitive_now_utc(),
        )
        .await
        .expect_err("insufficient");

        assert!(matches!(
            err,
            GradingError::Precondition(Precondition::InsufficientTrainingData { required: 5, found: 4 })
        ));
        assert!(store.list_training_sessions(&template.template.id).await.unwrap().is_empty());
        assert!(store.list_models(&template.template.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oracle_failure_fails_session_without_model() {
        let store = MemoryStore::new();
        let template = test_support::seed_template(&store, &[("q1", 10.0)]).await;
        test_support::training_annotations(&store, &template, 5, Correctness::Correct).await;
        start_training(&store, 5, &template.template.id, "t", TrainingConfig::default(), primitive_now_utc())
            .await
            .expect("session");
        let claimed = store.claim_next_training_session(primitive_now_utc()).await.unwrap().unwrap();

        let oracle = ScriptedTraining::failing(OracleError::Status { status: 500, body: "boom".into() });
        let err = run_training_session(&store, &oracle, TIMEOUT, &claimed).await.expect_err("fail");
        assert!(matches!(err, GradingError::Oracle(_)));

        let session = store.find_training_session(&claimed.id).await.unwrap().unwrap();
        assert_eq!(session.status, RunStatus::Failed);
        assert!(session.error_message.unwrap().contains("boom"));
        assert!(store.list_models(&template.template.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn swept_session_discards_training_result() {
        let store = MemoryStore::new();
        let template = test_support::seed_template(&store, &[("q1", 10.0)]).await;
        test_support::training_annotations(&store, &template, 5, Correctness::Correct).await;
        start_training(&store, 5, &template.template.id, "t", TrainingConfig::default(), primitive_now_utc())
            .await
            .expect("session");
        let claimed = store.claim_next_training_session(primitive_now_utc()).await.unwrap().unwrap();
        store.fail_training(&claimed.id, "stale", primitive_now_utc()).await.unwrap();

        let err = run_training_session(&store, &ScriptedTraining::succeeding(0.9), TIMEOUT, &claimed)
            .await
            .expect_err("conflict");

        assert!(matches!(err, GradingError::Conflict(_)));
        assert!(store.list_models(&template.template.id).await.unwrap().is_empty());
        let session = store.find_training_session(&claimed.id).await.unwrap().unwrap();
        assert_eq!(session.error_message.as_deref(), Some("stale"));
    }

    #[tokio::test]
    async fn activation_keeps_exactly_one_active_model() {
        let store = MemoryStore::new();
        let template = test_support::seed_template(&store, &[("q1", 1.0)]).await;
        let template_id = template.template.id.as_str();
        let first = seed_model(&store, template_id, "ml://models/a", 0.7, primitive_now_utc())
            .await
            .expect("seed a");
        let second = seed_model(&store, template_id, "ml://models/b", 0.8, primitive_now_utc())
            .await
            .expect("seed b");
        assert_eq!((first.version, second.version), (1, 2));

        activate_model(&store, &first.id, primitive_now_utc()).await.expect("activate a");
        activate_model(&store, &second.id, primitive_now_utc()).await.expect("activate b");

        let active: Vec<_> =
            store.list_models(template_id).await.unwrap().into_iter().filter(|m| m.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);

        deactivate_model(&store, &second.id).await.expect("deactivate");
        assert!(active_model(&store, template_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_activation_never_leaves_two_active() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let template = test_support::seed_template(store.as_ref(), &[("q1", 1.0)]).await;
        let mut ids = Vec::new();
        for index in 0..8 {
            let model = seed_model(
                store.as_ref(),
                &template.template.id,
                &format!("ml://models/m{index}"),
                0.5,
                primitive_now_utc(),
            )
            .await
            .expect("seed");
            ids.push(model.id);
        }

        let mut tasks = tokio::task::JoinSet::new();
        for id in ids {
            let store = store.clone();
            tasks.spawn(async move { activate_model(store.as_ref(), &id, primitive_now_utc()).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.expect("join").expect("activate");
        }

        let active = store
            .list_models(&template.template.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|model| model.is_active)
            .count();
        assert_eq!(active, 1);
    }

    #[test]
    fn config_validation_rejects_out_of_range_split() {
        let config = TrainingConfig { validation_split: 1.0, ..TrainingConfig::default() };
        assert!(validate_config(&config).is_err());
        assert!(validate_config(&TrainingConfig::default()).is_ok());
    }
}
