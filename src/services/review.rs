use serde::Serialize;
use sqlx::types::Json;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::models::{Annotation, GradingResult, Markup, QuestionLabel};
use crate::db::types::{Correctness, RunStatus};
use crate::services::errors::GradingError;
use crate::store::{GradingStore, OverrideUpdate, ResultContext, ReviewUpdate};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ReviewAction {
    Accept,
    Override { score: f64, correctness: Correctness, comment: Option<String> },
}

impl ReviewAction {
    fn as_str(&self) -> &'static str {
        match self {
            ReviewAction::Accept => "accept",
            ReviewAction::Override { .. } => "override",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct BulkFailure {
    pub(crate) result_id: String,
    pub(crate) detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub(crate) struct BulkReviewOutcome {
    pub(crate) updated: usize,
    pub(crate) failed: usize,
    pub(crate) errors: Vec<BulkFailure>,
    /// Templates whose reports changed, in first-reviewed order.
    #[serde(skip)]
    pub(crate) templates: Vec<String>,
}

/// A reviewed result and the template its reports belong to.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Reviewed {
    pub(crate) result: GradingResult,
    pub(crate) template_id: String,
}

/// Applies a teacher decision to one result of a completed job.
pub(crate) async fn review_result(
    store: &dyn GradingStore,
    result_id: &str,
    teacher_id: &str,
    action: &ReviewAction,
    now: PrimitiveDateTime,
) -> Result<Reviewed, GradingError> {
    let context = store.find_result(result_id).await?.ok_or(GradingError::NotFound("result"))?;
    if context.job_status != RunStatus::Completed {
        return Err(GradingError::Conflict(format!(
            "grading job is {}; only results of completed jobs are reviewable",
            context.job_status.as_str()
        )));
    }

    let override_with = match action {
        ReviewAction::Accept => {
            if context.result.reviewed_at.is_some() && !context.result.needs_review {
                return Ok(Reviewed { result: context.result, template_id: context.template_id });
            }
            None
        }
        ReviewAction::Override { score, correctness, comment } => {
            if !score.is_finite() || *score < 0.0 || *score > context.region_points {
                return Err(GradingError::validation(format!(
                    "score must be within [0, {}]",
                    context.region_points
                )));
            }
            Some(OverrideUpdate {
                score: *score,
                correctness: *correctness,
                comment: comment.as_ref().map(|text| text.trim().to_string()).filter(|t| !t.is_empty()),
            })
        }
    };

    let update = ReviewUpdate { reviewed_by: teacher_id.to_string(), reviewed_at: now, override_with };
    let reviewed = store.apply_review(result_id, &update).await?;
    metrics::counter!("reviews_total", "action" => action.as_str()).increment(1);

    if let Some(change) = &update.override_with {
        if let Err(err) = record_override(store, &context, teacher_id, change, now).await {
            tracing::warn!(
                result_id,
                sheet_id = %context.result.sheet_id,
                error = %err,
                "Failed to record review override as training data"
            );
        }
    }

    tracing::info!(
        result_id,
        template_id = %context.template_id,
        action = action.as_str(),
        "Result reviewed"
    );
    Ok(Reviewed { result: reviewed, template_id: context.template_id })
}

async fn record_override(
    store: &dyn GradingStore,
    context: &ResultContext,
    teacher_id: &str,
    change: &OverrideUpdate,
    now: PrimitiveDateTime,
) -> Result<(), GradingError> {
    let label = QuestionLabel {
        region_id: context.result.region_id.clone(),
        correctness: change.correctness,
        score: change.score,
        confidence: Some(1.0),
        comment: change.comment.clone(),
    };
    let annotation = Annotation {
        id: Uuid::new_v4().to_string(),
        sheet_id: context.result.sheet_id.clone(),
        teacher_id: teacher_id.to_string(),
        markup: Json(Markup::ReviewOverride { result_id: context.result.id.clone() }),
        is_training_data: true,
        labels: Json(vec![label]),
        created_at: now,
        updated_at: now,
    };
    store.insert_annotation(&annotation).await?;
    Ok(())
}

/// Reviews each result independently; one failure never stops the batch.
pub(crate) async fn bulk_review(
    store: &dyn GradingStore,
    result_ids: &[String],
    teacher_id: &str,
    action: &ReviewAction,
    now: PrimitiveDateTime,
) -> Result<BulkReviewOutcome, GradingError> {
    if result_ids.is_empty() {
        return Err(GradingError::validation("result_ids must not be empty"));
    }

    let mut outcome = BulkReviewOutcome::default();
    for result_id in result_ids {
        match review_result(store, result_id, teacher_id, action, now).await {
            Ok(reviewed) => {
                outcome.updated += 1;
                if !outcome.templates.contains(&reviewed.template_id) {
                    outcome.templates.push(reviewed.template_id);
                }
            }
            Err(err) => {
                outcome.failed += 1;
                outcome.errors.push(BulkFailure { result_id: result_id.clone(), detail: err.to_string() });
            }
        }
    }

    tracing::info!(
        teacher_id,
        action = action.as_str(),
        updated = outcome.updated,
        failed = outcome.failed,
        "Bulk review finished"
    );
    Ok(outcome)
}

pub(crate) async fn review_queue(
    store: &dyn GradingStore,
    template_id: &str,
) -> Result<Vec<GradingResult>, GradingError> {
    if store.find_template(template_id).await?.is_none() {
        return Err(GradingError::NotFound("template"));
    }
    Ok(store.list_review_queue(template_id).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::primitive_now_utc;
    use crate::store::MemoryStore;
    use crate::test_support;

    fn override_to(score: f64) -> ReviewAction {
        ReviewAction::Override {
            score,
            correctness: Correctness::Partial,
            comment: Some("  shows working  ".to_string()),
        }
    }

    #[tokio::test]
    async fn bulk_review_counts_each_result_independently() {
        let fixture = test_support::graded_fixture(&[0.6]).await;
        let ids = vec![fixture.results[0].id.clone(), "missing".to_string()];

        let outcome = bulk_review(
            fixture.store.as_ref(),
            &ids,
            "teacher-1",
            &ReviewAction::Accept,
            primitive_now_utc(),
        )
        .await
        .expect("bulk");

        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.errors[0].result_id, "missing");
        assert_eq!(outcome.errors[0].detail, "result not found");
        assert_eq!(outcome.templates, vec![fixture.template.template.id.clone()]);
    }

    #[tokio::test]
    async fn bulk_review_names_each_touched_template_once() {
        let first = test_support::graded_fixture(&[0.6, 0.7]).await;
        let second = test_support::graded_fixture_in(first.store.clone(), &[0.5]).await;
        let store = first.store.as_ref();
        let ids = vec![
            first.results[0].id.clone(),
            second.results[0].id.clone(),
            first.results[1].id.clone(),
        ];

        let outcome = bulk_review(store, &ids, "teacher-1", &ReviewAction::Accept, primitive_now_utc())
            .await
            .expect("bulk");

        assert_eq!(outcome.updated, 3);
        assert_eq!(
            outcome.templates,
            vec![first.template.template.id.clone(), second.template.template.id.clone()]
        );
        let single = review_result(store, &ids[1], "teacher-1", &ReviewAction::Accept, primitive_now_utc())
            .await
            .expect("accept");
        assert_eq!(single.template_id, second.template.template.id);
        assert!(serde_json::to_value(&outcome).unwrap().get("templates").is_none());
    }

    #[tokio::test]
    async fn accepting_twice_keeps_the_first_review_time() {
        let fixture = test_support::graded_fixture(&[0.6]).await;
        let store = fixture.store.as_ref();
        let result_id = fixture.results[0].id.clone();
        let first_at = primitive_now_utc();

        let first = review_result(store, &result_id, "teacher-1", &ReviewAction::Accept, first_at)
            .await
            .expect("accept")
            .result;
        let later = first_at + time::Duration::minutes(5);
        let second = review_result(store, &result_id, "teacher-2", &ReviewAction::Accept, later)
            .await
            .expect("accept again")
            .result;

        assert!(!first.needs_review);
        assert_eq!(first.reviewed_at, Some(first_at));
        assert_eq!(second, first);
        assert_eq!(second.assigned_score, fixture.results[0].assigned_score);
        assert!(review_queue(store, &fixture.template.template.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn override_updates_score_and_feeds_training_data() {
        let fixture = test_support::graded_fixture(&[0.6]).await;
        let store = fixture.store.as_ref();
        let result = &fixture.results[0];
        let before = store.count_training_annotations(&fixture.template.template.id).await.unwrap();

        let reviewed = review_result(store, &result.id, "teacher-1", &override_to(4.5), primitive_now_utc())
            .await
            .expect("override")
            .result;

        assert_eq!(reviewed.assigned_score, 4.5);
        assert_eq!(reviewed.teacher_override_score, Some(4.5));
        assert_eq!(reviewed.override_correctness, Some(Correctness::Partial));
        assert_eq!(reviewed.review_comment.as_deref(), Some("shows working"));
        assert_eq!(reviewed.effective_correctness(), Correctness::Partial);

        let annotations = store.list_annotations(&result.sheet_id).await.unwrap();
        let recorded = annotations
            .iter()
            .find(|annotation| {
                matches!(&annotation.markup.0, Markup::ReviewOverride { result_id } if *result_id == result.id)
            })
            .expect("override annotation");
        assert!(recorded.is_training_data);
        assert_eq!(recorded.labels.0[0].score, 4.5);
        assert_eq!(recorded.labels.0[0].region_id, result.region_id);
        assert_eq!(
            store.count_training_annotations(&fixture.template.template.id).await.unwrap(),
            before + 1
        );
    }

    #[tokio::test]
    async fn override_score_must_fit_the_region() {
        let fixture = test_support::graded_fixture(&[0.6]).await;
        let store = fixture.store.as_ref();
        let result_id = &fixture.results[0].id;

        for score in [-0.5, 10.5, f64::NAN] {
            let err = review_result(store, result_id, "t", &override_to(score), primitive_now_utc())
                .await
                .expect_err("out of range");
            assert!(matches!(err, GradingError::Validation(_)));
        }
        let untouched = store.find_result(result_id).await.unwrap().expect("result");
        assert!(untouched.result.needs_review);
        assert!(untouched.result.reviewed_at.is_none());
    }

    #[tokio::test]
    async fn results_of_unfinished_jobs_are_not_reviewable() {
        let store = MemoryStore::new();
        let template = test_support::seed_template(&store, &[("q1", 10.0)]).await;
        let template_id = template.template.id.clone();
        test_support::seed_active_model(&store, &template_id).await;
        let sheet = test_support::processed_sheet(&store, &template, "x").await;
        let job = crate::services::grading::start_grading(
            &store,
            &template_id,
            "t",
            vec![sheet.id.clone(), test_support::processed_sheet(&store, &template, "y").await.id],
            primitive_now_utc(),
        )
        .await
        .expect("job");
        store.claim_next_grading_job(primitive_now_utc()).await.unwrap().expect("claimed");
        let result = test_support::sample_result(&job.id, &sheet.id, &template.regions[0].id);
        store.commit_sheet_results(&job.id, &[result.clone()]).await.expect("commit");

        let err = review_result(&store, &result.id, "t", &ReviewAction::Accept, primitive_now_utc())
            .await
            .expect_err("running job");

        assert!(matches!(err, GradingError::Conflict(_)));
        assert!(matches!(
            bulk_review(&store, &[], "t", &ReviewAction::Accept, primitive_now_utc()).await,
            Err(GradingError::Validation(_))
        ));
    }
}
