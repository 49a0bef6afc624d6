use sqlx::{PgExecutor, PgPool};
use time::PrimitiveDateTime;

use crate::db::models::{CommittedResult, GradingResult};
use crate::db::types::{Correctness, RunStatus};

pub(crate) const COLUMNS: &str = "\
    id, job_id, sheet_id, region_id, predicted_correctness, confidence, assigned_score, \
    explanation, needs_review, reviewed_at, reviewed_by, teacher_override_score, \
    override_correctness, review_comment, created_at";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ResultContextRow {
    #[sqlx(flatten)]
    pub(crate) result: GradingResult,
    pub(crate) job_status: RunStatus,
    pub(crate) template_id: String,
    pub(crate) region_points: f64,
}

pub(crate) async fn insert_many(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    results: &[GradingResult],
) -> Result<(), sqlx::Error> {
    for result in results {
        sqlx::query(
            "INSERT INTO grading_results (
                id, job_id, sheet_id, region_id, predicted_correctness, confidence,
                assigned_score, explanation, needs_review, reviewed_at, reviewed_by,
                teacher_override_score, override_correctness, review_comment, created_at
             ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
        )
        .bind(&result.id)
        .bind(&result.job_id)
        .bind(&result.sheet_id)
        .bind(&result.region_id)
        .bind(result.predicted_correctness)
        .bind(result.confidence)
        .bind(result.assigned_score)
        .bind(&result.explanation)
        .bind(result.needs_review)
        .bind(result.reviewed_at)
        .bind(&result.reviewed_by)
        .bind(result.teacher_override_score)
        .bind(result.override_correctness)
        .bind(&result.review_comment)
        .bind(result.created_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub(crate) async fn find_with_context(
    pool: &PgPool,
    id: &str,
) -> Result<Option<ResultContextRow>, sqlx::Error> {
    sqlx::query_as::<_, ResultContextRow>(
        "SELECT gr.id, gr.job_id, gr.sheet_id, gr.region_id, gr.predicted_correctness,
                gr.confidence, gr.assigned_score, gr.explanation, gr.needs_review,
                gr.reviewed_at, gr.reviewed_by, gr.teacher_override_score,
                gr.override_correctness, gr.review_comment, gr.created_at,
                j.status AS job_status, j.template_id, r.points AS region_points
         FROM grading_results gr
         JOIN grading_jobs j ON j.id = gr.job_id
         JOIN regions r ON r.id = gr.region_id
         WHERE gr.id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn list_for_job(
    pool: &PgPool,
    job_id: &str,
    needs_review: Option<bool>,
) -> Result<Vec<GradingResult>, sqlx::Error> {
    sqlx::query_as::<_, GradingResult>(&format!(
        "SELECT {COLUMNS} FROM grading_results
         WHERE job_id = $1 AND ($2::boolean IS NULL OR needs_review = $2)
         ORDER BY sheet_id, created_at, id"
    ))
    .bind(job_id)
    .bind(needs_review)
    .fetch_all(pool)
    .await
}

pub(crate) async fn list_review_queue(
    pool: &PgPool,
    template_id: &str,
) -> Result<Vec<GradingResult>, sqlx::Error> {
    sqlx::query_as::<_, GradingResult>(
        "SELECT gr.id, gr.job_id, gr.sheet_id, gr.region_id, gr.predicted_correctness,
                gr.confidence, gr.assigned_score, gr.explanation, gr.needs_review,
                gr.reviewed_at, gr.reviewed_by, gr.teacher_override_score,
                gr.override_correctness, gr.review_comment, gr.created_at
         FROM grading_results gr
         JOIN grading_jobs j ON j.id = gr.job_id
         WHERE j.template_id = $1 AND j.status = $2 AND gr.needs_review
         ORDER BY gr.confidence, gr.created_at, gr.id",
    )
    .bind(template_id)
    .bind(RunStatus::Completed)
    .fetch_all(pool)
    .await
}

pub(crate) async fn accept(
    executor: impl PgExecutor<'_>,
    id: &str,
    reviewed_by: &str,
    reviewed_at: PrimitiveDateTime,
) -> Result<Option<GradingResult>, sqlx::Error> {
    sqlx::query_as::<_, GradingResult>(&format!(
        "UPDATE grading_results
         SET needs_review = FALSE,
             reviewed_at = COALESCE(reviewed_at, $2),
             reviewed_by = COALESCE(reviewed_by, $3)
         WHERE id = $1
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(reviewed_at)
    .bind(reviewed_by)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn apply_override(
    executor: impl PgExecutor<'_>,
    id: &str,
    reviewed_by: &str,
    reviewed_at: PrimitiveDateTime,
    score: f64,
    correctness: Correctness,
    comment: Option<&str>,
) -> Result<Option<GradingResult>, sqlx::Error> {
    sqlx::query_as::<_, GradingResult>(&format!(
        "UPDATE grading_results
         SET needs_review = FALSE,
             reviewed_at = $2,
             reviewed_by = $3,
             teacher_override_score = $4,
             assigned_score = $4,
             override_correctness = $5,
             review_comment = $6
         WHERE id = $1
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(reviewed_at)
    .bind(reviewed_by)
    .bind(score)
    .bind(correctness)
    .bind(comment)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn list_committed(
    pool: &PgPool,
    template_id: &str,
) -> Result<Vec<CommittedResult>, sqlx::Error> {
    sqlx::query_as::<_, CommittedResult>(
        "SELECT gr.job_id, gr.sheet_id, gr.region_id,
                COALESCE(gr.override_correctness, gr.predicted_correctness) AS correctness,
                gr.assigned_score, j.created_at AS job_created_at
         FROM grading_results gr
         JOIN grading_jobs j ON j.id = gr.job_id
         WHERE j.template_id = $1 AND j.status = $2
         ORDER BY gr.sheet_id, j.created_at, gr.region_id",
    )
    .bind(template_id)
    .bind(RunStatus::Completed)
    .fetch_all(pool)
    .await
}
