use sqlx::{PgExecutor, PgPool};
use time::PrimitiveDateTime;

use crate::db::models::GradingJob;
use crate::db::types::RunStatus;

pub(crate) const COLUMNS: &str = "\
    id, template_id, model_id, teacher_id, status, total_sheets, processed_sheets, \
    error_message, created_at, started_at, completed_at";

pub(crate) async fn insert(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job: &GradingJob,
    sheet_ids: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO grading_jobs (
            id, template_id, model_id, teacher_id, status, total_sheets, processed_sheets,
            error_message, created_at, started_at, completed_at
         ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
    )
    .bind(&job.id)
    .bind(&job.template_id)
    .bind(&job.model_id)
    .bind(&job.teacher_id)
    .bind(job.status)
    .bind(job.total_sheets)
    .bind(job.processed_sheets)
    .bind(&job.error_message)
    .bind(job.created_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        "INSERT INTO grading_job_sheets (job_id, sheet_id)
         SELECT $1, sheet_id FROM UNNEST($2::text[]) AS sheet_id",
    )
    .bind(&job.id)
    .bind(sheet_ids)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub(crate) async fn find(pool: &PgPool, id: &str) -> Result<Option<GradingJob>, sqlx::Error> {
    sqlx::query_as::<_, GradingJob>(&format!("SELECT {COLUMNS} FROM grading_jobs WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn list_for_template(
    pool: &PgPool,
    template_id: &str,
) -> Result<Vec<GradingJob>, sqlx::Error> {
    sqlx::query_as::<_, GradingJob>(&format!(
        "SELECT {COLUMNS} FROM grading_jobs WHERE template_id = $1 ORDER BY created_at DESC"
    ))
    .bind(template_id)
    .fetch_all(pool)
    .await
}

pub(crate) async fn list_sheet_ids(pool: &PgPool, job_id: &str) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT sheet_id FROM grading_job_sheets WHERE job_id = $1 ORDER BY sheet_id",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
}

pub(crate) async fn claim_next(
    pool: &PgPool,
    now: PrimitiveDateTime,
) -> Result<Option<GradingJob>, sqlx::Error> {
    let returning = COLUMNS
        .split(',')
        .map(|column| format!("grading_jobs.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ");

    sqlx::query_as::<_, GradingJob>(&format!(
        "WITH candidate AS (
            SELECT id
            FROM grading_jobs
            WHERE status = $1
            ORDER BY created_at
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        UPDATE grading_jobs
        SET status = $2,
            started_at = $3
        FROM candidate
        WHERE grading_jobs.id = candidate.id
        RETURNING {returning}"
    ))
    .bind(RunStatus::Pending)
    .bind(RunStatus::Running)
    .bind(now)
    .fetch_optional(pool)
    .await
}

/// Atomic in-SQL increment; `None` when the job is not running.
pub(crate) async fn increment_processed(
    executor: impl PgExecutor<'_>,
    id: &str,
) -> Result<Option<i32>, sqlx::Error> {
    sqlx::query_scalar::<_, i32>(
        "UPDATE grading_jobs
         SET processed_sheets = processed_sheets + 1
         WHERE id = $1 AND status = $2 AND processed_sheets < total_sheets
         RETURNING processed_sheets",
    )
    .bind(id)
    .bind(RunStatus::Running)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn complete(
    executor: impl PgExecutor<'_>,
    id: &str,
    now: PrimitiveDateTime,
) -> Result<Option<GradingJob>, sqlx::Error> {
    sqlx::query_as::<_, GradingJob>(&format!(
        "UPDATE grading_jobs
         SET status = $2, completed_at = $3, error_message = NULL
         WHERE id = $1 AND status = $4
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(RunStatus::Completed)
    .bind(now)
    .bind(RunStatus::Running)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn fail(
    pool: &PgPool,
    id: &str,
    message: &str,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE grading_jobs
         SET status = $2, error_message = $3, completed_at = $4
         WHERE id = $1 AND status IN ($5, $6)",
    )
    .bind(id)
    .bind(RunStatus::Failed)
    .bind(message)
    .bind(now)
    .bind(RunStatus::Pending)
    .bind(RunStatus::Running)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn fail_stale(
    pool: &PgPool,
    cutoff: PrimitiveDateTime,
    message: &str,
    now: PrimitiveDateTime,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE grading_jobs
         SET status = $1, error_message = $2, completed_at = $3
         WHERE status IN ($4, $5)
           AND COALESCE(started_at, created_at) < $6",
    )
    .bind(RunStatus::Failed)
    .bind(message)
    .bind(now)
    .bind(RunStatus::Pending)
    .bind(RunStatus::Running)
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
