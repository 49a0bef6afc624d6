use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool};
use time::PrimitiveDateTime;

use crate::db::models::{TrainingMetrics, TrainingSession};
use crate::db::types::RunStatus;

pub(crate) const COLUMNS: &str = "\
    id, template_id, teacher_id, status, config, metrics, error_message, model_id, created_at, \
    started_at, completed_at";

pub(crate) async fn insert(pool: &PgPool, session: &TrainingSession) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO training_sessions (
            id, template_id, teacher_id, status, config, metrics, error_message, model_id,
            created_at, started_at, completed_at
         ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
    )
    .bind(&session.id)
    .bind(&session.template_id)
    .bind(&session.teacher_id)
    .bind(session.status)
    .bind(&session.config)
    .bind(&session.metrics)
    .bind(&session.error_message)
    .bind(&session.model_id)
    .bind(session.created_at)
    .bind(session.started_at)
    .bind(session.completed_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn find(pool: &PgPool, id: &str) -> Result<Option<TrainingSession>, sqlx::Error> {
    sqlx::query_as::<_, TrainingSession>(&format!(
        "SELECT {COLUMNS} FROM training_sessions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn list_for_template(
    pool: &PgPool,
    template_id: &str,
) -> Result<Vec<TrainingSession>, sqlx::Error> {
    sqlx::query_as::<_, TrainingSession>(&format!(
        "SELECT {COLUMNS} FROM training_sessions WHERE template_id = $1 ORDER BY created_at DESC"
    ))
    .bind(template_id)
    .fetch_all(pool)
    .await
}

pub(crate) async fn claim_next(
    pool: &PgPool,
    now: PrimitiveDateTime,
) -> Result<Option<TrainingSession>, sqlx::Error> {
    sqlx::query_as::<_, TrainingSession>(&format!(
        "WITH candidate AS (
            SELECT id
            FROM training_sessions
            WHERE status = $1
            ORDER BY created_at
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        UPDATE training_sessions
        SET status = $2,
            started_at = $3
        FROM candidate
        WHERE training_sessions.id = candidate.id
        RETURNING {}",
        prefixed_columns()
    ))
    .bind(RunStatus::Pending)
    .bind(RunStatus::Running)
    .bind(now)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn complete(
    executor: impl PgExecutor<'_>,
    id: &str,
    metrics: &TrainingMetrics,
    model_id: &str,
    now: PrimitiveDateTime,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "UPDATE training_sessions
         SET status = $2, metrics = $3, model_id = $4, completed_at = $5, error_message = NULL
         WHERE id = $1 AND status = $6
         RETURNING id",
    )
    .bind(id)
    .bind(RunStatus::Completed)
    .bind(Json(metrics))
    .bind(model_id)
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
        "UPDATE training_sessions
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
        "UPDATE training_sessions
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

fn prefixed_columns() -> String {
    COLUMNS
        .split(',')
        .map(|column| format!("training_sessions.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
