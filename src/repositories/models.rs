use sqlx::{PgExecutor, PgPool};
use time::PrimitiveDateTime;

use crate::db::models::GradingModel;

pub(crate) const COLUMNS: &str = "\
    id, template_id, training_id, version, artifact_url, accuracy, is_active, created_at, \
    activated_at";

/// Inserts with `version = max + 1` computed in the same statement.
pub(crate) async fn insert_next_version(
    executor: impl PgExecutor<'_>,
    model: &GradingModel,
) -> Result<GradingModel, sqlx::Error> {
    sqlx::query_as::<_, GradingModel>(&format!(
        "INSERT INTO models (
            id, template_id, training_id, version, artifact_url, accuracy, is_active, created_at,
            activated_at
         )
         SELECT $1, $2, $3, COALESCE(MAX(version), 0) + 1, $4, $5, FALSE, $6, NULL
         FROM models WHERE template_id = $2
         RETURNING {COLUMNS}"
    ))
    .bind(&model.id)
    .bind(&model.template_id)
    .bind(&model.training_id)
    .bind(&model.artifact_url)
    .bind(model.accuracy)
    .bind(model.created_at)
    .fetch_one(executor)
    .await
}

pub(crate) async fn find(
    executor: impl PgExecutor<'_>,
    id: &str,
) -> Result<Option<GradingModel>, sqlx::Error> {
    sqlx::query_as::<_, GradingModel>(&format!("SELECT {COLUMNS} FROM models WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn list_for_template(
    pool: &PgPool,
    template_id: &str,
) -> Result<Vec<GradingModel>, sqlx::Error> {
    sqlx::query_as::<_, GradingModel>(&format!(
        "SELECT {COLUMNS} FROM models WHERE template_id = $1 ORDER BY version DESC"
    ))
    .bind(template_id)
    .fetch_all(pool)
    .await
}

pub(crate) async fn find_active(
    pool: &PgPool,
    template_id: &str,
) -> Result<Option<GradingModel>, sqlx::Error> {
    sqlx::query_as::<_, GradingModel>(&format!(
        "SELECT {COLUMNS} FROM models WHERE template_id = $1 AND is_active"
    ))
    .bind(template_id)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn deactivate_others(
    executor: impl PgExecutor<'_>,
    template_id: &str,
    keep_id: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE models SET is_active = FALSE WHERE template_id = $1 AND id <> $2 AND is_active",
    )
    .bind(template_id)
    .bind(keep_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn set_active(
    executor: impl PgExecutor<'_>,
    id: &str,
    active: bool,
    now: Option<PrimitiveDateTime>,
) -> Result<Option<GradingModel>, sqlx::Error> {
    sqlx::query_as::<_, GradingModel>(&format!(
        "UPDATE models
         SET is_active = $2,
             activated_at = CASE WHEN $2 AND NOT is_active THEN $3 ELSE activated_at END
         WHERE id = $1
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(active)
    .bind(now)
    .fetch_optional(executor)
    .await
}
