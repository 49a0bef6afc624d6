use sqlx::{PgExecutor, PgPool};
use time::PrimitiveDateTime;

use crate::db::models::{Region, Template};

pub(crate) const TEMPLATE_COLUMNS: &str =
    "id, name, version, pass_threshold, created_by, created_at, updated_at";

pub(crate) const REGION_COLUMNS: &str = "\
    id, template_id, label, question_type, points, x, y, width, height, order_index, \
    expected_answer";

pub(crate) async fn insert(
    executor: impl PgExecutor<'_>,
    template: &Template,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO templates (id, name, version, pass_threshold, created_by, created_at, updated_at)
         VALUES ($1,$2,$3,$4,$5,$6,$7)",
    )
    .bind(&template.id)
    .bind(&template.name)
    .bind(template.version)
    .bind(template.pass_threshold)
    .bind(&template.created_by)
    .bind(template.created_at)
    .bind(template.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn insert_regions(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    regions: &[Region],
) -> Result<(), sqlx::Error> {
    for region in regions {
        sqlx::query(
            "INSERT INTO regions (
                id, template_id, label, question_type, points, x, y, width, height, order_index,
                expected_answer
             ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
        )
        .bind(&region.id)
        .bind(&region.template_id)
        .bind(&region.label)
        .bind(region.question_type)
        .bind(region.points)
        .bind(region.bbox.x)
        .bind(region.bbox.y)
        .bind(region.bbox.width)
        .bind(region.bbox.height)
        .bind(region.order_index)
        .bind(&region.expected_answer)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub(crate) async fn find(
    executor: impl PgExecutor<'_>,
    id: &str,
) -> Result<Option<Template>, sqlx::Error> {
    sqlx::query_as::<_, Template>(&format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

/// Row lock serializing activation and layout changes per template.
pub(crate) async fn lock(
    executor: impl PgExecutor<'_>,
    id: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>("SELECT id FROM templates WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn list(pool: &PgPool) -> Result<Vec<Template>, sqlx::Error> {
    sqlx::query_as::<_, Template>(&format!(
        "SELECT {TEMPLATE_COLUMNS} FROM templates ORDER BY name, version"
    ))
    .fetch_all(pool)
    .await
}

pub(crate) async fn latest_version(pool: &PgPool, name: &str) -> Result<i32, sqlx::Error> {
    sqlx::query_scalar::<_, Option<i32>>("SELECT MAX(version) FROM templates WHERE name = $1")
        .bind(name)
        .fetch_one(pool)
        .await
        .map(|value| value.unwrap_or(0))
}

pub(crate) async fn list_regions(
    executor: impl PgExecutor<'_>,
    template_id: &str,
) -> Result<Vec<Region>, sqlx::Error> {
    sqlx::query_as::<_, Region>(&format!(
        "SELECT {REGION_COLUMNS} FROM regions WHERE template_id = $1 ORDER BY order_index, label"
    ))
    .bind(template_id)
    .fetch_all(executor)
    .await
}

pub(crate) async fn has_results(
    executor: impl PgExecutor<'_>,
    template_id: &str,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (
            SELECT 1 FROM grading_jobs
            WHERE template_id = $1 AND status <> 'failed'
         ) OR EXISTS (
            SELECT 1 FROM grading_results gr
            JOIN regions r ON r.id = gr.region_id
            WHERE r.template_id = $1
         )",
    )
    .bind(template_id)
    .fetch_one(executor)
    .await
}

pub(crate) async fn delete_regions(
    executor: impl PgExecutor<'_>,
    template_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM regions WHERE template_id = $1")
        .bind(template_id)
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn touch(
    executor: impl PgExecutor<'_>,
    id: &str,
    now: PrimitiveDateTime,
) -> Result<Option<Template>, sqlx::Error> {
    sqlx::query_as::<_, Template>(&format!(
        "UPDATE templates SET updated_at = $2 WHERE id = $1 RETURNING {TEMPLATE_COLUMNS}"
    ))
    .bind(id)
    .bind(now)
    .fetch_optional(executor)
    .await
}

/// Child tables cascade from `templates`; the explicit order keeps the
/// deletion independent of foreign key settings.
pub(crate) async fn delete_cascade(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: &str,
) -> Result<bool, sqlx::Error> {
    for statement in [
        "DELETE FROM grading_results WHERE job_id IN (SELECT id FROM grading_jobs WHERE template_id = $1)",
        "DELETE FROM grading_job_sheets WHERE job_id IN (SELECT id FROM grading_jobs WHERE template_id = $1)",
        "DELETE FROM grading_jobs WHERE template_id = $1",
        "DELETE FROM models WHERE template_id = $1",
        "DELETE FROM training_sessions WHERE template_id = $1",
        "DELETE FROM annotations WHERE sheet_id IN (SELECT id FROM sheets WHERE template_id = $1)",
        "DELETE FROM sheets WHERE template_id = $1",
        "DELETE FROM regions WHERE template_id = $1",
    ] {
        sqlx::query(statement).bind(id).execute(&mut **tx).await?;
    }

    let result = sqlx::query("DELETE FROM templates WHERE id = $1").bind(id).execute(&mut **tx).await?;
    Ok(result.rows_affected() > 0)
}
