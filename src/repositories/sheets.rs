use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool};
use time::PrimitiveDateTime;

use crate::db::models::Sheet;
use crate::db::types::SheetStatus;

pub(crate) const COLUMNS: &str = "\
    id, template_id, student_id, original_url, status, extracted_data, error_message, created_at, \
    updated_at";

pub(crate) async fn insert(pool: &PgPool, sheet: &Sheet) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO sheets (
            id, template_id, student_id, original_url, status, extracted_data, error_message,
            created_at, updated_at
         ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)",
    )
    .bind(&sheet.id)
    .bind(&sheet.template_id)
    .bind(&sheet.student_id)
    .bind(&sheet.original_url)
    .bind(sheet.status)
    .bind(&sheet.extracted_data)
    .bind(&sheet.error_message)
    .bind(sheet.created_at)
    .bind(sheet.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn find(
    executor: impl PgExecutor<'_>,
    id: &str,
) -> Result<Option<Sheet>, sqlx::Error> {
    sqlx::query_as::<_, Sheet>(&format!("SELECT {COLUMNS} FROM sheets WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn find_many(pool: &PgPool, ids: &[String]) -> Result<Vec<Sheet>, sqlx::Error> {
    sqlx::query_as::<_, Sheet>(&format!("SELECT {COLUMNS} FROM sheets WHERE id = ANY($1)"))
        .bind(ids)
        .fetch_all(pool)
        .await
}

pub(crate) async fn list(
    pool: &PgPool,
    template_id: &str,
    status: Option<SheetStatus>,
) -> Result<Vec<Sheet>, sqlx::Error> {
    sqlx::query_as::<_, Sheet>(&format!(
        "SELECT {COLUMNS} FROM sheets
         WHERE template_id = $1 AND ($2::sheetstatus IS NULL OR status = $2)
         ORDER BY created_at, id"
    ))
    .bind(template_id)
    .bind(status)
    .fetch_all(pool)
    .await
}

pub(crate) async fn record_extraction(
    executor: impl PgExecutor<'_>,
    id: &str,
    extracted_data: &serde_json::Value,
    now: PrimitiveDateTime,
) -> Result<Option<Sheet>, sqlx::Error> {
    sqlx::query_as::<_, Sheet>(&format!(
        "UPDATE sheets
         SET status = $2, extracted_data = $3, error_message = NULL, updated_at = $4
         WHERE id = $1 AND status IN ($5, $6) AND extracted_data IS NULL
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(SheetStatus::Processed)
    .bind(Json(extracted_data))
    .bind(now)
    .bind(SheetStatus::Uploaded)
    .bind(SheetStatus::Error)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn mark_error(
    executor: impl PgExecutor<'_>,
    id: &str,
    reason: &str,
    now: PrimitiveDateTime,
) -> Result<Option<Sheet>, sqlx::Error> {
    sqlx::query_as::<_, Sheet>(&format!(
        "UPDATE sheets SET status = $2, error_message = $3, updated_at = $4
         WHERE id = $1 AND status = $5
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(SheetStatus::Error)
    .bind(reason)
    .bind(now)
    .bind(SheetStatus::Uploaded)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn mark_annotated(
    executor: impl PgExecutor<'_>,
    id: &str,
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE sheets SET status = $2, updated_at = $3 WHERE id = $1 AND status = $4")
        .bind(id)
        .bind(SheetStatus::Annotated)
        .bind(now)
        .bind(SheetStatus::Processed)
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn mark_job_sheets_graded(
    executor: impl PgExecutor<'_>,
    job_id: &str,
    now: PrimitiveDateTime,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE sheets SET status = $2, updated_at = $3
         WHERE id IN (SELECT sheet_id FROM grading_job_sheets WHERE job_id = $1)
           AND status IN ($4, $5)",
    )
    .bind(job_id)
    .bind(SheetStatus::Graded)
    .bind(now)
    .bind(SheetStatus::Processed)
    .bind(SheetStatus::Annotated)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}
