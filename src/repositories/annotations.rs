use sqlx::{PgExecutor, PgPool};

use crate::db::models::{Annotation, TrainingAnnotation};

pub(crate) const COLUMNS: &str =
    "id, sheet_id, teacher_id, markup, is_training_data, labels, created_at, updated_at";

pub(crate) async fn insert(
    executor: impl PgExecutor<'_>,
    annotation: &Annotation,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO annotations (
            id, sheet_id, teacher_id, markup, is_training_data, labels, created_at, updated_at
         ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
    )
    .bind(&annotation.id)
    .bind(&annotation.sheet_id)
    .bind(&annotation.teacher_id)
    .bind(&annotation.markup)
    .bind(annotation.is_training_data)
    .bind(&annotation.labels)
    .bind(annotation.created_at)
    .bind(annotation.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn find(pool: &PgPool, id: &str) -> Result<Option<Annotation>, sqlx::Error> {
    sqlx::query_as::<_, Annotation>(&format!("SELECT {COLUMNS} FROM annotations WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn update(
    pool: &PgPool,
    annotation: &Annotation,
) -> Result<Option<Annotation>, sqlx::Error> {
    sqlx::query_as::<_, Annotation>(&format!(
        "UPDATE annotations
         SET markup = $2, is_training_data = $3, labels = $4, updated_at = $5
         WHERE id = $1
         RETURNING {COLUMNS}"
    ))
    .bind(&annotation.id)
    .bind(&annotation.markup)
    .bind(annotation.is_training_data)
    .bind(&annotation.labels)
    .bind(annotation.updated_at)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn delete(pool: &PgPool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM annotations WHERE id = $1").bind(id).execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn list_for_sheet(
    pool: &PgPool,
    sheet_id: &str,
) -> Result<Vec<Annotation>, sqlx::Error> {
    sqlx::query_as::<_, Annotation>(&format!(
        "SELECT {COLUMNS} FROM annotations WHERE sheet_id = $1 ORDER BY created_at, id"
    ))
    .bind(sheet_id)
    .fetch_all(pool)
    .await
}

pub(crate) async fn count_training(pool: &PgPool, template_id: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM annotations a
         JOIN sheets s ON s.id = a.sheet_id
         WHERE s.template_id = $1 AND a.is_training_data",
    )
    .bind(template_id)
    .fetch_one(pool)
    .await
}

pub(crate) async fn list_training(
    executor: impl PgExecutor<'_>,
    template_id: &str,
) -> Result<Vec<TrainingAnnotation>, sqlx::Error> {
    sqlx::query_as::<_, TrainingAnnotation>(
        "SELECT a.id AS annotation_id, a.sheet_id, a.labels, s.extracted_data
         FROM annotations a
         JOIN sheets s ON s.id = a.sheet_id
         WHERE s.template_id = $1 AND a.is_training_data
         ORDER BY a.created_at, a.id",
    )
    .bind(template_id)
    .fetch_all(executor)
    .await
}
