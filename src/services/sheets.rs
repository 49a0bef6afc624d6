use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::models::Sheet;
use crate::db::types::SheetStatus;
use crate::services::errors::GradingError;
use crate::store::GradingStore;

pub(crate) async fn register_sheet(
    store: &dyn GradingStore,
    template_id: &str,
    student_id: Option<String>,
    original_url: &str,
    now: PrimitiveDateTime,
) -> Result<Sheet, GradingError> {
    let original_url = original_url.trim();
    if original_url.is_empty() {
        return Err(GradingError::validation("original_url must not be empty"));
    }
    if store.find_template(template_id).await?.is_none() {
        return Err(GradingError::NotFound("template"));
    }

    let sheet = Sheet {
        id: Uuid::new_v4().to_string(),
        template_id: template_id.to_string(),
        student_id: student_id.filter(|value| !value.trim().is_empty()),
        original_url: original_url.to_string(),
        status: SheetStatus::Uploaded,
        extracted_data: None,
        error_message: None,
        created_at: now,
        updated_at: now,
    };
    store.insert_sheet(&sheet).await?;

    tracing::info!(sheet_id = %sheet.id, template_id, "Sheet registered");
    Ok(sheet)
}

/// Stores the extractor output once; a sheet that already has data is a conflict.
pub(crate) async fn record_extraction(
    store: &dyn GradingStore,
    sheet_id: &str,
    extracted_data: serde_json::Value,
    now: PrimitiveDateTime,
) -> Result<Sheet, GradingError> {
    if extracted_data.is_null() {
        return Err(GradingError::validation("extracted_data must not be null"));
    }

    let sheet = store.record_extraction(sheet_id, &extracted_data, now).await?;
    tracing::info!(sheet_id, "Sheet extraction recorded");
    Ok(sheet)
}

pub(crate) async fn mark_sheet_error(
    store: &dyn GradingStore,
    sheet_id: &str,
    reason: &str,
    now: PrimitiveDateTime,
) -> Result<Sheet, GradingError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(GradingError::validation("reason must not be empty"));
    }

    let sheet = store.mark_sheet_error(sheet_id, reason, now).await?;
    tracing::warn!(sheet_id, reason, "Sheet processing failed");
    Ok(sheet)
}

pub(crate) async fn get_sheet(store: &dyn GradingStore, sheet_id: &str) -> Result<Sheet, GradingError> {
    store.find_sheet(sheet_id).await?.ok_or(GradingError::NotFound("sheet"))
}

pub(crate) async fn list_sheets(
    store: &dyn GradingStore,
    template_id: &str,
    status: Option<SheetStatus>,
) -> Result<Vec<Sheet>, GradingError> {
    if store.find_template(template_id).await?.is_none() {
        return Err(GradingError::NotFound("template"));
    }
    Ok(store.list_sheets(template_id, status).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::primitive_now_utc;
    use crate::store::MemoryStore;
    use crate::test_support;
    use serde_json::json;

    #[tokio::test]
    async fn extraction_is_recorded_once() {
        let store = MemoryStore::new();
        let template = test_support::seed_template(&store, &[("q1", 1.0)]).await;
        let sheet = register_sheet(&store, &template.template.id, None, "s3://a.png", primitive_now_utc())
            .await
            .expect("sheet");

        let processed = record_extraction(&store, &sheet.id, json!({"regions": {}}), primitive_now_utc())
            .await
            .expect("extraction");
        assert_eq!(processed.status, SheetStatus::Processed);

        let err = record_extraction(&store, &sheet.id, json!({"regions": {}}), primitive_now_utc())
            .await
            .expect_err("second extraction");
        assert!(matches!(err, GradingError::Conflict(_)));
    }

    #[tokio::test]
    async fn error_sheet_recovers_through_new_extraction() {
        let store = MemoryStore::new();
        let template = test_support::seed_template(&store, &[("q1", 1.0)]).await;
        let sheet = register_sheet(&store, &template.template.id, Some("s-1".into()), "u", primitive_now_utc())
            .await
            .expect("sheet");

        let failed = mark_sheet_error(&store, &sheet.id, "alignment failed", primitive_now_utc())
            .await
            .expect("error");
        assert_eq!(failed.status, SheetStatus::Error);
        assert_eq!(failed.error_message.as_deref(), Some("alignment failed"));

        let recovered = record_extraction(&store, &sheet.id, json!({"regions": {}}), primitive_now_utc())
            .await
            .expect("retry");
        assert_eq!(recovered.status, SheetStatus::Processed);
        assert!(recovered.error_message.is_none());

        let filtered = list_sheets(&store, &template.template.id, Some(SheetStatus::Processed))
            .await
            .expect("list");
        assert_eq!(filtered.len(), 1);
    }

    #[tokio::test]
    async fn register_requires_existing_template() {
        let store = MemoryStore::new();
        let err = register_sheet(&store, "missing", None, "u", primitive_now_utc())
            .await
            .expect_err("missing template");
        assert!(matches!(err, GradingError::NotFound("template")));
    }
}
