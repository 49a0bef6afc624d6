use std::collections::HashSet;

use sqlx::types::Json;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::models::{Annotation, Markup, QuestionLabel, TemplateWithRegions};
use crate::services::errors::GradingError;
use crate::store::GradingStore;

#[derive(Debug, Clone)]
pub(crate) struct NewAnnotation {
    pub(crate) markup: Markup,
    pub(crate) is_training_data: bool,
    pub(crate) labels: Vec<QuestionLabel>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct AnnotationPatch {
    pub(crate) markup: Option<Markup>,
    pub(crate) is_training_data: Option<bool>,
    pub(crate) labels: Option<Vec<QuestionLabel>>,
}

pub(crate) async fn create_annotation(
    store: &dyn GradingStore,
    sheet_id: &str,
    teacher_id: &str,
    input: NewAnnotation,
    now: PrimitiveDateTime,
) -> Result<Annotation, GradingError> {
    let sheet = store.find_sheet(sheet_id).await?.ok_or(GradingError::NotFound("sheet"))?;
    let template = store
        .find_template(&sheet.template_id)
        .await?
        .ok_or(GradingError::NotFound("template"))?;
    validate_labels(&template, &input.labels)?;

    let annotation = Annotation {
        id: Uuid::new_v4().to_string(),
        sheet_id: sheet.id.clone(),
        teacher_id: teacher_id.to_string(),
        markup: Json(input.markup),
        is_training_data: input.is_training_data,
        labels: Json(input.labels),
        created_at: now,
        updated_at: now,
    };
    store.insert_annotation(&annotation).await?;

    tracing::info!(
        annotation_id = %annotation.id,
        sheet_id,
        labels = annotation.labels.0.len(),
        training = annotation.is_training_data,
        "Annotation created"
    );
    Ok(annotation)
}

pub(crate) async fn update_annotation(
    store: &dyn GradingStore,
    annotation_id: &str,
    teacher_id: &str,
    patch: AnnotationPatch,
    now: PrimitiveDateTime,
) -> Result<Annotation, GradingError> {
    let mut annotation = authored_annotation(store, annotation_id, teacher_id).await?;

    if let Some(labels) = patch.labels {
        let sheet = store
            .find_sheet(&annotation.sheet_id)
            .await?
            .ok_or(GradingError::NotFound("sheet"))?;
        let template = store
            .find_template(&sheet.template_id)
            .await?
            .ok_or(GradingError::NotFound("template"))?;
        validate_labels(&template, &labels)?;
        annotation.labels = Json(labels);
    }
    if let Some(markup) = patch.markup {
        annotation.markup = Json(markup);
    }
    if let Some(is_training_data) = patch.is_training_data {
        annotation.is_training_data = is_training_data;
    }
    annotation.updated_at = now;

    Ok(store.update_annotation(&annotation).await?)
}

pub(crate) async fn delete_annotation(
    store: &dyn GradingStore,
    annotation_id: &str,
    teacher_id: &str,
) -> Result<(), GradingError> {
    authored_annotation(store, annotation_id, teacher_id).await?;
    if !store.delete_annotation(annotation_id).await? {
        return Err(GradingError::NotFound("annotation"));
    }
    tracing::info!(annotation_id, "Annotation deleted");
    Ok(())
}

pub(crate) async fn list_annotations(
    store: &dyn GradingStore,
    sheet_id: &str,
) -> Result<Vec<Annotation>, GradingError> {
    if store.find_sheet(sheet_id).await?.is_none() {
        return Err(GradingError::NotFound("sheet"));
    }
    Ok(store.list_annotations(sheet_id).await?)
}

async fn authored_annotation(
    store: &dyn GradingStore,
    annotation_id: &str,
    teacher_id: &str,
) -> Result<Annotation, GradingError> {
    let annotation =
        store.find_annotation(annotation_id).await?.ok_or(GradingError::NotFound("annotation"))?;
    if annotation.teacher_id != teacher_id {
        return Err(GradingError::Forbidden("Only the author can modify this annotation"));
    }
    Ok(annotation)
}

pub(crate) fn validate_labels(
    template: &TemplateWithRegions,
    labels: &[QuestionLabel],
) -> Result<(), GradingError> {
    let mut seen = HashSet::new();
    for label in labels {
        let Some(region) = template.region(&label.region_id) else {
            return Err(GradingError::validation(format!(
                "region {} does not belong to template {}",
                label.region_id, template.template.id
            )));
        };
        if !seen.insert(label.region_id.as_str()) {
            return Err(GradingError::validation(format!(
                "region {} is labelled more than once",
                label.region_id
            )));
        }
        if !label.score.is_finite() || label.score < 0.0 || label.score > region.points {
            return Err(GradingError::validation(format!(
                "score for region {} must be within [0, {}]",
                region.label, region.points
            )));
        }
        if let Some(confidence) = label.confidence {
            if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
                return Err(GradingError::validation(format!(
                    "confidence for region {} must be within [0, 1]",
                    region.label
                )));
            }
        }
    }
    Ok(())
}
