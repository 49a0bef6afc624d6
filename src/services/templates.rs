use std::collections::HashSet;

use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::models::{BoundingBox, Region, Template, TemplateWithRegions};
use crate::db::types::QuestionType;
use crate::services::errors::GradingError;
use crate::store::GradingStore;

pub(crate) const DEFAULT_PASS_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone)]
pub(crate) struct RegionSpec {
    pub(crate) label: String,
    pub(crate) question_type: QuestionType,
    pub(crate) points: f64,
    pub(crate) bbox: BoundingBox,
    pub(crate) order_index: Option<i32>,
    pub(crate) expected_answer: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct NewTemplate {
    pub(crate) name: String,
    pub(crate) pass_threshold: Option<f64>,
    pub(crate) regions: Vec<RegionSpec>,
}

#[derive(Debug, Clone)]
pub(crate) struct TemplateRevision {
    pub(crate) template: TemplateWithRegions,
    /// `true` when the layout was graded and a new version row was created.
    pub(crate) new_version: bool,
}

pub(crate) async fn create_template(
    store: &dyn GradingStore,
    input: NewTemplate,
    created_by: &str,
    now: PrimitiveDateTime,
) -> Result<TemplateWithRegions, GradingError> {
    let name = input.name.trim().to_string();
    if name.is_empty() {
        return Err(GradingError::validation("template name must not be empty"));
    }
    let pass_threshold = input.pass_threshold.unwrap_or(DEFAULT_PASS_THRESHOLD);
    if !pass_threshold.is_finite() || !(0.0..=1.0).contains(&pass_threshold) {
        return Err(GradingError::validation("pass_threshold must be within [0, 1]"));
    }
    validate_regions(&input.regions)?;

    let version = store.latest_template_version(&name).await? + 1;
    let template_id = Uuid::new_v4().to_string();
    let template = TemplateWithRegions {
        regions: build_regions(&template_id, &input.regions),
        template: Template {
            id: template_id,
            name,
            version,
            pass_threshold,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        },
    };

    store.insert_template(&template).await?;
    tracing::info!(
        template_id = %template.template.id,
        version,
        regions = template.regions.len(),
        "Template created"
    );
    Ok(template)
}

pub(crate) async fn get_template(
    store: &dyn GradingStore,
    template_id: &str,
) -> Result<TemplateWithRegions, GradingError> {
    store.find_template(template_id).await?.ok_or(GradingError::NotFound("template"))
}

pub(crate) async fn list_templates(store: &dyn GradingStore) -> Result<Vec<Template>, GradingError> {
    Ok(store.list_templates().await?)
}

/// Replaces the region layout. A template with grading results or a grading
/// job that has not failed keeps its layout and a new version row carries the
/// revision instead.
pub(crate) async fn revise_template(
    store: &dyn GradingStore,
    template_id: &str,
    regions: Vec<RegionSpec>,
    now: PrimitiveDateTime,
) -> Result<TemplateRevision, GradingError> {
    validate_regions(&regions)?;
    let current = get_template(store, template_id).await?;

    if !store.template_has_results(template_id).await? {
        let replacement = build_regions(template_id, &regions);
        match store.replace_regions(template_id, &replacement, now).await {
            Ok(template) => {
                tracing::info!(template_id, "Template regions replaced in place");
                return Ok(TemplateRevision { template, new_version: false });
            }
            Err(crate::store::StoreError::Conflict(reason)) => {
                tracing::info!(template_id, %reason, "Template graded meanwhile; bumping version");
            }
            Err(err) => return Err(err.into()),
        }
    }

    let version = store.latest_template_version(&current.template.name).await? + 1;
    let new_id = Uuid::new_v4().to_string();
    let template = TemplateWithRegions {
        regions: build_regions(&new_id, &regions),
        template: Template {
            id: new_id,
            name: current.template.name.clone(),
            version,
            pass_threshold: current.template.pass_threshold,
            created_by: current.template.created_by.clone(),
            created_at: now,
            updated_at: now,
        },
    };
    store.insert_template(&template).await?;

    tracing::info!(
        previous_template_id = template_id,
        template_id = %template.template.id,
        version,
        "Graded template revised as new version"
    );
    Ok(TemplateRevision { template, new_version: true })
}

pub(crate) async fn delete_template(
    store: &dyn GradingStore,
    template_id: &str,
) -> Result<(), GradingError> {
    if !store.delete_template(template_id).await? {
        return Err(GradingError::NotFound("template"));
    }
    tracing::info!(template_id, "Template deleted with all dependent records");
    Ok(())
}

fn validate_regions(regions: &[RegionSpec]) -> Result<(), GradingError> {
    if regions.is_empty() {
        return Err(GradingError::validation("template must define at least one region"));
    }

    let mut labels = HashSet::new();
    for region in regions {
        let label = region.label.trim();
        if label.is_empty() {
            return Err(GradingError::validation("region label must not be empty"));
        }
        if !labels.insert(label) {
            return Err(GradingError::validation(format!("duplicate region label '{label}'")));
        }
        if !region.points.is_finite() || region.points < 0.0 {
            return Err(GradingError::validation(format!(
                "region '{label}' points must be a non-negative number"
            )));
        }
        let BoundingBox { x, y, width, height } = region.bbox;
        if [x, y, width, height].iter().any(|value| !value.is_finite() || *value < 0.0) {
            return Err(GradingError::validation(format!(
                "region '{label}' bounding box components must be non-negative"
            )));
        }
    }
    Ok(())
}

fn build_regions(template_id: &str, specs: &[RegionSpec]) -> Vec<Region> {
    specs
        .iter()
        .enumerate()
        .map(|(position, spec)| Region {
            id: Uuid::new_v4().to_string(),
            template_id: template_id.to_string(),
            label: spec.label.trim().to_string(),
            question_type: spec.question_type,
            points: spec.points,
            bbox: spec.bbox,
            order_index: spec.order_index.unwrap_or(position as i32),
            expected_answer: spec.expected_answer.clone(),
        })
        .collect()
}
