use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::{BoundingBox, Region, Template, TemplateWithRegions};
use crate::db::types::QuestionType;
use crate::services::templates::{NewTemplate, RegionSpec, TemplateRevision};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub(crate) struct BoundingBoxPayload {
    #[validate(range(min = 0.0, message = "x must be non-negative"))]
    pub(crate) x: f64,
    #[validate(range(min = 0.0, message = "y must be non-negative"))]
    pub(crate) y: f64,
    #[validate(range(min = 0.0, message = "width must be non-negative"))]
    pub(crate) width: f64,
    #[validate(range(min = 0.0, message = "height must be non-negative"))]
    pub(crate) height: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub(crate) struct RegionCreate {
    #[validate(length(min = 1, max = 100, message = "label must be 1-100 characters"))]
    pub(crate) label: String,
    #[serde(alias = "questionType")]
    pub(crate) question_type: QuestionType,
    #[validate(range(min = 0.0, message = "points must be non-negative"))]
    pub(crate) points: f64,
    #[validate(nested)]
    pub(crate) bbox: BoundingBoxPayload,
    #[serde(default)]
    #[serde(alias = "orderIndex")]
    #[validate(range(min = 0, message = "order_index must be non-negative"))]
    pub(crate) order_index: Option<i32>,
    #[serde(default)]
    #[serde(alias = "expectedAnswer")]
    pub(crate) expected_answer: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct TemplateCreate {
    #[validate(length(min = 1, max = 200, message = "name must be 1-200 characters"))]
    pub(crate) name: String,
    #[serde(default)]
    #[serde(alias = "passThreshold")]
    #[validate(range(min = 0.0, max = 1.0, message = "pass_threshold must be within [0, 1]"))]
    pub(crate) pass_threshold: Option<f64>,
    #[validate(length(min = 1, message = "at least one region is required"), nested)]
    pub(crate) regions: Vec<RegionCreate>,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct RegionsReplace {
    #[validate(length(min = 1, message = "at least one region is required"), nested)]
    pub(crate) regions: Vec<RegionCreate>,
}

impl From<RegionCreate> for RegionSpec {
    fn from(region: RegionCreate) -> Self {
        Self {
            label: region.label,
            question_type: region.question_type,
            points: region.points,
            bbox: BoundingBox {
                x: region.bbox.x,
                y: region.bbox.y,
                width: region.bbox.width,
                height: region.bbox.height,
            },
            order_index: region.order_index,
            expected_answer: region.expected_answer,
        }
    }
}

impl From<TemplateCreate> for NewTemplate {
    fn from(payload: TemplateCreate) -> Self {
        Self {
            name: payload.name,
            pass_threshold: payload.pass_threshold,
            regions: payload.regions.into_iter().map(RegionSpec::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct RegionResponse {
    pub(crate) id: String,
    pub(crate) label: String,
    pub(crate) question_type: QuestionType,
    pub(crate) points: f64,
    pub(crate) bbox: BoundingBox,
    pub(crate) order_index: i32,
    pub(crate) expected_answer: Option<String>,
}

impl From<Region> for RegionResponse {
    fn from(region: Region) -> Self {
        Self {
            id: region.id,
            label: region.label,
            question_type: region.question_type,
            points: region.points,
            bbox: region.bbox,
            order_index: region.order_index,
            expected_answer: region.expected_answer,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct TemplateSummaryResponse {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) version: i32,
    pub(crate) pass_threshold: f64,
    pub(crate) created_by: String,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl From<Template> for TemplateSummaryResponse {
    fn from(template: Template) -> Self {
        Self {
            id: template.id,
            name: template.name,
            version: template.version,
            pass_threshold: template.pass_threshold,
            created_by: template.created_by,
            created_at: format_primitive(template.created_at),
            updated_at: format_primitive(template.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct TemplateResponse {
    #[serde(flatten)]
    pub(crate) template: TemplateSummaryResponse,
    pub(crate) max_points: f64,
    pub(crate) regions: Vec<RegionResponse>,
}

impl From<TemplateWithRegions> for TemplateResponse {
    fn from(value: TemplateWithRegions) -> Self {
        let max_points = value.max_points();
        Self {
            template: value.template.into(),
            max_points,
            regions: value.regions.into_iter().map(RegionResponse::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct TemplateRevisionResponse {
    pub(crate) new_version: bool,
    pub(crate) template: TemplateResponse,
}

impl From<TemplateRevision> for TemplateRevisionResponse {
    fn from(revision: TemplateRevision) -> Self {
        Self { new_version: revision.new_version, template: revision.template.into() }
    }
}
