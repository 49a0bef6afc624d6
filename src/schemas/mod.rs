use std::collections::HashMap;

use serde::Serialize;

pub(crate) mod annotation;
pub(crate) mod grading;
pub(crate) mod sheet;
pub(crate) mod template;
pub(crate) mod training;

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) service: String,
    pub(crate) status: String,
    pub(crate) components: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RootResponse {
    pub(crate) message: String,
    pub(crate) version: String,
    pub(crate) api_prefix: String,
}
