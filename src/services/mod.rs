pub(crate) mod annotations;
pub(crate) mod errors;
pub(crate) mod grading;
pub(crate) mod ml_client;
pub(crate) mod oracle;
pub(crate) mod report_cache;
pub(crate) mod reporting;
pub(crate) mod review;
pub(crate) mod sheets;
pub(crate) mod templates;
pub(crate) mod training;
