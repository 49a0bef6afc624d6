pub(crate) mod annotations;
pub(crate) mod grading_jobs;
pub(crate) mod grading_results;
pub(crate) mod models;
pub(crate) mod sheets;
pub(crate) mod templates;
pub(crate) mod training_sessions;
