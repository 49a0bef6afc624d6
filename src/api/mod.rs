pub(crate) mod annotations;
pub(crate) mod errors;
pub(crate) mod grading;
pub(crate) mod guards;
pub(crate) mod handlers;
pub(crate) mod reports;
pub(crate) mod reviews;
pub(crate) mod router;
pub(crate) mod sheets;
pub(crate) mod templates;
pub(crate) mod training;
