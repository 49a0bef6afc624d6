pub(crate) mod maintenance;
pub(crate) mod scheduler;
pub(crate) mod workers;
