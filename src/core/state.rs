use std::sync::Arc;

use crate::core::{config::Settings, redis::RedisHandle};
use crate::services::oracle::{ScoringOracle, TrainingOracle};
use crate::store::GradingStore;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    store: Arc<dyn GradingStore>,
    redis: RedisHandle,
    scoring: Arc<dyn ScoringOracle>,
    training: Arc<dyn TrainingOracle>,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        store: Arc<dyn GradingStore>,
        redis: RedisHandle,
        scoring: Arc<dyn ScoringOracle>,
        training: Arc<dyn TrainingOracle>,
    ) -> Self {
        Self { inner: Arc::new(InnerState { settings, store, redis, scoring, training }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn store(&self) -> &dyn GradingStore {
        self.inner.store.as_ref()
    }

    pub(crate) fn shared_store(&self) -> Arc<dyn GradingStore> {
        self.inner.store.clone()
    }

    pub(crate) fn redis(&self) -> &RedisHandle {
        &self.inner.redis
    }

    pub(crate) fn scoring(&self) -> &dyn ScoringOracle {
        self.inner.scoring.as_ref()
    }

    pub(crate) fn shared_scoring(&self) -> Arc<dyn ScoringOracle> {
        self.inner.scoring.clone()
    }

    pub(crate) fn training(&self) -> &dyn TrainingOracle {
        self.inner.training.as_ref()
    }
}
