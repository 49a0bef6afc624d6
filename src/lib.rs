pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod repositories;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod store;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use crate::core::config::{PersistenceBackend, Settings};
use crate::core::{redis::RedisHandle, state::AppState, telemetry};
use crate::services::ml_client::MlServiceClient;
use crate::store::{GradingStore, MemoryStore, PgGradingStore};

pub async fn run() -> anyhow::Result<()> {
    let state = bootstrap().await?;
    let in_process_workers = state.settings().persistence().backend == PersistenceBackend::Memory;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = if in_process_workers {
        tracing::info!("In-memory store: running training and grading loops in the API process");
        tasks::scheduler::spawn_background(state.clone(), shutdown_rx)
    } else {
        Vec::new()
    };

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        "Grading API listening"
    );

    let result =
        axum::serve(listener, app).with_graceful_shutdown(core::shutdown::shutdown_signal()).await;

    if shutdown_tx.send(true).is_err() && in_process_workers {
        tracing::warn!("Failed to broadcast shutdown signal to background tasks");
    }
    tasks::scheduler::join_background(background).await;

    state.redis().disconnect().await;
    tracing::info!("Redis disconnected");

    result?;

    Ok(())
}

pub async fn run_worker() -> anyhow::Result<()> {
    let state = bootstrap().await?;
    if state.settings().persistence().backend == PersistenceBackend::Memory {
        tracing::warn!("Worker started with the in-memory store; it sees no jobs from the API");
    }

    let result = tasks::scheduler::run(state.clone()).await;

    state.redis().disconnect().await;
    tracing::info!("Redis disconnected");

    result?;

    Ok(())
}

async fn bootstrap() -> anyhow::Result<AppState> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let store = build_store(&settings).await?;

    let redis = RedisHandle::new(settings.redis().redis_url());
    if let Err(err) = redis.connect().await {
        tracing::error!(error = %err, "Failed to connect to Redis; continuing without report cache");
    } else {
        tracing::info!("Redis connected successfully");
    }

    let ml = Arc::new(MlServiceClient::from_settings(&settings)?);
    Ok(AppState::new(settings, store, redis, ml.clone(), ml))
}

async fn build_store(settings: &Settings) -> anyhow::Result<Arc<dyn GradingStore>> {
    match settings.persistence().backend {
        PersistenceBackend::Postgres => {
            let pool = db::init_pool(settings).await.context("Failed to connect to PostgreSQL")?;
            db::run_migrations(&pool).await.context("Failed to run migrations")?;
            Ok(Arc::new(PgGradingStore::new(pool)))
        }
        PersistenceBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}
