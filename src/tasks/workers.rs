use anyhow::{Context, Result};

use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::services::grading::{run_grading_job, GradingOptions};
use crate::services::report_cache;
use crate::services::training::{run_training_session, training_timeout};

/// Claims and runs one pending training session. Returns `false` when the queue is empty.
pub(crate) async fn process_next_training(state: &AppState) -> Result<bool> {
    let Some(session) = state
        .store()
        .claim_next_training_session(primitive_now_utc())
        .await
        .context("Failed to claim training session")?
    else {
        return Ok(false);
    };

    tracing::info!(session_id = %session.id, template_id = %session.template_id, "Training session claimed");
    let timeout = training_timeout(state.settings());
    if let Err(err) = run_training_session(state.store(), state.training(), timeout, &session).await {
        tracing::warn!(session_id = %session.id, error = %err, "Training session did not complete");
    }
    Ok(true)
}

/// Claims and runs one pending grading job. Returns `false` when the queue is empty.
pub(crate) async fn process_next_grading(state: &AppState) -> Result<bool> {
    let Some(job) = state
        .store()
        .claim_next_grading_job(primitive_now_utc())
        .await
        .context("Failed to claim grading job")?
    else {
        return Ok(false);
    };

    tracing::info!(job_id = %job.id, template_id = %job.template_id, sheets = job.total_sheets, "Grading job claimed");
    let options = GradingOptions::from_settings(state.settings());
    match run_grading_job(state.shared_store(), state.shared_scoring(), options, &job).await {
        Ok(_) => report_cache::invalidate(state.redis(), &job.template_id).await,
        Err(err) => tracing::warn!(job_id = %job.id, error = %err, "Grading job did not complete"),
    }
    Ok(true)
}
