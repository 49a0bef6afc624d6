use anyhow::{Context, Result};
use time::PrimitiveDateTime;

use crate::core::config::WorkerSettings;
use crate::core::time::seconds_before;
use crate::store::GradingStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SweepReport {
    pub(crate) training_sessions: u64,
    pub(crate) grading_jobs: u64,
}

/// Fails PENDING/RUNNING sessions and jobs older than their timeout.
/// Terminal records are never touched, so repeated sweeps are harmless.
pub(crate) async fn sweep_stale_runs(
    store: &dyn GradingStore,
    worker: &WorkerSettings,
    now: PrimitiveDateTime,
) -> Result<SweepReport> {
    let training_cutoff = seconds_before(now, worker.training_stale_after_seconds);
    let training_sessions = store
        .fail_stale_training(
            training_cutoff,
            &format!("training timed out after {}s", worker.training_stale_after_seconds),
            now,
        )
        .await
        .context("Failed to sweep stale training sessions")?;

    let grading_cutoff = seconds_before(now, worker.grading_stale_after_seconds);
    let grading_jobs = store
        .fail_stale_grading(
            grading_cutoff,
            &format!("grading timed out after {}s", worker.grading_stale_after_seconds),
            now,
        )
        .await
        .context("Failed to sweep stale grading jobs")?;

    let report = SweepReport { training_sessions, grading_jobs };
    if report != SweepReport::default() {
        tracing::warn!(
            training_sessions = report.training_sessions,
            grading_jobs = report.grading_jobs,
            "Stale runs marked failed"
        );
        metrics::counter!("stale_runs_recovered_total", "kind" => "training")
            .increment(report.training_sessions);
        metrics::counter!("stale_runs_recovered_total", "kind" => "grading")
            .increment(report.grading_jobs);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::core::time::primitive_now_utc;
    use crate::db::models::TrainingConfig;
    use crate::db::types::{Correctness, RunStatus};
    use crate::services::grading::start_grading;
    use crate::services::training::start_training;
    use crate::store::MemoryStore;
    use crate::test_support;

    fn worker() -> WorkerSettings {
        WorkerSettings {
            poll_interval_seconds: 1,
            sweep_interval_seconds: 60,
            training_stale_after_seconds: 3600,
            grading_stale_after_seconds: 1800,
        }
    }

    #[tokio::test]
    async fn sweep_fails_only_expired_open_runs() {
        let store = MemoryStore::new();
        let template = test_support::seed_template(&store, &[("q1", 10.0)]).await;
        let template_id = template.template.id.clone();
        test_support::training_annotations(&store, &template, 5, Correctness::Correct).await;
        test_support::seed_active_model(&store, &template_id).await;
        let sheet = test_support::processed_sheet(&store, &template, "x").await;

        let now = primitive_now_utc();
        let old = now - Duration::hours(2);
        let session = start_training(&store, 5, &template_id, "t", TrainingConfig::default(), old)
            .await
            .expect("old session");
        let fresh =
            start_training(&store, 5, &template_id, "t", TrainingConfig::default(), now)
                .await
                .expect("fresh session");
        let job = start_grading(&store, &template_id, "t", vec![sheet.id], old).await.expect("job");

        let report = sweep_stale_runs(&store, &worker(), now).await.expect("sweep");

        assert_eq!(report, SweepReport { training_sessions: 1, grading_jobs: 1 });
        let swept = store.find_training_session(&session.id).await.unwrap().expect("session");
        assert_eq!(swept.status, RunStatus::Failed);
        assert_eq!(swept.error_message.as_deref(), Some("training timed out after 3600s"));
        let fresh = store.find_training_session(&fresh.id).await.unwrap().expect("fresh");
        assert_eq!(fresh.status, RunStatus::Pending);
        let job = store.find_grading_job(&job.id).await.unwrap().expect("job");
        assert_eq!(job.status, RunStatus::Failed);

        let again = sweep_stale_runs(&store, &worker(), now).await.expect("second sweep");
        assert_eq!(again, SweepReport::default());
    }
}
