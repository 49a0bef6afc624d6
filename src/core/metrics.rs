use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled || PROM_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);
    describe();
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

fn describe() {
    metrics::describe_counter!("grading_jobs_total", "Grading jobs finished, by status");
    metrics::describe_counter!("grading_results_total", "Grading results written, by triage");
    metrics::describe_histogram!(
        "grading_sheet_duration_seconds",
        "Time to score and commit one sheet"
    );
    metrics::describe_counter!("training_sessions_total", "Training sessions finished, by status");
    metrics::describe_counter!("reviews_total", "Review actions applied, by action");
    metrics::describe_counter!(
        "stale_runs_recovered_total",
        "Training sessions and grading jobs swept to failed"
    );
}
