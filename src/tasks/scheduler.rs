use std::future::Future;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration};

use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::tasks::{maintenance, workers};

const TRAINING_WORKER_CONCURRENCY: usize = 1;
const GRADING_WORKER_CONCURRENCY: usize = 2;

/// Worker process entry: runs the background loops until Ctrl+C/SIGTERM.
pub(crate) async fn run(state: AppState) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_background(state, shutdown_rx);

    crate::core::shutdown::shutdown_signal().await;
    if shutdown_tx.send(true).is_err() {
        tracing::warn!("Failed to broadcast shutdown signal to background tasks");
    }

    join_background(handles).await;
    Ok(())
}

pub(crate) fn spawn_background(
    state: AppState,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles =
        Vec::with_capacity(TRAINING_WORKER_CONCURRENCY + GRADING_WORKER_CONCURRENCY + 1);

    for _ in 0..TRAINING_WORKER_CONCURRENCY {
        let worker_state = state.clone();
        handles.push(tokio::spawn(poll_loop("training", state.clone(), shutdown.clone(), move || {
            let state = worker_state.clone();
            async move { workers::process_next_training(&state).await }
        })));
    }
    for _ in 0..GRADING_WORKER_CONCURRENCY {
        let worker_state = state.clone();
        handles.push(tokio::spawn(poll_loop("grading", state.clone(), shutdown.clone(), move || {
            let state = worker_state.clone();
            async move { workers::process_next_grading(&state).await }
        })));
    }
    handles.push(tokio::spawn(stale_sweep_loop(state, shutdown)));

    handles
}

pub(crate) async fn join_background(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Background task join failed");
        }
    }
}

/// Runs `step` back to back while it finds work, sleeping the poll interval otherwise.
async fn poll_loop<F, Fut>(
    queue: &'static str,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
    step: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let idle = Duration::from_secs(state.settings().worker().poll_interval_seconds);
    loop {
        if *shutdown.borrow() {
            break;
        }

        match step().await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(err) => tracing::error!(queue, error = %err, "Failed to process queue"),
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(idle) => {}
        }
    }
}

async fn stale_sweep_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(Duration::from_secs(state.settings().worker().sweep_interval_seconds));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                let swept = maintenance::sweep_stale_runs(
                    state.store(),
                    state.settings().worker(),
                    primitive_now_utc(),
                )
                .await;
                if let Err(err) = swept {
                    tracing::error!(error = %err, "sweep_stale_runs failed");
                }
            }
        }
    }
}
