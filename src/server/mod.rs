//! HTTP interface: submit jobs and follow their progress as NDJSON.

mod routes;

use crate::model::JobSettings;
use crate::orchestrator::sweep_workspaces;
use crate::presets::PresetRegistry;
use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;

/// Shortest interval between two stale-workspace sweeps.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared, read-only state of the HTTP layer.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<JobSettings>,
    pub presets: Arc<PresetRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health_check))
        .route("/presets", get(routes::list_presets))
        .route("/jobs", post(routes::submit_job))
        .with_state(state)
}

fn sweep_interval(ttl: Duration) -> Duration {
    (ttl / 4).max(MIN_SWEEP_INTERVAL)
}

/// Sweep stale workspaces now and then every quarter TTL.
fn spawn_sweeper(settings: Arc<JobSettings>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval(settings.workspace_ttl));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweep_workspaces(&settings).await;
        }
    })
}

/// Bind `host:port` and serve until Ctrl-C.
pub async fn serve(
    settings: JobSettings,
    presets: PresetRegistry,
    host: &str,
    port: u16,
) -> Result<()> {
    let state = AppState {
        settings: Arc::new(settings),
        presets: Arc::new(presets),
    };
    if !state.presets.list().iter().any(|p| p.available) {
        tracing::warn!("no preset model file found; jobs must upload a model");
    }
    let sweeper = spawn_sweeper(state.settings.clone());

    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, presets = state.presets.list().len(), "listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "cannot listen for Ctrl-C");
                futures::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
        })
        .await
        .context("http server failed")?;

    sweeper.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_interval_has_a_floor() {
        assert_eq!(sweep_interval(Duration::from_secs(24 * 3600)), Duration::from_secs(6 * 3600));
        assert_eq!(sweep_interval(Duration::from_secs(10)), MIN_SWEEP_INTERVAL);
    }
}
