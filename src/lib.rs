pub mod commands;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub(crate) mod scope_path;
pub mod services;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use config::AppConfig;
use error::AppError;
use state::AppState;

/// Crawls every configured root once, then again on the configured interval.
async fn crawl_roots(state: Arc<AppState>) {
    let roots = state.config.crawler.roots.clone();
    let interval = state.config.crawler.crawl_interval_secs.map(Duration::from_secs);
    loop {
        for root in &roots {
            if state.shutdown.is_cancelled() {
                return;
            }
            let root = root.to_string_lossy();
            match state.crawler.start(&root).await {
                Ok(session_id) => match state.crawler.wait().await {
                    Some(Ok(summary)) => tracing::info!(
                        session_id = %session_id,
                        root = %root,
                        processed = summary.counts.files_processed,
                        deletion = ?summary.deletion,
                        "scheduled crawl finished"
                    ),
                    Some(Err(e)) => tracing::error!(root = %root, error = %e, "scheduled crawl failed"),
                    None => {}
                },
                Err(AppError::AlreadyRunning(current)) => {
                    tracing::debug!(root = %root, current = %current, "crawl already running; skipping root");
                }
                Err(e) => tracing::warn!(root = %root, error = %e, "could not start crawl"),
            }
        }

        let Some(every) = interval else {
            return;
        };
        tokio::select! {
            _ = state.shutdown.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
    }
}

/// Mirrors the event stream into the log for operators without a subscriber of their own.
async fn log_events(state: Arc<AppState>) {
    let mut rx = state.events.subscribe();
    loop {
        let received = tokio::select! {
            _ = state.shutdown.cancelled() => return,
            received = rx.recv() => received,
        };
        match received {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::debug!(target: "teamcache::events", event = %json),
                Err(e) => tracing::warn!(error = %e, "unserializable event"),
            },
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "event log lagged");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

/// Runs the service until Ctrl-C.
pub async fn run(config: AppConfig) -> Result<(), AppError> {
    let state = Arc::new(AppState::open(config)?);
    state.start_background().await?;

    let events = tokio::spawn(log_events(Arc::clone(&state)));
    let crawls = tokio::spawn(crawl_roots(Arc::clone(&state)));
    tracing::info!(
        roots = state.config.crawler.roots.len(),
        workers = state.config.scheduler.worker_count,
        "teamcache running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    state.shutdown().await;

    if let Err(e) = crawls.await {
        tracing::warn!(error = %e, "crawl loop ended abnormally");
    }
    if let Err(e) = events.await {
        tracing::warn!(error = %e, "event log ended abnormally");
    }
    tracing::info!("teamcache stopped");
    Ok(())
}
