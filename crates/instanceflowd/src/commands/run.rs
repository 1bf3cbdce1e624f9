use crate::commands::open_store;
use crate::providers;
use anyhow::Context;
use colored::Colorize;
use instanceflow_cloud::RetryConfig;
use instanceflow_config::Settings;
use instanceflow_controlplane::{Controller, ControllerConfig, FileStore, Reconciler};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

pub fn controller_config(settings: &Settings) -> ControllerConfig {
    ControllerConfig {
        workers: settings.workers,
        resync_interval: settings.resync_interval(),
        retry: RetryConfig {
            initial_delay: settings.retry.initial_delay(),
            max_delay: settings.retry.max_delay(),
            backoff_multiplier: settings.retry.multiplier,
        },
        alert_after_failures: settings.alert_after_failures,
    }
}

/// Surface records written by other processes (e.g. `apply`, `delete`) as watch events
pub async fn watch_external_changes(store: Arc<FileStore>, every: Duration, cancel: CancellationToken) {
    let mut ticks = interval(every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticks.tick() => {
                if let Err(e) = store.poll_external_changes().await {
                    tracing::warn!(error = %e, "failed to check records file for changes");
                }
            }
        }
    }
}

pub async fn handle(settings: Settings, provider: Option<String>) -> anyhow::Result<()> {
    let provider = provider.unwrap_or_else(|| settings.provider.clone());
    let registry = providers::build_registry();
    let client = registry.get(&provider).with_context(|| {
        format!(
            "cloud backend '{}' is not available (built-in: {})",
            provider,
            registry.names().join(", ")
        )
    })?;

    println!("{}", "Starting instanceflowd".green().bold());
    println!("  provider:  {}", provider.cyan());
    println!("  state dir: {}", settings.state_dir.display().to_string().cyan());
    println!("  workers:   {}", settings.workers);

    let store = Arc::new(open_store(&settings));
    let reconciler = Arc::new(Reconciler::new(store.clone(), client, settings.poll_interval()));
    let controller = Controller::new(reconciler, controller_config(&settings));

    let cancel = CancellationToken::new();
    tokio::spawn(watch_external_changes(
        store,
        settings.poll_interval(),
        cancel.clone(),
    ));
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("interrupt received"),
            Err(e) => tracing::error!(error = %e, "failed to listen for interrupt"),
        }
        shutdown.cancel();
    });

    controller.run(cancel).await?;
    println!("{}", "instanceflowd stopped".dimmed());
    Ok(())
}
