#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use roster_adapter::config::AdapterConfig;
use roster_adapter::{flush_snapshot, router, AdapterRuntime};
use roster_engines::directory::{DisplayNameDirectory, StaticDisplayNameDirectory};
use roster_engines::presence::{PresenceEvaluator, PresenceEvaluatorConfig};
use roster_kernel_contracts::{Clock, SystemClock};
use roster_storage::journal::NoopJournal;
use roster_storage::snapshot::RegistrySnapshotFile;
use roster_storage::{IdentityRegistry, RegistryConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AdapterConfig::from_env()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let snapshot_file = config.snapshot_path.clone().map(RegistrySnapshotFile::new);
    let restored = match &snapshot_file {
        Some(file) => file.load()?,
        None => Vec::new(),
    };
    let registry = Arc::new(IdentityRegistry::from_records(
        RegistryConfig {
            lock_timeout: config.lock_timeout,
        },
        Arc::new(NoopJournal),
        restored,
    )?);
    info!(records = registry.len(), "identity registry ready");

    let directory: Arc<dyn DisplayNameDirectory> = match &config.name_map_path {
        Some(path) => Arc::new(StaticDisplayNameDirectory::load_json(path)?),
        None => Arc::new(StaticDisplayNameDirectory::empty()),
    };

    let flush_worker = snapshot_file.clone().map(|file| {
        let registry_for_worker = registry.clone();
        let clock_for_worker = clock.clone();
        let interval = config.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) =
                    flush_snapshot(&registry_for_worker, &file, clock_for_worker.now()).await
                {
                    warn!(error = %err, path = %file.path().display(), "snapshot flush failed");
                }
            }
        })
    });

    let runtime = Arc::new(AdapterRuntime::new(
        registry.clone(),
        PresenceEvaluator::new(PresenceEvaluatorConfig {
            window: config.window,
        }),
        directory,
        clock.clone(),
    ));

    info!(
        addr = %config.bind,
        window_ms = config.window.as_millis(),
        snapshot = ?config.snapshot_path,
        "roster_adapter_http listening"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, router(runtime))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "shutdown signal listener failed");
            }
        })
        .await?;

    if let Some(worker) = flush_worker {
        worker.abort();
        // A save already on the blocking pool may still finish; it is stamped
        // earlier, so it cannot replace the final snapshot.
        if let Err(err) = worker.await {
            if !err.is_cancelled() {
                warn!(error = %err, "snapshot flush worker ended abnormally");
            }
        }
    }
    if let Some(file) = &snapshot_file {
        let flushed = flush_snapshot(&registry, file, clock.now()).await?;
        info!(records = ?flushed, "final snapshot written");
    }
    Ok(())
}
