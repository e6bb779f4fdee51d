use anyhow::{Context, Result};
use flowmesh_worker::{FlowWorker, WorkerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();

    // RUST_LOG wins; LOG_LEVEL sets the level of both crates
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("flowmesh_worker={log_level},flowmesh_engine={log_level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Ok(path) = dotenv {
        tracing::info!("Loaded .env from {:?}", path);
    }

    tracing::info!("flowmesh-worker starting...");

    let config = WorkerConfig::from_env()?;
    let worker = FlowWorker::new(config)
        .await
        .context("Failed to create flow worker")?;

    let run = worker.run();
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            worker.shutdown();
            run.await?;
        }
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
