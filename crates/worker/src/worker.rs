// Flow worker process
// Decision: every worker runs the full engine; the processes coordinate only through leases

use std::sync::Arc;

use anyhow::{Context, Result};
use flowmesh_engine::graph::{GraphRepository, InMemoryGraphRepository};
use flowmesh_engine::{
    LeaseOwnershipService, LeaseProvider, Orchestrator, PostgresFlowStore, PostgresLeaseProvider,
    RetryScheduler, StatusCalculator,
};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::WorkerConfig;
use crate::graphs::load_graphs;

/// One engine process: the orchestrator plus its background loops
pub struct FlowWorker {
    orchestrator: Orchestrator,
    ownership: Arc<LeaseOwnershipService>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FlowWorker {
    /// Connect to the database and assemble the engine
    pub async fn new(config: WorkerConfig) -> Result<Self> {
        info!(
            worker_id = %config.engine.worker_id,
            graphs_dir = ?config.graphs_dir,
            "Initializing flow worker"
        );

        let pool = PgPool::connect(&config.database_url)
            .await
            .context("Failed to connect to database")?;

        let store = Arc::new(PostgresFlowStore::new(pool.clone()));
        if config.run_migrations {
            store.migrate().await.context("Failed to run migrations")?;
            info!("Migrations applied");
        }

        let graphs: Arc<dyn GraphRepository> = match &config.graphs_dir {
            Some(dir) => Arc::new(load_graphs(dir)?),
            None => Arc::new(InMemoryGraphRepository::new()),
        };

        let leases: Arc<dyn LeaseProvider> = Arc::new(PostgresLeaseProvider::new(pool));
        let ownership = Arc::new(LeaseOwnershipService::new(
            Arc::clone(&leases),
            config.engine.worker_id.clone(),
            config.engine.ownership_ttl,
            config.engine.ownership_protect,
        ));

        let orchestrator = Orchestrator::builder(store, graphs, leases)
            .config(config.engine)
            .ownership(ownership.clone())
            .build()
            .context("Failed to build orchestrator")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            orchestrator,
            ownership,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Run the background loops until [`FlowWorker::shutdown`] is called
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = %self.orchestrator.worker_id(), "Starting flow worker");

        let invalidations = self
            .ownership
            .spawn_invalidation_listener(self.shutdown_rx.clone());
        let retries = RetryScheduler::new(self.orchestrator.clone()).spawn(self.shutdown_rx.clone());
        let status =
            StatusCalculator::new(self.orchestrator.clone()).spawn(self.shutdown_rx.clone());

        for (name, handle) in [
            ("invalidation listener", invalidations),
            ("retry scheduler", retries),
            ("status calculator", status),
        ] {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "background task panicked");
            }
        }

        // Let in-flight node batches settle before the process exits
        self.orchestrator.quiesce().await;
        info!("Flow worker stopped");
        Ok(())
    }

    /// Signal every background loop to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
