// Worker process configuration
// Decision: engine tuning lives in EngineConfig; this only adds what the process needs to boot

use std::path::PathBuf;

use anyhow::{Context, Result};
use flowmesh_engine::EngineConfig;

/// Configuration of one worker process
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// PostgreSQL connection string
    pub database_url: String,
    /// Directory of graph definitions (`*.json`) to serve
    pub graphs_dir: Option<PathBuf>,
    /// Run pending migrations on boot
    pub run_migrations: bool,
    pub engine: EngineConfig,
}

impl WorkerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;

        let graphs_dir = std::env::var("GRAPHS_DIR").ok().map(PathBuf::from);

        let run_migrations = std::env::var("RUN_MIGRATIONS")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        Ok(Self {
            database_url,
            graphs_dir,
            run_migrations,
            engine: EngineConfig::from_env(),
        })
    }
}
