pub mod config;
pub mod graphs;
pub mod worker;

pub use config::WorkerConfig;
pub use graphs::load_graphs;
pub use worker::FlowWorker;
