//! Persistence layer for the flow engine
//!
//! This module provides:
//! - [`ContextStore`], [`TraceStore`] and [`RetryTicketStore`] for single-entity access
//! - [`FlowStore`] for the compound operations that must be atomic
//! - [`InMemoryFlowStore`] for testing
//! - [`PostgresFlowStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryFlowStore;
pub use postgres::PostgresFlowStore;
pub use store::{BatchClaim, ContextStore, FlowStore, RetryTicketStore, StoreError, TraceStore};
