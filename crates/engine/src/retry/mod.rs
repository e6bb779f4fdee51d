//! Retry subsystem
//!
//! Retryable failures park their contexts as RETRYABLE under a batch key,
//! with one [`RetryTicket`](crate::model::RetryTicket) per batch. The
//! [`RetryScheduler`] periodically wakes the sweep, which claims due
//! batches and resubmits them to their node.

mod policy;
mod scheduler;
mod sweeper;

pub use policy::RetryPolicy;
pub use scheduler::RetryScheduler;
pub use sweeper::{retry_lease_key, RetrySweeper, SweepReport};
