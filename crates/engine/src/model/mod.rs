//! Domain model shared by every engine component
//!
//! This module contains:
//! - [`Context`] - one unit of data at one position of a graph
//! - [`Trace`] - one run of a graph, plus the derived [`TraceStatus`]
//! - [`RetryTicket`] - bookkeeping for one retry batch
//! - [`Payload`] - the opaque business data threaded through contexts

mod context;
mod payload;
mod ticket;
mod trace;

pub use context::{Context, ContextStatus, ErrorDetail, InvalidTransition, StreamId};
pub use payload::{EngineMeta, Payload};
pub use ticket::{RetryTicket, TicketEntityType, TransCompletion};
pub use trace::{Trace, TraceStatus};
