//! Graph definitions and their repository
//!
//! Graphs are authored and stored outside the engine. The engine only
//! reads them through [`GraphRepository`].

mod definition;
mod repository;

pub use definition::{EventDefinition, GraphDefinition, GraphError, NodeDefinition, NodeType};
pub use repository::{GraphRef, GraphRepository, InMemoryGraphRepository};
