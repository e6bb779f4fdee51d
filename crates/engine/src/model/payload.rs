//! Payload carried by every context
//!
//! The engine treats business data as an opaque JSON value; only node
//! executors interpret it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::graph::NodeType;

/// Metadata the engine records about where a payload currently is
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineMeta {
    pub graph_id: Option<Uuid>,
    pub meta_id: String,
    pub version: u32,
    pub node_id: String,
    pub node_type: Option<NodeType>,
    /// Number of executor attempts at the current node
    #[serde(default)]
    pub attempt: u32,
}

/// Business data + engine metadata + pass-through data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub business: Value,

    #[serde(default)]
    pub engine: EngineMeta,

    /// Data the engine forwards untouched from node to node
    #[serde(default)]
    pub pass_through: Value,

    /// Output-scope cache keyed by node id (graphs with output scoping only)
    #[serde(default)]
    pub scope: BTreeMap<String, Value>,
}

impl Default for Payload {
    fn default() -> Self {
        Self::new(Value::Object(Default::default()))
    }
}

impl Payload {
    pub fn new(business: Value) -> Self {
        Self {
            business,
            engine: EngineMeta::default(),
            pass_through: Value::Null,
            scope: BTreeMap::new(),
        }
    }

    pub fn with_pass_through(mut self, pass_through: Value) -> Self {
        self.pass_through = pass_through;
        self
    }

    /// Merge a caller patch into the business data
    ///
    /// Objects merge recursively, `null` removes a key, anything else replaces.
    pub fn merge(&mut self, patch: &Value) {
        merge_value(&mut self.business, patch);
    }

    /// Recompute the scope entry of `node_id` from the business data
    ///
    /// With no declared keys the whole business value is cached.
    pub fn derive_scope(&mut self, node_id: &str, keys: &[String]) {
        let scoped = if keys.is_empty() {
            self.business.clone()
        } else {
            let mut out = serde_json::Map::new();
            if let Value::Object(map) = &self.business {
                for key in keys {
                    if let Some(v) = map.get(key) {
                        out.insert(key.clone(), v.clone());
                    }
                }
            }
            Value::Object(out)
        };
        self.scope.insert(node_id.to_string(), scoped);
    }
}

fn merge_value(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge_value(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
