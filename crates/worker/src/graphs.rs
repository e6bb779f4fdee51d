// Graph definitions loaded from disk

use std::path::Path;

use anyhow::{Context, Result};
use flowmesh_engine::graph::{GraphDefinition, InMemoryGraphRepository};
use tracing::{debug, info};

/// Register every `*.json` graph definition found in `dir`
///
/// Files are read in name order. Any file that fails to parse or validate
/// aborts the load.
pub fn load_graphs(dir: &Path) -> Result<InMemoryGraphRepository> {
    let repository = InMemoryGraphRepository::new();

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read graphs directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    for path in paths {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let graph: GraphDefinition = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid graph definition in {}", path.display()))?;
        let meta_id = graph.meta_id.clone();
        let version = graph.version;
        let id = repository
            .register(graph)
            .with_context(|| format!("Graph in {} failed validation", path.display()))?;
        debug!(graph_id = %id, %meta_id, version, "registered graph");
    }

    info!(graphs = repository.len(), dir = %dir.display(), "graphs loaded");
    Ok(repository)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmesh_engine::graph::{GraphRef, GraphRepository, NodeDefinition};

    fn write_graph(dir: &Path, file: &str, graph: &GraphDefinition) {
        let raw = serde_json::to_string(graph).unwrap();
        std::fs::write(dir.join(file), raw).unwrap();
    }

    #[tokio::test]
    async fn test_loads_json_graphs_only() {
        let dir = tempfile::tempdir().unwrap();
        let graph = GraphDefinition::new("orders", 1, "start")
            .with_node(NodeDefinition::start("start"));
        write_graph(dir.path(), "orders.json", &graph);
        std::fs::write(dir.path().join("README.md"), "not a graph").unwrap();

        let repository = load_graphs(dir.path()).unwrap();

        assert_eq!(repository.len(), 1);
        let resolved = repository.resolve(&GraphRef::meta("orders", 1)).await;
        assert_eq!(resolved.map(|g| g.id), Some(graph.id));
    }

    #[test]
    fn test_invalid_graph_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{\"nodes\": 3}").unwrap();

        assert!(load_graphs(dir.path()).is_err());
    }
}
