pub mod snapshot;
pub mod types;
pub use types::*;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

#[async_trait]
pub trait TopologyStore {
    async fn load_topology(&self, name: &str) -> PersistResult<Option<TopologySnapshot>>;
    async fn save_topology(&mut self, name: &str, snapshot: &TopologySnapshot) -> PersistResult<()>;
}

/// One pretty-printed JSON file per topology name inside `dir`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.topology.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl TopologyStore for JsonFileStore {
    async fn load_topology(&self, name: &str) -> PersistResult<Option<TopologySnapshot>> {
        let path = self.path_for(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snap: TopologySnapshot = serde_json::from_slice(&bytes)?;
        if snap.version != TOPOLOGY_SCHEMA_VERSION {
            return Err(PersistError::FormatMismatch { expected: TOPOLOGY_SCHEMA_VERSION, found: snap.version });
        }
        debug!(path = %path.display(), nodes = snap.nodes.len(), "Topology loaded");
        Ok(Some(snap))
    }

    async fn save_topology(&mut self, name: &str, snapshot: &TopologySnapshot) -> PersistResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(name);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(snapshot)?;
        // write then rename so readers never see a half-written file
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        info!(path = %path.display(), bytes = body.len(), "Topology saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::MessageCategory;
    use crate::graph::GraphHost;
    use crate::pipeline::build_standard_graph;

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::new(dir.path().join("topologies"));
        assert!(store.load_topology("main").await.unwrap().is_none());

        let mut host = GraphHost::new();
        build_standard_graph(&mut host, "venue-a", MessageCategory::Trade).unwrap();
        let snap = snapshot::capture(&host);
        store.save_topology("main", &snap).await.unwrap();

        let loaded = store.load_topology("main").await.unwrap().unwrap();
        assert_eq!(loaded, snap);
        let restored = snapshot::restore(&loaded).unwrap();
        assert_eq!(restored.links().count(), 4);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        tokio::fs::write(store.path_for("broken"), b"{not json").await.unwrap();
        let err = store.load_topology("broken").await.unwrap_err();
        assert!(matches!(err, PersistError::Serialization(_)));
    }
}
