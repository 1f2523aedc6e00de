//! Per-workspace storage sets and the factory that builds them.
//!
//! The engine never names a backend. It receives a [`StorageSet`] of trait
//! objects from a [`StorageFactory`], chosen once when the workspace's
//! instance is constructed.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use ragspace_core::store::memory::{
    MemoryDocStatusStorage, MemoryGraphStorage, MemoryKvStorage, MemoryVectorStorage,
};
use ragspace_core::store::{
    DocStatusStorage, GraphStorage, KvStorage, StorageLifecycle, VectorStorage, NS_CHUNKS_VDB,
    NS_DOC_STATUS, NS_ENTITIES_VDB, NS_FULL_DOCS, NS_GRAPH, NS_LLM_CACHE, NS_RELATIONSHIPS_VDB,
    NS_TEXT_CHUNKS,
};

use crate::config::{BackendKind, StorageConfig};
use crate::db;
use crate::sqlite_store::{
    SqliteDocStatusStorage, SqliteGraphStorage, SqliteKvStorage, SqliteVectorStorage,
};
use crate::workspace::WorkspaceId;

/// Every storage owned by one workspace.
#[derive(Clone)]
pub struct StorageSet {
    pub full_docs: Arc<dyn KvStorage>,
    pub text_chunks: Arc<dyn KvStorage>,
    pub llm_response_cache: Arc<dyn KvStorage>,
    pub chunks_vdb: Arc<dyn VectorStorage>,
    pub entities_vdb: Arc<dyn VectorStorage>,
    pub relationships_vdb: Arc<dyn VectorStorage>,
    pub graph: Arc<dyn GraphStorage>,
    pub doc_status: Arc<dyn DocStatusStorage>,
}

impl StorageSet {
    /// In-memory set, used by tests and the default configuration.
    pub fn in_memory() -> Self {
        Self {
            full_docs: Arc::new(MemoryKvStorage::new(NS_FULL_DOCS)),
            text_chunks: Arc::new(MemoryKvStorage::new(NS_TEXT_CHUNKS)),
            llm_response_cache: Arc::new(MemoryKvStorage::new(NS_LLM_CACHE)),
            chunks_vdb: Arc::new(MemoryVectorStorage::new(NS_CHUNKS_VDB)),
            entities_vdb: Arc::new(MemoryVectorStorage::new(NS_ENTITIES_VDB)),
            relationships_vdb: Arc::new(MemoryVectorStorage::new(NS_RELATIONSHIPS_VDB)),
            graph: Arc::new(MemoryGraphStorage::new(NS_GRAPH)),
            doc_status: Arc::new(MemoryDocStatusStorage::new(NS_DOC_STATUS)),
        }
    }

    fn members(&self) -> [&dyn StorageLifecycle; 8] {
        [
            self.full_docs.as_ref(),
            self.text_chunks.as_ref(),
            self.llm_response_cache.as_ref(),
            self.chunks_vdb.as_ref(),
            self.entities_vdb.as_ref(),
            self.relationships_vdb.as_ref(),
            self.graph.as_ref(),
            self.doc_status.as_ref(),
        ]
    }

    /// Initialize every storage in order. Stops at the first failure.
    pub async fn initialize_all(&self) -> Result<()> {
        for s in self.members() {
            s.initialize()
                .await
                .with_context(|| format!("initializing storage '{}'", s.namespace()))?;
        }
        Ok(())
    }

    pub async fn flush_all(&self) -> Result<()> {
        for s in self.members() {
            s.flush()
                .await
                .with_context(|| format!("flushing storage '{}'", s.namespace()))?;
        }
        Ok(())
    }

    /// Flush (best effort) and close every storage. Every member is closed
    /// even when an earlier one fails; the first error is returned.
    pub async fn close_all(&self) -> Result<()> {
        let mut first_err = None;
        for s in self.members() {
            if let Err(e) = s.flush().await {
                tracing::debug!(namespace = s.namespace(), error = %e, "flush before close failed");
            }
        }
        for s in self.members() {
            if let Err(e) = s.close().await {
                tracing::warn!(namespace = s.namespace(), error = %e, "closing storage failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Builds the storage set for a workspace. The result is not yet
/// initialized; the manager calls [`StorageSet::initialize_all`].
#[async_trait]
pub trait StorageFactory: Send + Sync {
    async fn open(&self, workspace: &WorkspaceId) -> Result<StorageSet>;
}

/// Factory driven by the `[storage]` config section.
pub struct ConfiguredStorageFactory {
    config: StorageConfig,
}

impl ConfiguredStorageFactory {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }
}

fn kv(kind: BackendKind, pool: Option<&sqlx::SqlitePool>, ns: &str) -> Arc<dyn KvStorage> {
    match (kind, pool) {
        (BackendKind::Sqlite, Some(pool)) => Arc::new(SqliteKvStorage::new(pool.clone(), ns)),
        _ => Arc::new(MemoryKvStorage::new(ns)),
    }
}

fn vector(kind: BackendKind, pool: Option<&sqlx::SqlitePool>, ns: &str) -> Arc<dyn VectorStorage> {
    match (kind, pool) {
        (BackendKind::Sqlite, Some(pool)) => Arc::new(SqliteVectorStorage::new(pool.clone(), ns)),
        _ => Arc::new(MemoryVectorStorage::new(ns)),
    }
}

#[async_trait]
impl StorageFactory for ConfiguredStorageFactory {
    async fn open(&self, workspace: &WorkspaceId) -> Result<StorageSet> {
        let cfg = &self.config;
        let pool = if cfg.uses_sqlite() {
            let dir = cfg.workspace_dir(workspace);
            Some(
                db::connect(&dir)
                    .await
                    .with_context(|| format!("opening database in {}", dir.display()))?,
            )
        } else {
            None
        };
        let pool = pool.as_ref();

        let graph: Arc<dyn GraphStorage> = match (cfg.graph, pool) {
            (BackendKind::Sqlite, Some(p)) => Arc::new(SqliteGraphStorage::new(p.clone(), NS_GRAPH)),
            _ => Arc::new(MemoryGraphStorage::new(NS_GRAPH)),
        };
        let doc_status: Arc<dyn DocStatusStorage> = match (cfg.doc_status, pool) {
            (BackendKind::Sqlite, Some(p)) => {
                Arc::new(SqliteDocStatusStorage::new(p.clone(), NS_DOC_STATUS))
            }
            _ => Arc::new(MemoryDocStatusStorage::new(NS_DOC_STATUS)),
        };

        Ok(StorageSet {
            full_docs: kv(cfg.kv, pool, NS_FULL_DOCS),
            text_chunks: kv(cfg.kv, pool, NS_TEXT_CHUNKS),
            llm_response_cache: kv(cfg.kv, pool, NS_LLM_CACHE),
            chunks_vdb: vector(cfg.vector, pool, NS_CHUNKS_VDB),
            entities_vdb: vector(cfg.vector, pool, NS_ENTITIES_VDB),
            relationships_vdb: vector(cfg.vector, pool, NS_RELATIONSHIPS_VDB),
            graph,
            doc_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_all() {
        let set = StorageSet::in_memory();
        assert!(set.doc_status.counts().await.is_err());
        set.initialize_all().await.unwrap();
        set.flush_all().await.unwrap();
        assert_eq!(set.full_docs.len().await.unwrap(), 0);
        set.close_all().await.unwrap();
        assert!(set.full_docs.len().await.is_err());
    }

    #[tokio::test]
    async fn test_configured_factory_mixes_backends() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = StorageConfig {
            working_dir: tmp.path().to_path_buf(),
            doc_status: BackendKind::Sqlite,
            ..StorageConfig::default()
        };
        let ws = WorkspaceId::parse("mixed").unwrap();
        let set = ConfiguredStorageFactory::new(config).open(&ws).await.unwrap();
        set.initialize_all().await.unwrap();
        assert!(tmp.path().join("mixed").join(db::DB_FILE).exists());
        assert_eq!(set.doc_status.namespace(), NS_DOC_STATUS);
        set.close_all().await.unwrap();
    }
}
