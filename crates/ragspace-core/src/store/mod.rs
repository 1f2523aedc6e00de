//! Storage capability contract.
//!
//! Every workspace owns one set of storages, one per namespace. Each
//! storage implements [`StorageLifecycle`] plus exactly one of the kind
//! traits:
//!
//! | Trait | Namespaces |
//! |-------|------------|
//! | [`KvStorage`] | `full_docs`, `text_chunks`, `llm_response_cache` |
//! | [`VectorStorage`] | `chunks`, `entities`, `relationships` |
//! | [`GraphStorage`] | `chunk_entity_relation` |
//! | [`DocStatusStorage`] | `doc_status` |
//!
//! The engine and the pipeline depend only on these traits. Which backend
//! implements them is decided once, when the workspace's engine instance is
//! constructed.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::graph::{GraphBatch, GraphEdge, GraphNode, GraphRemoval};
use crate::models::{DocStatus, DocStatusRecord, VectorMatch, VectorRecord};

pub const NS_FULL_DOCS: &str = "full_docs";
pub const NS_TEXT_CHUNKS: &str = "text_chunks";
pub const NS_LLM_CACHE: &str = "llm_response_cache";
pub const NS_CHUNKS_VDB: &str = "chunks";
pub const NS_ENTITIES_VDB: &str = "entities";
pub const NS_RELATIONSHIPS_VDB: &str = "relationships";
pub const NS_GRAPH: &str = "chunk_entity_relation";
pub const NS_DOC_STATUS: &str = "doc_status";

const NEW: u8 = 0;
const READY: u8 = 1;
const CLOSED: u8 = 2;

/// Tracks `initialize`/`close` so misuse surfaces as an error.
///
/// Shared by the built-in backends.
pub struct Lifecycle {
    pub namespace: String,
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            state: AtomicU8::new(NEW),
        }
    }

    pub fn check(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            READY => Ok(()),
            NEW => bail!("storage '{}' used before initialize()", self.namespace),
            _ => bail!("storage '{}' is closed", self.namespace),
        }
    }

    pub fn open(&self) -> Result<()> {
        if self.state.load(Ordering::Acquire) == CLOSED {
            bail!("storage '{}' is closed", self.namespace);
        }
        self.state.store(READY, Ordering::Release);
        Ok(())
    }

    pub fn close(&self) {
        self.state.store(CLOSED, Ordering::Release);
    }

    pub fn poisoned(&self) -> anyhow::Error {
        anyhow!("storage '{}' lock poisoned", self.namespace)
    }
}

/// Lifecycle calls shared by every storage kind.
///
/// Operations other than `initialize` fail until `initialize` succeeds, and
/// every operation fails after `close`.
#[async_trait]
pub trait StorageLifecycle: Send + Sync {
    /// The namespace this storage serves (e.g. `"full_docs"`).
    fn namespace(&self) -> &str;

    /// Prepare the backend (create tables, load snapshots).
    async fn initialize(&self) -> Result<()>;

    /// Persist buffered writes.
    async fn flush(&self) -> Result<()>;

    /// Release handles. Further calls fail.
    async fn close(&self) -> Result<()>;
}

/// JSON values keyed by string id.
#[async_trait]
pub trait KvStorage: StorageLifecycle {
    async fn get_by_id(&self, id: &str) -> Result<Option<serde_json::Value>>;

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<serde_json::Value>>>;

    /// Returns the subset of `keys` that are *not* stored.
    async fn filter_keys(&self, keys: &[String]) -> Result<HashSet<String>>;

    async fn upsert(&self, entries: BTreeMap<String, serde_json::Value>) -> Result<()>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    async fn len(&self) -> Result<usize>;
}

/// Embedding vectors with their source text.
#[async_trait]
pub trait VectorStorage: StorageLifecycle {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()>;

    /// Top-`top_k` records by cosine similarity, best first.
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>>;

    /// Records for the ids that exist; missing ids are skipped.
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<VectorRecord>>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    /// Delete every record owned by `document_id`, returning how many.
    async fn delete_by_document(&self, document_id: &str) -> Result<usize>;

    async fn count_for_document(&self, document_id: &str) -> Result<usize>;

    async fn len(&self) -> Result<usize>;
}

/// Entity/relation graph.
#[async_trait]
pub trait GraphStorage: StorageLifecycle {
    async fn get_node(&self, name: &str) -> Result<Option<GraphNode>>;

    async fn get_edge(&self, a: &str, b: &str) -> Result<Option<GraphEdge>>;

    async fn node_degree(&self, name: &str) -> Result<usize>;

    async fn node_count(&self) -> Result<usize>;

    async fn edge_count(&self) -> Result<usize>;

    /// Names of nodes with at least one fragment from `chunk_ids`.
    async fn nodes_for_chunks(&self, chunk_ids: &[String]) -> Result<Vec<String>>;

    /// Write every node and edge of the batch atomically.
    async fn upsert_batch(&self, batch: &GraphBatch) -> Result<()>;

    /// Drop the fragments of `chunk_ids` atomically, deleting nodes and
    /// edges left without fragments.
    async fn remove_chunks(&self, chunk_ids: &[String]) -> Result<GraphRemoval>;
}

/// Per-document status records.
#[async_trait]
pub trait DocStatusStorage: StorageLifecycle {
    async fn get(&self, id: &str) -> Result<Option<DocStatusRecord>>;

    /// Insert or overwrite the record with the same id.
    async fn upsert(&self, record: &DocStatusRecord) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<bool>;

    async fn by_status(&self, status: DocStatus) -> Result<Vec<DocStatusRecord>>;

    async fn by_track_id(&self, track_id: &str) -> Result<Vec<DocStatusRecord>>;

    async fn all(&self) -> Result<Vec<DocStatusRecord>>;

    /// Count per status; every status is present, possibly with zero.
    async fn counts(&self) -> Result<BTreeMap<DocStatus, usize>>;
}
