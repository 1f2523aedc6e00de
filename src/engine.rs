//! Per-workspace engine instance.
//!
//! An [`EngineInstance`] owns one workspace's storage set, its private copy
//! of the configuration, and the in-flight bookkeeping of its ingestion
//! pipeline. Model bindings are shared read-only across instances.
//!
//! Enqueue and processing live in [`crate::pipeline`]; this module covers
//! construction, teardown, status queries, retrieval, and deletion.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tracing::instrument;

use ragspace_core::embedding::Embedder;
use ragspace_core::models::{DocStatus, DocStatusRecord, VectorMatch};

use crate::config::Config;
use crate::error::{KbError, Result};
use crate::extract::EntityExtractor;
use crate::merge::{timed, GraphMerger};
use crate::storage::StorageSet;
use crate::workspace::WorkspaceId;

/// Error recorded on documents found mid-processing at startup.
pub const INTERRUPTED_MSG: &str = "interrupted before completion";

pub struct EngineInstance {
    pub(crate) workspace: WorkspaceId,
    pub(crate) config: Config,
    pub(crate) storage: StorageSet,
    pub(crate) embedder: Arc<dyn Embedder>,
    pub(crate) extractor: Arc<dyn EntityExtractor>,
    pub(crate) in_flight: Arc<Mutex<HashSet<String>>>,
    pub(crate) permits: Semaphore,
    pub(crate) draining: AtomicBool,
    pub(crate) rerun: AtomicBool,
    /// Held across every graph read-modify-write (merge and removal).
    pub(crate) graph_lock: AsyncMutex<()>,
    created_at: DateTime<Utc>,
}

/// Holds a document id in the in-flight set until dropped.
pub(crate) struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.id);
    }
}

impl EngineInstance {
    /// Build an instance over an uninitialized storage set. `config` should
    /// already be this instance's own copy.
    pub fn new(
        workspace: WorkspaceId,
        config: Config,
        storage: StorageSet,
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn EntityExtractor>,
    ) -> Self {
        let permits = Semaphore::new(config.pipeline.max_parallel_insert.max(1));
        Self {
            workspace,
            config,
            storage,
            embedder,
            extractor,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            permits,
            draining: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            graph_lock: AsyncMutex::new(()),
            created_at: Utc::now(),
        }
    }

    pub fn workspace(&self) -> &WorkspaceId {
        &self.workspace
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &StorageSet {
        &self.storage
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeouts.storage_secs)
    }

    pub(crate) fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeouts.model_secs)
    }

    pub(crate) fn merger(&self) -> GraphMerger<'_> {
        GraphMerger {
            storage: &self.storage,
            embedder: self.embedder.as_ref(),
            batch_size: self.config.embedding.batch_size,
            model_timeout: self.model_timeout(),
            storage_timeout: self.storage_timeout(),
        }
    }

    /// Initialize every storage, then fail documents a previous process
    /// left mid-processing.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        self.storage.initialize_all().await?;
        let recovered = self.recover_interrupted().await?;
        if recovered > 0 {
            tracing::warn!(
                workspace = %self.workspace,
                recovered,
                "marked interrupted documents as failed"
            );
        }
        Ok(())
    }

    async fn recover_interrupted(&self) -> anyhow::Result<usize> {
        let stuck = self.storage.doc_status.by_status(DocStatus::Processing).await?;
        for mut record in stuck.iter().cloned() {
            record.status = DocStatus::Failed;
            record.error_msg = Some(INTERRUPTED_MSG.to_string());
            record.updated_at = Utc::now();
            self.storage.doc_status.upsert(&record).await?;
        }
        Ok(stuck.len())
    }

    /// Flush and close every storage. Tasks still holding this instance
    /// will fail their next storage call.
    pub async fn finalize(&self) -> anyhow::Result<()> {
        self.storage.close_all().await
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        let set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.contains(id)
    }

    /// Claim `id` for exclusive processing. `None` when already claimed.
    pub(crate) fn try_claim(&self, id: &str) -> Option<InFlightGuard> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(&self.in_flight),
            id: id.to_string(),
        })
    }

    // ============ Status queries ============

    pub async fn document_status(&self, id: &str) -> Result<Option<DocStatusRecord>> {
        Ok(self.storage.doc_status.get(id).await?)
    }

    /// Every record, or only those with `filter` status.
    pub async fn statuses(&self, filter: Option<DocStatus>) -> Result<Vec<DocStatusRecord>> {
        let records = match filter {
            Some(status) => self.storage.doc_status.by_status(status).await?,
            None => self.storage.doc_status.all().await?,
        };
        Ok(records)
    }

    pub async fn statuses_by_track_id(&self, track_id: &str) -> Result<Vec<DocStatusRecord>> {
        Ok(self.storage.doc_status.by_track_id(track_id).await?)
    }

    pub async fn status_counts(&self) -> Result<BTreeMap<DocStatus, usize>> {
        Ok(self.storage.doc_status.counts().await?)
    }

    // ============ Retrieval ============

    /// Plain vector retrieval over the chunk namespace.
    #[instrument(skip(self, query), fields(workspace = %self.workspace))]
    pub async fn search_chunks(&self, query: &str, top_k: usize) -> Result<Vec<VectorMatch>> {
        if query.trim().is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let vectors = timed(
            self.model_timeout(),
            "query embedding",
            self.embedder.embed(&[query.to_string()]),
        )
        .await?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("embedder returned no vector for query"))?;
        Ok(self.storage.chunks_vdb.query(&vector, top_k).await?)
    }

    /// Graph node names contributed by the chunks of `id`.
    pub async fn graph_nodes_for_document(&self, id: &str) -> Result<Vec<String>> {
        let Some(record) = self.storage.doc_status.get(id).await? else {
            return Ok(Vec::new());
        };
        Ok(self
            .storage
            .graph
            .nodes_for_chunks(&record.chunk_ids)
            .await?)
    }

    // ============ Deletion ============

    /// Remove a document and everything derived from it: status record,
    /// content, chunks, chunk vectors, and its graph fragments. Nodes and
    /// edges left without fragments are removed with their vectors.
    ///
    /// Returns `false` when the document is unknown.
    #[instrument(skip(self), fields(workspace = %self.workspace))]
    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        let Some(_claim) = self.try_claim(id) else {
            return Err(KbError::DocumentBusy(id.to_string()));
        };

        let Some(record) = self.storage.doc_status.get(id).await? else {
            return Ok(false);
        };

        self.purge_derived(id, &record.chunk_ids).await?;
        self.storage.full_docs.delete(&[id.to_string()]).await?;
        self.storage.doc_status.delete(id).await?;
        self.storage.flush_all().await?;

        tracing::info!(doc_id = id, chunks = record.chunk_ids.len(), "deleted document");
        Ok(true)
    }

    /// Drop the chunks, chunk vectors, and graph fragments of a document
    /// while keeping its content and status record.
    pub(crate) async fn purge_derived(&self, id: &str, chunk_ids: &[String]) -> anyhow::Result<()> {
        let limit = self.storage_timeout();
        if !chunk_ids.is_empty() {
            timed(limit, "chunk delete", self.storage.text_chunks.delete(chunk_ids)).await?;
            let _graph = self.graph_lock.lock().await;
            self.merger().remove_chunks(chunk_ids).await?;
        }
        timed(
            limit,
            "chunk vector delete",
            self.storage.chunks_vdb.delete_by_document(id),
        )
        .await?;
        Ok(())
    }
}
