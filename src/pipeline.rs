//! Document ingestion pipeline.
//!
//! ```text
//! enqueue ──▶ chunk ──▶ extract ──▶ merge ──▶ finalize
//!                          └─ skipped when enable_graph = false ─┘
//! ```
//!
//! Enqueue validates the whole batch before writing anything and records
//! each document as `pending`. Processing claims pending documents, runs
//! the stages in order per document, and records `processed` or `failed`.
//! Distinct documents run concurrently up to `pipeline.max_parallel_insert`;
//! a document id is never processed twice at once.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::instrument;
use uuid::Uuid;

use ragspace_core::chunk::chunk_text;
use ragspace_core::models::{compute_doc_id, Chunk, DocStatus, DocStatusRecord, VectorRecord};

use crate::embedding::embed_batched;
use crate::engine::{EngineInstance, InFlightGuard};
use crate::error::{KbError, Result};
use crate::extract::{extract_chunk, ChunkExtraction, ExtractOptions};
use crate::merge::{build_graph_batch, timed};

/// Result of an enqueue call.
#[derive(Debug, Clone, Serialize)]
pub struct Enqueued {
    /// Token shared by every document of the call.
    pub track_id: String,
    /// Ids in submission order, duplicates collapsed.
    pub document_ids: Vec<String>,
}

/// Counts from one processing pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PipelineReport {
    pub processed: usize,
    pub failed: usize,
    /// `(document_id, error_msg)` for each failure.
    pub failures: Vec<(String, String)>,
}

enum DocOutcome {
    Processed,
    Failed(String),
    Skipped,
}

/// `insert_YYYYMMDD_HHMMSS_xxxxxxxx`
pub fn generate_track_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "insert_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    )
}

/// Check per-item list lengths against the batch size.
///
/// `enable_graph` may hold one flag (applied to every item) or one per
/// item; `file_paths` must hold one per item.
pub fn validate_batch(
    len: usize,
    enable_graph: Option<&[bool]>,
    file_paths: Option<&[String]>,
) -> Result<()> {
    if let Some(flags) = enable_graph {
        if flags.len() != 1 && flags.len() != len {
            return Err(KbError::BatchSizeMismatch {
                what: "enable_graph",
                expected: len,
                actual: flags.len(),
            });
        }
    }
    if let Some(paths) = file_paths {
        if paths.len() != len {
            return Err(KbError::BatchSizeMismatch {
                what: "file_paths",
                expected: len,
                actual: paths.len(),
            });
        }
    }
    Ok(())
}

struct Submission<'a> {
    id: String,
    content: &'a str,
    enable_graph: bool,
    file_path: Option<&'a str>,
}

impl EngineInstance {
    /// Enqueue one document. `enable_graph` defaults to `true`.
    pub async fn enqueue(
        &self,
        content: &str,
        enable_graph: Option<bool>,
        file_path: Option<&str>,
    ) -> Result<Enqueued> {
        let flags = enable_graph.map(|f| vec![f]);
        let paths = file_path.map(|p| vec![p.to_string()]);
        self.enqueue_batch(&[content.to_string()], flags.as_deref(), paths.as_deref())
            .await
    }

    /// Enqueue a batch sharing one track id.
    ///
    /// Fails before any write with `BatchSizeMismatch`, `EmptyDocument`,
    /// or `DocumentBusy`. Resubmitting a known document replaces its record
    /// with a fresh `pending` one and drops what the previous run derived.
    #[instrument(skip_all, fields(workspace = %self.workspace, batch = contents.len()))]
    pub async fn enqueue_batch(
        &self,
        contents: &[String],
        enable_graph: Option<&[bool]>,
        file_paths: Option<&[String]>,
    ) -> Result<Enqueued> {
        validate_batch(contents.len(), enable_graph, file_paths)?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut batch: Vec<Submission<'_>> = Vec::new();
        for (i, content) in contents.iter().enumerate() {
            if content.trim().is_empty() {
                return Err(KbError::EmptyDocument);
            }
            let id = compute_doc_id(content);
            if !seen.insert(id.clone()) {
                tracing::debug!(doc_id = %id, "duplicate content in batch collapsed");
                continue;
            }
            if self.is_in_flight(&id) {
                return Err(KbError::DocumentBusy(id));
            }
            let flag = match enable_graph {
                Some([only]) => *only,
                Some(flags) => flags[i],
                None => true,
            };
            batch.push(Submission {
                id,
                content,
                enable_graph: flag,
                file_path: file_paths.map(|p| p[i].as_str()),
            });
        }

        let track_id = generate_track_id();
        let limit = self.storage_timeout();
        let mut document_ids = Vec::with_capacity(batch.len());

        for item in batch {
            if let Some(previous) =
                timed(limit, "status read", self.storage.doc_status.get(&item.id)).await?
            {
                self.purge_derived(&item.id, &previous.chunk_ids).await?;
            }

            let record = DocStatusRecord::pending(
                item.content,
                item.file_path,
                item.enable_graph,
                &track_id,
            );
            let doc = serde_json::json!({
                "content": item.content,
                "file_path": record.file_path,
            });
            timed(
                limit,
                "full_docs write",
                self.storage
                    .full_docs
                    .upsert(BTreeMap::from([(item.id.clone(), doc)])),
            )
            .await?;
            timed(limit, "status write", self.storage.doc_status.upsert(&record)).await?;

            tracing::debug!(doc_id = %item.id, enable_graph = item.enable_graph, "enqueued");
            document_ids.push(item.id);
        }

        tracing::info!(track_id = %track_id, documents = document_ids.len(), "batch enqueued");
        Ok(Enqueued {
            track_id,
            document_ids,
        })
    }

    /// Enqueue and process one document, waiting for the outcome.
    pub async fn insert(
        self: &Arc<Self>,
        content: &str,
        enable_graph: Option<bool>,
        file_path: Option<&str>,
    ) -> Result<Enqueued> {
        let enqueued = self.enqueue(content, enable_graph, file_path).await?;
        self.process_pending().await?;
        Ok(enqueued)
    }

    /// Enqueue and process a batch, waiting for every outcome.
    pub async fn insert_batch(
        self: &Arc<Self>,
        contents: &[String],
        enable_graph: Option<&[bool]>,
        file_paths: Option<&[String]>,
    ) -> Result<Enqueued> {
        let enqueued = self
            .enqueue_batch(contents, enable_graph, file_paths)
            .await?;
        self.process_pending().await?;
        Ok(enqueued)
    }

    /// Start a background drain bound to this instance.
    ///
    /// Only one drain runs per instance. A call made while one is running
    /// flags it to go around again so freshly enqueued work is picked up;
    /// that call returns `None`.
    pub fn spawn_processing(self: Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if self.draining.swap(true, Ordering::SeqCst) {
            self.rerun.store(true, Ordering::SeqCst);
            return None;
        }

        Some(tokio::spawn(async move {
            loop {
                self.rerun.store(false, Ordering::SeqCst);
                match self.process_pending().await {
                    Ok(report) if report.processed + report.failed > 0 => tracing::info!(
                        workspace = %self.workspace,
                        processed = report.processed,
                        failed = report.failed,
                        "background processing pass finished"
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::error!(
                        workspace = %self.workspace,
                        error = %e,
                        "background processing pass failed"
                    ),
                }

                if self.rerun.load(Ordering::SeqCst) {
                    continue;
                }
                self.draining.store(false, Ordering::SeqCst);
                // A request may have flagged a rerun after the check above.
                if self.rerun.load(Ordering::SeqCst) && !self.draining.swap(true, Ordering::SeqCst)
                {
                    continue;
                }
                break;
            }
        }))
    }

    /// Claim every `pending` document and run it through the stages.
    ///
    /// Stage failures are recorded on the document and counted in the
    /// report; they never abort sibling documents.
    #[instrument(skip(self), fields(workspace = %self.workspace))]
    pub async fn process_pending(self: &Arc<Self>) -> Result<PipelineReport> {
        let pending = timed(
            self.storage_timeout(),
            "status scan",
            self.storage.doc_status.by_status(DocStatus::Pending),
        )
        .await?;

        let mut tasks = JoinSet::new();
        for record in pending {
            let Some(guard) = self.try_claim(&record.id) else {
                continue;
            };
            let engine = Arc::clone(self);
            tasks.spawn(async move {
                let id = record.id.clone();
                let outcome = engine.run_claimed(guard, &id).await;
                (id, outcome)
            });
        }

        let mut report = PipelineReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(DocOutcome::Processed))) => report.processed += 1,
                Ok((id, Ok(DocOutcome::Failed(msg)))) => {
                    report.failed += 1;
                    report.failures.push((id, msg));
                }
                Ok((_, Ok(DocOutcome::Skipped))) => {}
                Ok((id, Err(e))) => {
                    tracing::error!(doc_id = %id, error = %e, "could not record document outcome");
                    report.failed += 1;
                    report.failures.push((id, e.to_string()));
                }
                Err(e) => {
                    tracing::error!(error = %e, "processing task panicked");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn run_claimed(&self, _guard: InFlightGuard, id: &str) -> Result<DocOutcome> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| KbError::stage(id, "schedule", e))?;
        self.process_document(id).await
    }

    async fn transition(
        &self,
        record: &mut DocStatusRecord,
        next: DocStatus,
    ) -> anyhow::Result<()> {
        if !record.status.can_transition_to(next) {
            anyhow::bail!("illegal status transition {} -> {}", record.status, next);
        }
        record.status = next;
        record.updated_at = Utc::now();
        timed(
            self.storage_timeout(),
            "status write",
            self.storage.doc_status.upsert(record),
        )
        .await
    }

    #[instrument(skip(self), fields(workspace = %self.workspace))]
    async fn process_document(&self, id: &str) -> Result<DocOutcome> {
        let Some(mut record) =
            timed(self.storage_timeout(), "status read", self.storage.doc_status.get(id)).await?
        else {
            return Ok(DocOutcome::Skipped);
        };
        if record.status != DocStatus::Pending {
            return Ok(DocOutcome::Skipped);
        }

        self.transition(&mut record, DocStatus::Processing)
            .await
            .map_err(|e| KbError::stage(id, "status", e))?;

        match self.run_stages(&mut record).await {
            Ok(()) => {
                self.transition(&mut record, DocStatus::Processed)
                    .await
                    .map_err(|e| KbError::stage(id, "status", e))?;
                tracing::info!(doc_id = id, chunks = record.chunks_count, "document processed");
                Ok(DocOutcome::Processed)
            }
            Err(e) => {
                let msg = e.to_string();
                tracing::warn!(doc_id = id, error = %msg, "document failed");
                record.error_msg = Some(msg.clone());
                self.transition(&mut record, DocStatus::Failed)
                    .await
                    .map_err(|e| KbError::stage(id, "status", e))?;
                Ok(DocOutcome::Failed(msg))
            }
        }
    }

    async fn run_stages(&self, record: &mut DocStatusRecord) -> Result<()> {
        let id = record.id.clone();

        let chunks = self
            .chunk_stage(record)
            .await
            .map_err(|e| KbError::stage(&id, "chunk", format!("{e:#}")))?;

        if record.enable_graph {
            let extractions = self
                .extract_stage(&chunks)
                .await
                .map_err(|e| KbError::stage(&id, "extract", format!("{e:#}")))?;
            self.merge_stage(record, &extractions)
                .await
                .map_err(|e| KbError::stage(&id, "merge", format!("{e:#}")))?;
        } else {
            tracing::info!(
                doc_id = %id,
                "knowledge graph disabled for document; skipping extract and merge"
            );
        }

        timed(
            self.storage_timeout(),
            "flush",
            self.storage.flush_all(),
        )
        .await
        .map_err(|e| KbError::stage(&id, "finalize", format!("{e:#}")))?;
        Ok(())
    }

    async fn chunk_stage(&self, record: &mut DocStatusRecord) -> anyhow::Result<Vec<Chunk>> {
        let limit = self.storage_timeout();
        let doc = timed(limit, "full_docs read", self.storage.full_docs.get_by_id(&record.id))
            .await?
            .ok_or_else(|| anyhow::anyhow!("content missing from full_docs"))?;
        let content = doc
            .get("content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("full_docs entry has no content"))?;

        let chunks = chunk_text(&record.id, content, self.config.chunking.max_tokens);

        timed(
            limit,
            "chunk vector delete",
            self.storage.chunks_vdb.delete_by_document(&record.id),
        )
        .await?;

        // Chunk ids go on the record before any chunk is written.
        record.chunks_count = chunks.len();
        record.chunk_ids = chunks.iter().map(|c| c.id.clone()).collect();
        record.updated_at = Utc::now();
        timed(limit, "status write", self.storage.doc_status.upsert(record)).await?;

        let entries: BTreeMap<String, serde_json::Value> = chunks
            .iter()
            .map(|c| Ok((c.id.clone(), serde_json::to_value(c)?)))
            .collect::<anyhow::Result<_>>()?;
        timed(limit, "text_chunks write", self.storage.text_chunks.upsert(entries)).await?;

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = timed(
            self.model_timeout(),
            "chunk embedding",
            embed_batched(
                self.embedder.as_ref(),
                &texts,
                self.config.embedding.batch_size,
            ),
        )
        .await?;

        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(c, vector)| VectorRecord {
                id: c.id.clone(),
                document_id: Some(record.id.clone()),
                content: c.text.clone(),
                vector,
                metadata: serde_json::json!({
                    "chunk_index": c.chunk_index,
                    "file_path": record.file_path,
                    "tokens": c.tokens,
                }),
            })
            .collect();
        timed(limit, "chunk vector write", self.storage.chunks_vdb.upsert(records)).await?;

        tracing::debug!(doc_id = %record.id, chunks = chunks.len(), "chunked");
        Ok(chunks)
    }

    async fn extract_stage(&self, chunks: &[Chunk]) -> anyhow::Result<Vec<(String, ChunkExtraction)>> {
        let cache = self
            .config
            .pipeline
            .enable_llm_cache
            .then(|| self.storage.llm_response_cache.as_ref());
        let opts = ExtractOptions {
            max_gleaning: self.config.pipeline.max_gleaning,
            model_timeout: self.model_timeout(),
            storage_timeout: self.storage_timeout(),
            model_kwargs: &self.config.extraction.model_kwargs,
            cache,
        };

        let mut out = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let outcome = extract_chunk(self.extractor.as_ref(), chunk, &opts)
                .await
                .map_err(|e| e.context(format!("chunk {}", chunk.chunk_index)))?;
            tracing::debug!(
                chunk_id = %chunk.id,
                rounds = outcome.rounds,
                cache_hit = outcome.cache_hit,
                entities = outcome.extraction.entities.len(),
                relations = outcome.extraction.relations.len(),
                "extracted"
            );
            out.push((chunk.id.clone(), outcome.extraction));
        }
        Ok(out)
    }

    async fn merge_stage(
        &self,
        record: &DocStatusRecord,
        extractions: &[(String, ChunkExtraction)],
    ) -> anyhow::Result<()> {
        // Read, embed, and write as one step per workspace.
        let _graph = self.graph_lock.lock().await;
        let batch = timed(
            self.storage_timeout(),
            "graph read",
            build_graph_batch(self.storage.graph.as_ref(), &record.file_path, extractions),
        )
        .await?;
        let stats = self.merger().apply(&batch).await?;
        tracing::debug!(doc_id = %record.id, nodes = stats.nodes, edges = stats.edges, "merged");
        Ok(())
    }
}
