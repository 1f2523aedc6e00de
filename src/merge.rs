//! Merging a document's extractions into the workspace graph.
//!
//! Merging adds per-chunk fragments to existing nodes and edges; it never
//! replaces what other documents contributed. The document's graph
//! contributions land all-or-nothing: entity and relation vectors are
//! written first, the graph batch is applied atomically second, and if the
//! graph write fails the previous vector records are put back.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use ragspace_core::embedding::Embedder;
use ragspace_core::graph::{
    EntityFragment, GraphBatch, GraphEdge, GraphNode, GraphRemoval, RelationFragment,
    UNKNOWN_ENTITY_TYPE,
};
use ragspace_core::models::{prefixed_id, VectorRecord};
use ragspace_core::store::{GraphStorage, StorageLifecycle, VectorStorage};

use crate::embedding::embed_batched;
use crate::extract::ChunkExtraction;
use crate::storage::StorageSet;

/// Await `fut`, failing with a labelled error after `limit`.
pub async fn timed<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| anyhow!("{} timed out after {:?}", what, limit))?
}

pub fn entity_vector_id(name: &str) -> String {
    prefixed_id("ent-", name)
}

pub fn relation_vector_id(a: &str, b: &str) -> String {
    let (source, target) = GraphEdge::key(a, b);
    prefixed_id("rel-", &format!("{}\u{1f}{}", source, target))
}

/// Build the complete new state of every node and edge touched by one
/// document's extractions, starting from what is already stored.
pub async fn build_graph_batch(
    graph: &dyn GraphStorage,
    file_path: &str,
    extractions: &[(String, ChunkExtraction)],
) -> Result<GraphBatch> {
    let mut nodes: BTreeMap<String, GraphNode> = BTreeMap::new();
    // Endpoints already in storage that this document leaves unchanged.
    let mut stored: HashSet<String> = HashSet::new();
    let mut edges: BTreeMap<(String, String), GraphEdge> = BTreeMap::new();

    for (chunk_id, extraction) in extractions {
        for entity in &extraction.entities {
            let name = entity.name.trim();
            if name.is_empty() {
                continue;
            }
            if !nodes.contains_key(name) {
                let node = graph
                    .get_node(name)
                    .await?
                    .unwrap_or_else(|| GraphNode::new(name));
                nodes.insert(name.to_string(), node);
            }
            if let Some(node) = nodes.get_mut(name) {
                node.absorb(
                    chunk_id,
                    EntityFragment {
                        entity_type: entity.entity_type.clone(),
                        description: entity.description.clone(),
                        file_path: file_path.to_string(),
                    },
                );
            }
        }
    }

    for (chunk_id, extraction) in extractions {
        for relation in &extraction.relations {
            let (source, target) = (relation.source.trim(), relation.target.trim());
            if source.is_empty() || target.is_empty() || source == target {
                continue;
            }

            for endpoint in [source, target] {
                if nodes.contains_key(endpoint) || stored.contains(endpoint) {
                    continue;
                }
                if graph.get_node(endpoint).await?.is_some() {
                    stored.insert(endpoint.to_string());
                    continue;
                }
                let mut node = GraphNode::new(endpoint);
                node.absorb(
                    chunk_id,
                    EntityFragment {
                        entity_type: UNKNOWN_ENTITY_TYPE.to_string(),
                        description: relation.description.clone(),
                        file_path: file_path.to_string(),
                    },
                );
                nodes.insert(endpoint.to_string(), node);
            }

            let key = GraphEdge::key(source, target);
            if !edges.contains_key(&key) {
                let edge = graph
                    .get_edge(source, target)
                    .await?
                    .unwrap_or_else(|| GraphEdge::new(source, target));
                edges.insert(key.clone(), edge);
            }
            if let Some(edge) = edges.get_mut(&key) {
                edge.absorb(
                    chunk_id,
                    RelationFragment {
                        description: relation.description.clone(),
                        keywords: relation.keywords.clone(),
                        weight: relation.weight,
                        file_path: file_path.to_string(),
                    },
                );
            }
        }
    }

    Ok(GraphBatch {
        nodes: nodes.into_values().collect(),
        edges: edges.into_values().collect(),
    })
}

/// Writes graph batches and keeps the entity/relation vectors in step.
pub struct GraphMerger<'a> {
    pub storage: &'a StorageSet,
    pub embedder: &'a dyn Embedder,
    pub batch_size: usize,
    pub model_timeout: Duration,
    pub storage_timeout: Duration,
}

/// What a merge wrote.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeStats {
    pub nodes: usize,
    pub edges: usize,
}

impl GraphMerger<'_> {
    async fn node_vectors(&self, nodes: &[GraphNode]) -> Result<Vec<VectorRecord>> {
        let texts: Vec<String> = nodes
            .iter()
            .map(|n| format!("{}\n{}", n.name, n.description))
            .collect();
        let vectors = self.embed(&texts).await?;
        Ok(nodes
            .iter()
            .zip(texts)
            .zip(vectors)
            .map(|((n, content), vector)| VectorRecord {
                id: entity_vector_id(&n.name),
                document_id: None,
                content,
                vector,
                metadata: serde_json::json!({
                    "entity_name": n.name,
                    "entity_type": n.entity_type,
                    "source_chunks": n.fragments.len(),
                }),
            })
            .collect())
    }

    async fn edge_vectors(&self, edges: &[GraphEdge]) -> Result<Vec<VectorRecord>> {
        let texts: Vec<String> = edges
            .iter()
            .map(|e| {
                format!(
                    "{}\t{}\n{}\n{}",
                    e.source,
                    e.target,
                    e.keywords.join(", "),
                    e.description
                )
            })
            .collect();
        let vectors = self.embed(&texts).await?;
        Ok(edges
            .iter()
            .zip(texts)
            .zip(vectors)
            .map(|((e, content), vector)| VectorRecord {
                id: relation_vector_id(&e.source, &e.target),
                document_id: None,
                content,
                vector,
                metadata: serde_json::json!({
                    "src_id": e.source,
                    "tgt_id": e.target,
                    "weight": e.weight,
                }),
            })
            .collect())
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        timed(
            self.model_timeout,
            "embedding",
            embed_batched(self.embedder, texts, self.batch_size),
        )
        .await
    }

    /// Upsert vectors for `records` into `store`, returning what they
    /// replaced so the write can be undone.
    async fn swap_in(
        &self,
        store: &dyn VectorStorage,
        records: Vec<VectorRecord>,
    ) -> Result<(Vec<String>, Vec<VectorRecord>)> {
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let previous = timed(self.storage_timeout, "vector read", store.get_by_ids(&ids)).await?;
        timed(self.storage_timeout, "vector write", store.upsert(records)).await?;
        Ok((ids, previous))
    }

    async fn restore(
        &self,
        store: &dyn VectorStorage,
        ids: Vec<String>,
        previous: Vec<VectorRecord>,
    ) {
        let kept: HashSet<&String> = previous.iter().map(|r| &r.id).collect();
        let fresh: Vec<String> = ids.into_iter().filter(|id| !kept.contains(id)).collect();
        let limit = self.storage_timeout;
        if let Err(e) = timed(limit, "vector rollback delete", store.delete(&fresh)).await {
            tracing::error!(namespace = store.namespace(), error = %e, "vector rollback delete failed");
        }
        if !previous.is_empty() {
            if let Err(e) = timed(limit, "vector rollback restore", store.upsert(previous)).await {
                tracing::error!(namespace = store.namespace(), error = %e, "vector rollback restore failed");
            }
        }
    }

    /// Write `batch` and its vectors as one unit.
    pub async fn apply(&self, batch: &GraphBatch) -> Result<MergeStats> {
        if batch.is_empty() {
            return Ok(MergeStats::default());
        }

        let node_records = self.node_vectors(&batch.nodes).await?;
        let edge_records = self.edge_vectors(&batch.edges).await?;

        let entities = self.storage.entities_vdb.as_ref();
        let relationships = self.storage.relationships_vdb.as_ref();

        let (node_ids, node_prev) = self.swap_in(entities, node_records).await?;
        let (edge_ids, edge_prev) = match self.swap_in(relationships, edge_records).await {
            Ok(swapped) => swapped,
            Err(e) => {
                self.restore(entities, node_ids, node_prev).await;
                return Err(e);
            }
        };

        let written = timed(
            self.storage_timeout,
            "graph write",
            self.storage.graph.upsert_batch(batch),
        )
        .await;
        if let Err(e) = written {
            self.restore(entities, node_ids, node_prev).await;
            self.restore(relationships, edge_ids, edge_prev).await;
            return Err(e).context("graph batch rejected; vectors rolled back");
        }

        Ok(MergeStats {
            nodes: batch.nodes.len(),
            edges: batch.edges.len(),
        })
    }

    /// Remove the graph fragments of `chunk_ids` and bring the entity and
    /// relation vectors in line with what is left.
    pub async fn remove_chunks(&self, chunk_ids: &[String]) -> Result<GraphRemoval> {
        if chunk_ids.is_empty() {
            return Ok(GraphRemoval::default());
        }
        let removal = timed(
            self.storage_timeout,
            "graph removal",
            self.storage.graph.remove_chunks(chunk_ids),
        )
        .await?;

        let dead_nodes: Vec<String> = removal
            .removed_nodes
            .iter()
            .map(|n| entity_vector_id(n))
            .collect();
        let dead_edges: Vec<String> = removal
            .removed_edges
            .iter()
            .map(|(a, b)| relation_vector_id(a, b))
            .collect();
        let limit = self.storage_timeout;
        let entities = self.storage.entities_vdb.as_ref();
        let relationships = self.storage.relationships_vdb.as_ref();
        timed(limit, "vector delete", entities.delete(&dead_nodes)).await?;
        timed(limit, "vector delete", relationships.delete(&dead_edges)).await?;

        let node_records = self.node_vectors(&removal.updated_nodes).await?;
        let edge_records = self.edge_vectors(&removal.updated_edges).await?;
        if !node_records.is_empty() {
            timed(limit, "vector write", entities.upsert(node_records)).await?;
        }
        if !edge_records.is_empty() {
            timed(limit, "vector write", relationships.upsert(edge_records)).await?;
        }

        Ok(removal)
    }
}
