//! In-memory storage backends.
//!
//! Uses `HashMap`s behind `std::sync::RwLock` for thread safety. Vector
//! search is brute-force cosine similarity over all stored vectors. Locks
//! are never held across an `.await`: every method takes the lock, does its
//! work synchronously, and releases it before returning.
//!
//! Isolation between workspaces comes from ownership: each engine instance
//! constructs its own set of these stores.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::graph::{GraphBatch, GraphEdge, GraphNode, GraphRemoval, GraphState};
use crate::models::{DocStatus, DocStatusRecord, VectorMatch, VectorRecord};

use super::{
    DocStatusStorage, GraphStorage, KvStorage, Lifecycle, StorageLifecycle, VectorStorage,
};

macro_rules! memory_lifecycle {
    ($ty:ty) => {
        #[async_trait]
        impl StorageLifecycle for $ty {
            fn namespace(&self) -> &str {
                &self.lifecycle.namespace
            }

            async fn initialize(&self) -> Result<()> {
                self.lifecycle.open()
            }

            async fn flush(&self) -> Result<()> {
                self.lifecycle.check()
            }

            async fn close(&self) -> Result<()> {
                self.lifecycle.close();
                Ok(())
            }
        }
    };
}

// ============ Key-Value ============

pub struct MemoryKvStorage {
    lifecycle: Lifecycle,
    data: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryKvStorage {
    pub fn new(namespace: &str) -> Self {
        Self {
            lifecycle: Lifecycle::new(namespace),
            data: RwLock::new(HashMap::new()),
        }
    }
}

memory_lifecycle!(MemoryKvStorage);

#[async_trait]
impl KvStorage for MemoryKvStorage {
    async fn get_by_id(&self, id: &str) -> Result<Option<serde_json::Value>> {
        self.lifecycle.check()?;
        let data = self.data.read().map_err(|_| self.lifecycle.poisoned())?;
        Ok(data.get(id).cloned())
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<serde_json::Value>>> {
        self.lifecycle.check()?;
        let data = self.data.read().map_err(|_| self.lifecycle.poisoned())?;
        Ok(ids.iter().map(|id| data.get(id).cloned()).collect())
    }

    async fn filter_keys(&self, keys: &[String]) -> Result<HashSet<String>> {
        self.lifecycle.check()?;
        let data = self.data.read().map_err(|_| self.lifecycle.poisoned())?;
        Ok(keys
            .iter()
            .filter(|k| !data.contains_key(*k))
            .cloned()
            .collect())
    }

    async fn upsert(&self, entries: BTreeMap<String, serde_json::Value>) -> Result<()> {
        self.lifecycle.check()?;
        let mut data = self.data.write().map_err(|_| self.lifecycle.poisoned())?;
        data.extend(entries);
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        self.lifecycle.check()?;
        let mut data = self.data.write().map_err(|_| self.lifecycle.poisoned())?;
        for id in ids {
            data.remove(id);
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        self.lifecycle.check()?;
        let data = self.data.read().map_err(|_| self.lifecycle.poisoned())?;
        Ok(data.len())
    }
}

// ============ Vector ============

pub struct MemoryVectorStorage {
    lifecycle: Lifecycle,
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl MemoryVectorStorage {
    pub fn new(namespace: &str) -> Self {
        Self {
            lifecycle: Lifecycle::new(namespace),
            records: RwLock::new(HashMap::new()),
        }
    }
}

memory_lifecycle!(MemoryVectorStorage);

#[async_trait]
impl VectorStorage for MemoryVectorStorage {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        self.lifecycle.check()?;
        let mut stored = self.records.write().map_err(|_| self.lifecycle.poisoned())?;
        for r in records {
            stored.insert(r.id.clone(), r);
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>> {
        self.lifecycle.check()?;
        let stored = self.records.read().map_err(|_| self.lifecycle.poisoned())?;
        let mut matches: Vec<VectorMatch> = stored
            .values()
            .map(|r| VectorMatch {
                id: r.id.clone(),
                document_id: r.document_id.clone(),
                content: r.content.clone(),
                score: cosine_similarity(vector, &r.vector) as f64,
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<VectorRecord>> {
        self.lifecycle.check()?;
        let stored = self.records.read().map_err(|_| self.lifecycle.poisoned())?;
        Ok(ids.iter().filter_map(|id| stored.get(id).cloned()).collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        self.lifecycle.check()?;
        let mut stored = self.records.write().map_err(|_| self.lifecycle.poisoned())?;
        for id in ids {
            stored.remove(id);
        }
        Ok(())
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        self.lifecycle.check()?;
        let mut stored = self.records.write().map_err(|_| self.lifecycle.poisoned())?;
        let before = stored.len();
        stored.retain(|_, r| r.document_id.as_deref() != Some(document_id));
        Ok(before - stored.len())
    }

    async fn count_for_document(&self, document_id: &str) -> Result<usize> {
        self.lifecycle.check()?;
        let stored = self.records.read().map_err(|_| self.lifecycle.poisoned())?;
        Ok(stored
            .values()
            .filter(|r| r.document_id.as_deref() == Some(document_id))
            .count())
    }

    async fn len(&self) -> Result<usize> {
        self.lifecycle.check()?;
        let stored = self.records.read().map_err(|_| self.lifecycle.poisoned())?;
        Ok(stored.len())
    }
}

// ============ Graph ============

pub struct MemoryGraphStorage {
    lifecycle: Lifecycle,
    state: RwLock<GraphState>,
}

impl MemoryGraphStorage {
    pub fn new(namespace: &str) -> Self {
        Self {
            lifecycle: Lifecycle::new(namespace),
            state: RwLock::new(GraphState::default()),
        }
    }
}

memory_lifecycle!(MemoryGraphStorage);

#[async_trait]
impl GraphStorage for MemoryGraphStorage {
    async fn get_node(&self, name: &str) -> Result<Option<GraphNode>> {
        self.lifecycle.check()?;
        let state = self.state.read().map_err(|_| self.lifecycle.poisoned())?;
        Ok(state.nodes.get(name).cloned())
    }

    async fn get_edge(&self, a: &str, b: &str) -> Result<Option<GraphEdge>> {
        self.lifecycle.check()?;
        let state = self.state.read().map_err(|_| self.lifecycle.poisoned())?;
        Ok(state.edges.get(&GraphEdge::key(a, b)).cloned())
    }

    async fn node_degree(&self, name: &str) -> Result<usize> {
        self.lifecycle.check()?;
        let state = self.state.read().map_err(|_| self.lifecycle.poisoned())?;
        Ok(state.degree(name))
    }

    async fn node_count(&self) -> Result<usize> {
        self.lifecycle.check()?;
        let state = self.state.read().map_err(|_| self.lifecycle.poisoned())?;
        Ok(state.nodes.len())
    }

    async fn edge_count(&self) -> Result<usize> {
        self.lifecycle.check()?;
        let state = self.state.read().map_err(|_| self.lifecycle.poisoned())?;
        Ok(state.edges.len())
    }

    async fn nodes_for_chunks(&self, chunk_ids: &[String]) -> Result<Vec<String>> {
        self.lifecycle.check()?;
        let wanted: HashSet<&String> = chunk_ids.iter().collect();
        let state = self.state.read().map_err(|_| self.lifecycle.poisoned())?;
        let mut names: Vec<String> = state
            .nodes
            .values()
            .filter(|n| n.source_chunks().any(|c| wanted.contains(c)))
            .map(|n| n.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn upsert_batch(&self, batch: &GraphBatch) -> Result<()> {
        self.lifecycle.check()?;
        let mut state = self.state.write().map_err(|_| self.lifecycle.poisoned())?;
        state.apply(batch);
        Ok(())
    }

    async fn remove_chunks(&self, chunk_ids: &[String]) -> Result<GraphRemoval> {
        self.lifecycle.check()?;
        let ids: HashSet<String> = chunk_ids.iter().cloned().collect();
        let mut state = self.state.write().map_err(|_| self.lifecycle.poisoned())?;
        Ok(state.remove_chunks(&ids))
    }
}

// ============ Document status ============

pub struct MemoryDocStatusStorage {
    lifecycle: Lifecycle,
    records: RwLock<HashMap<String, DocStatusRecord>>,
}

impl MemoryDocStatusStorage {
    pub fn new(namespace: &str) -> Self {
        Self {
            lifecycle: Lifecycle::new(namespace),
            records: RwLock::new(HashMap::new()),
        }
    }

    fn select(&self, keep: impl Fn(&DocStatusRecord) -> bool) -> Result<Vec<DocStatusRecord>> {
        self.lifecycle.check()?;
        let records = self.records.read().map_err(|_| self.lifecycle.poisoned())?;
        let mut out: Vec<DocStatusRecord> = records.values().filter(|r| keep(r)).cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }
}

memory_lifecycle!(MemoryDocStatusStorage);

#[async_trait]
impl DocStatusStorage for MemoryDocStatusStorage {
    async fn get(&self, id: &str) -> Result<Option<DocStatusRecord>> {
        self.lifecycle.check()?;
        let records = self.records.read().map_err(|_| self.lifecycle.poisoned())?;
        Ok(records.get(id).cloned())
    }

    async fn upsert(&self, record: &DocStatusRecord) -> Result<()> {
        self.lifecycle.check()?;
        let mut records = self.records.write().map_err(|_| self.lifecycle.poisoned())?;
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.lifecycle.check()?;
        let mut records = self.records.write().map_err(|_| self.lifecycle.poisoned())?;
        Ok(records.remove(id).is_some())
    }

    async fn by_status(&self, status: DocStatus) -> Result<Vec<DocStatusRecord>> {
        self.select(|r| r.status == status)
    }

    async fn by_track_id(&self, track_id: &str) -> Result<Vec<DocStatusRecord>> {
        self.select(|r| r.track_id == track_id)
    }

    async fn all(&self) -> Result<Vec<DocStatusRecord>> {
        self.select(|_| true)
    }

    async fn counts(&self) -> Result<BTreeMap<DocStatus, usize>> {
        self.lifecycle.check()?;
        let records = self.records.read().map_err(|_| self.lifecycle.poisoned())?;
        let mut counts: BTreeMap<DocStatus, usize> =
            DocStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for r in records.values() {
            *counts.entry(r.status).or_default() += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EntityFragment;
    use serde_json::json;

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let kv = MemoryKvStorage::new("full_docs");
        let err = kv.get_by_id("x").await.unwrap_err();
        assert!(err.to_string().contains("before initialize"));
        kv.initialize().await.unwrap();
        assert!(kv.get_by_id("x").await.unwrap().is_none());
        kv.close().await.unwrap();
        assert!(kv.len().await.unwrap_err().to_string().contains("closed"));
        assert!(kv.initialize().await.is_err());
    }

    #[tokio::test]
    async fn test_kv_filter_keys() {
        let kv = MemoryKvStorage::new("text_chunks");
        kv.initialize().await.unwrap();
        kv.upsert(BTreeMap::from([("a".to_string(), json!({"v": 1}))]))
            .await
            .unwrap();
        let missing = kv
            .filter_keys(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(missing, HashSet::from(["b".to_string()]));
    }

    #[tokio::test]
    async fn test_vector_query_and_delete_by_document() {
        let vdb = MemoryVectorStorage::new("chunks");
        vdb.initialize().await.unwrap();
        let rec = |id: &str, doc: &str, v: Vec<f32>| VectorRecord {
            id: id.to_string(),
            document_id: Some(doc.to_string()),
            content: id.to_string(),
            vector: v,
            metadata: json!({}),
        };
        vdb.upsert(vec![
            rec("c1", "d1", vec![1.0, 0.0]),
            rec("c2", "d1", vec![0.0, 1.0]),
            rec("c3", "d2", vec![0.7, 0.7]),
        ])
        .await
        .unwrap();
        let hits = vdb.query(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits[0].id, "c1");
        assert_eq!(hits[1].id, "c3");
        assert_eq!(vdb.delete_by_document("d1").await.unwrap(), 2);
        assert_eq!(vdb.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_graph_batch_and_chunk_lookup() {
        let g = MemoryGraphStorage::new("chunk_entity_relation");
        g.initialize().await.unwrap();
        let mut node = GraphNode::new("Ferris");
        node.absorb(
            "chunk-1",
            EntityFragment {
                entity_type: "MASCOT".to_string(),
                description: "A crab.".to_string(),
                file_path: "a.md".to_string(),
            },
        );
        g.upsert_batch(&GraphBatch {
            nodes: vec![node],
            edges: vec![],
        })
        .await
        .unwrap();
        assert_eq!(g.node_count().await.unwrap(), 1);
        assert_eq!(
            g.nodes_for_chunks(&["chunk-1".to_string()]).await.unwrap(),
            vec!["Ferris".to_string()]
        );
        assert!(g
            .nodes_for_chunks(&["chunk-2".to_string()])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_doc_status_counts_include_all_states() {
        let s = MemoryDocStatusStorage::new("doc_status");
        s.initialize().await.unwrap();
        s.upsert(&DocStatusRecord::pending("hello", None, true, "t1"))
            .await
            .unwrap();
        let counts = s.counts().await.unwrap();
        assert_eq!(counts.len(), 4);
        assert_eq!(counts[&DocStatus::Pending], 1);
        assert_eq!(counts[&DocStatus::Failed], 0);
        assert_eq!(s.by_track_id("t1").await.unwrap().len(), 1);
    }
}
