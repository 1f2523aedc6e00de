//! SQLite-backed storage implementations.
//!
//! One database file per workspace (see [`crate::db`]). The four storage
//! kinds share that file's pool; each instance is scoped to its namespace
//! by the `namespace` column, so two workspaces never share a row and two
//! namespaces in one workspace never collide.

use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::SecondsFormat;
use sqlx::{Row, SqlitePool};

use ragspace_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use ragspace_core::graph::{GraphBatch, GraphEdge, GraphNode, GraphRemoval, GraphState};
use ragspace_core::models::{DocStatus, DocStatusRecord, VectorMatch, VectorRecord};
use ragspace_core::store::{
    DocStatusStorage, GraphStorage, KvStorage, Lifecycle, StorageLifecycle, VectorStorage,
};

use crate::db;

macro_rules! sqlite_lifecycle {
    ($ty:ty) => {
        impl $ty {
            pub fn new(pool: SqlitePool, namespace: &str) -> Self {
                Self {
                    lifecycle: Lifecycle::new(namespace),
                    pool,
                }
            }
        }

        #[async_trait]
        impl StorageLifecycle for $ty {
            fn namespace(&self) -> &str {
                &self.lifecycle.namespace
            }

            async fn initialize(&self) -> Result<()> {
                db::run_migrations(&self.pool)
                    .await
                    .with_context(|| format!("migrating '{}'", self.lifecycle.namespace))?;
                self.lifecycle.open()
            }

            async fn flush(&self) -> Result<()> {
                self.lifecycle.check()?;
                sqlx::query("PRAGMA wal_checkpoint(PASSIVE)")
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }

            async fn close(&self) -> Result<()> {
                self.lifecycle.close();
                self.pool.close().await;
                Ok(())
            }
        }
    };
}

fn ts(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ============ Key-Value ============

pub struct SqliteKvStorage {
    lifecycle: Lifecycle,
    pool: SqlitePool,
}

sqlite_lifecycle!(SqliteKvStorage);

#[async_trait]
impl KvStorage for SqliteKvStorage {
    async fn get_by_id(&self, id: &str) -> Result<Option<serde_json::Value>> {
        self.lifecycle.check()?;
        let row = sqlx::query("SELECT value_json FROM kv_entries WHERE namespace = ? AND id = ?")
            .bind(&self.lifecycle.namespace)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let raw: String = r.get("value_json");
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<serde_json::Value>>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.get_by_id(id).await?);
        }
        Ok(out)
    }

    async fn filter_keys(&self, keys: &[String]) -> Result<HashSet<String>> {
        self.lifecycle.check()?;
        let mut missing = HashSet::new();
        for key in keys {
            let exists: bool = sqlx::query_scalar(
                "SELECT COUNT(*) > 0 FROM kv_entries WHERE namespace = ? AND id = ?",
            )
            .bind(&self.lifecycle.namespace)
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
            if !exists {
                missing.insert(key.clone());
            }
        }
        Ok(missing)
    }

    async fn upsert(&self, entries: BTreeMap<String, serde_json::Value>) -> Result<()> {
        self.lifecycle.check()?;
        let mut tx = self.pool.begin().await?;
        for (id, value) in entries {
            sqlx::query(
                r#"
                INSERT INTO kv_entries (namespace, id, value_json) VALUES (?, ?, ?)
                ON CONFLICT(namespace, id) DO UPDATE SET value_json = excluded.value_json
                "#,
            )
            .bind(&self.lifecycle.namespace)
            .bind(&id)
            .bind(serde_json::to_string(&value)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        self.lifecycle.check()?;
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM kv_entries WHERE namespace = ? AND id = ?")
                .bind(&self.lifecycle.namespace)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        self.lifecycle.check()?;
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kv_entries WHERE namespace = ?")
            .bind(&self.lifecycle.namespace)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }
}

// ============ Vector ============

pub struct SqliteVectorStorage {
    lifecycle: Lifecycle,
    pool: SqlitePool,
}

sqlite_lifecycle!(SqliteVectorStorage);

fn row_to_vector(row: &sqlx::sqlite::SqliteRow) -> Result<VectorRecord> {
    let blob: Vec<u8> = row.get("embedding");
    let metadata: String = row.get("metadata_json");
    Ok(VectorRecord {
        id: row.get("id"),
        document_id: row.get("document_id"),
        content: row.get("content"),
        vector: blob_to_vec(&blob),
        metadata: serde_json::from_str(&metadata)?,
    })
}

#[async_trait]
impl VectorStorage for SqliteVectorStorage {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        self.lifecycle.check()?;
        let mut tx = self.pool.begin().await?;
        for r in &records {
            sqlx::query(
                r#"
                INSERT INTO vectors (namespace, id, document_id, content, embedding, metadata_json)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(namespace, id) DO UPDATE SET
                    document_id = excluded.document_id,
                    content = excluded.content,
                    embedding = excluded.embedding,
                    metadata_json = excluded.metadata_json
                "#,
            )
            .bind(&self.lifecycle.namespace)
            .bind(&r.id)
            .bind(&r.document_id)
            .bind(&r.content)
            .bind(vec_to_blob(&r.vector))
            .bind(serde_json::to_string(&r.metadata)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>> {
        self.lifecycle.check()?;
        let rows = sqlx::query(
            "SELECT id, document_id, content, embedding FROM vectors WHERE namespace = ?",
        )
        .bind(&self.lifecycle.namespace)
        .fetch_all(&self.pool)
        .await?;

        let mut matches: Vec<VectorMatch> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                VectorMatch {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    content: row.get("content"),
                    score: cosine_similarity(vector, &blob_to_vec(&blob)) as f64,
                }
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
        let mut out = Vec::new();
        for id in ids {
            let row = sqlx::query(
                "SELECT id, document_id, content, embedding, metadata_json FROM vectors WHERE namespace = ? AND id = ?",
            )
            .bind(&self.lifecycle.namespace)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                out.push(row_to_vector(&row)?);
            }
        }
        Ok(out)
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        self.lifecycle.check()?;
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM vectors WHERE namespace = ? AND id = ?")
                .bind(&self.lifecycle.namespace)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        self.lifecycle.check()?;
        let result = sqlx::query("DELETE FROM vectors WHERE namespace = ? AND document_id = ?")
            .bind(&self.lifecycle.namespace)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn count_for_document(&self, document_id: &str) -> Result<usize> {
        self.lifecycle.check()?;
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM vectors WHERE namespace = ? AND document_id = ?",
        )
        .bind(&self.lifecycle.namespace)
        .bind(document_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(n as usize)
    }

    async fn len(&self) -> Result<usize> {
        self.lifecycle.check()?;
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE namespace = ?")
            .bind(&self.lifecycle.namespace)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }
}

// ============ Graph ============

/// Nodes and edges are stored as JSON documents. Fragment-level removal
/// loads the graph into a [`GraphState`], applies the removal there, and
/// writes the difference back in one transaction.
pub struct SqliteGraphStorage {
    lifecycle: Lifecycle,
    pool: SqlitePool,
}

sqlite_lifecycle!(SqliteGraphStorage);

impl SqliteGraphStorage {
    async fn load_state(&self) -> Result<GraphState> {
        let mut state = GraphState::default();

        let rows = sqlx::query("SELECT node_json FROM graph_nodes WHERE namespace = ?")
            .bind(&self.lifecycle.namespace)
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let raw: String = row.get("node_json");
            let node: GraphNode = serde_json::from_str(&raw)?;
            state.nodes.insert(node.name.clone(), node);
        }

        let rows = sqlx::query("SELECT edge_json FROM graph_edges WHERE namespace = ?")
            .bind(&self.lifecycle.namespace)
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let raw: String = row.get("edge_json");
            let edge: GraphEdge = serde_json::from_str(&raw)?;
            state.edges.insert(edge.endpoints(), edge);
        }

        Ok(state)
    }

    async fn write_node(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        node: &GraphNode,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO graph_nodes (namespace, name, node_json) VALUES (?, ?, ?)
            ON CONFLICT(namespace, name) DO UPDATE SET node_json = excluded.node_json
            "#,
        )
        .bind(&self.lifecycle.namespace)
        .bind(&node.name)
        .bind(serde_json::to_string(node)?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_edge(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        edge: &GraphEdge,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO graph_edges (namespace, source, target, edge_json) VALUES (?, ?, ?, ?)
            ON CONFLICT(namespace, source, target) DO UPDATE SET edge_json = excluded.edge_json
            "#,
        )
        .bind(&self.lifecycle.namespace)
        .bind(&edge.source)
        .bind(&edge.target)
        .bind(serde_json::to_string(edge)?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl GraphStorage for SqliteGraphStorage {
    async fn get_node(&self, name: &str) -> Result<Option<GraphNode>> {
        self.lifecycle.check()?;
        let row = sqlx::query("SELECT node_json FROM graph_nodes WHERE namespace = ? AND name = ?")
            .bind(&self.lifecycle.namespace)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => {
                let raw: String = r.get("node_json");
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn get_edge(&self, a: &str, b: &str) -> Result<Option<GraphEdge>> {
        self.lifecycle.check()?;
        let (source, target) = GraphEdge::key(a, b);
        let row = sqlx::query(
            "SELECT edge_json FROM graph_edges WHERE namespace = ? AND source = ? AND target = ?",
        )
        .bind(&self.lifecycle.namespace)
        .bind(&source)
        .bind(&target)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => {
                let raw: String = r.get("edge_json");
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn node_degree(&self, name: &str) -> Result<usize> {
        self.lifecycle.check()?;
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM graph_edges WHERE namespace = ? AND (source = ? OR target = ?)",
        )
        .bind(&self.lifecycle.namespace)
        .bind(name)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(n as usize)
    }

    async fn node_count(&self) -> Result<usize> {
        self.lifecycle.check()?;
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM graph_nodes WHERE namespace = ?")
            .bind(&self.lifecycle.namespace)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn edge_count(&self) -> Result<usize> {
        self.lifecycle.check()?;
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM graph_edges WHERE namespace = ?")
            .bind(&self.lifecycle.namespace)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn nodes_for_chunks(&self, chunk_ids: &[String]) -> Result<Vec<String>> {
        self.lifecycle.check()?;
        let wanted: HashSet<&String> = chunk_ids.iter().collect();
        let state = self.load_state().await?;
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
        let mut tx = self.pool.begin().await?;
        for node in &batch.nodes {
            self.write_node(&mut tx, node).await?;
        }
        for edge in &batch.edges {
            self.write_edge(&mut tx, edge).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove_chunks(&self, chunk_ids: &[String]) -> Result<GraphRemoval> {
        self.lifecycle.check()?;
        let ids: HashSet<String> = chunk_ids.iter().cloned().collect();
        let mut state = self.load_state().await?;
        let removal = state.remove_chunks(&ids);

        let mut tx = self.pool.begin().await?;
        for name in &removal.removed_nodes {
            sqlx::query("DELETE FROM graph_nodes WHERE namespace = ? AND name = ?")
                .bind(&self.lifecycle.namespace)
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }
        for (source, target) in &removal.removed_edges {
            sqlx::query(
                "DELETE FROM graph_edges WHERE namespace = ? AND source = ? AND target = ?",
            )
            .bind(&self.lifecycle.namespace)
            .bind(source)
            .bind(target)
            .execute(&mut *tx)
            .await?;
        }
        for node in &removal.updated_nodes {
            self.write_node(&mut tx, node).await?;
        }
        for edge in &removal.updated_edges {
            self.write_edge(&mut tx, edge).await?;
        }
        tx.commit().await?;

        Ok(removal)
    }
}

// ============ Document status ============

pub struct SqliteDocStatusStorage {
    lifecycle: Lifecycle,
    pool: SqlitePool,
}

sqlite_lifecycle!(SqliteDocStatusStorage);

impl SqliteDocStatusStorage {
    async fn select(&self, clause: &str, arg: Option<&str>) -> Result<Vec<DocStatusRecord>> {
        self.lifecycle.check()?;
        let sql = format!(
            "SELECT record_json FROM doc_status WHERE namespace = ?{} ORDER BY created_at ASC, id ASC",
            clause
        );
        let mut query = sqlx::query(&sql).bind(&self.lifecycle.namespace);
        if let Some(arg) = arg {
            query = query.bind(arg);
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                let raw: String = row.get("record_json");
                serde_json::from_str(&raw).context("corrupt doc_status record")
            })
            .collect()
    }
}

#[async_trait]
impl DocStatusStorage for SqliteDocStatusStorage {
    async fn get(&self, id: &str) -> Result<Option<DocStatusRecord>> {
        self.lifecycle.check()?;
        let row = sqlx::query("SELECT record_json FROM doc_status WHERE namespace = ? AND id = ?")
            .bind(&self.lifecycle.namespace)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => {
                let raw: String = r.get("record_json");
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn upsert(&self, record: &DocStatusRecord) -> Result<()> {
        self.lifecycle.check()?;
        sqlx::query(
            r#"
            INSERT INTO doc_status (namespace, id, status, track_id, created_at, record_json)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(namespace, id) DO UPDATE SET
                status = excluded.status,
                track_id = excluded.track_id,
                created_at = excluded.created_at,
                record_json = excluded.record_json
            "#,
        )
        .bind(&self.lifecycle.namespace)
        .bind(&record.id)
        .bind(record.status.as_str())
        .bind(&record.track_id)
        .bind(ts(&record.created_at))
        .bind(serde_json::to_string(record)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.lifecycle.check()?;
        let result = sqlx::query("DELETE FROM doc_status WHERE namespace = ? AND id = ?")
            .bind(&self.lifecycle.namespace)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn by_status(&self, status: DocStatus) -> Result<Vec<DocStatusRecord>> {
        self.select(" AND status = ?", Some(status.as_str())).await
    }

    async fn by_track_id(&self, track_id: &str) -> Result<Vec<DocStatusRecord>> {
        self.select(" AND track_id = ?", Some(track_id)).await
    }

    async fn all(&self) -> Result<Vec<DocStatusRecord>> {
        self.select("", None).await
    }

    async fn counts(&self) -> Result<BTreeMap<DocStatus, usize>> {
        self.lifecycle.check()?;
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM doc_status WHERE namespace = ? GROUP BY status",
        )
        .bind(&self.lifecycle.namespace)
        .fetch_all(&self.pool)
        .await?;

        let mut counts: BTreeMap<DocStatus, usize> =
            DocStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            counts.insert(status.parse()?, n as usize);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragspace_core::graph::EntityFragment;
    use serde_json::json;
    use tempfile::TempDir;

    async fn pool(tmp: &TempDir) -> SqlitePool {
        db::connect(tmp.path()).await.unwrap()
    }

    #[tokio::test]
    async fn test_kv_namespaces_do_not_collide() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;
        let docs = SqliteKvStorage::new(pool.clone(), "full_docs");
        let chunks = SqliteKvStorage::new(pool, "text_chunks");
        docs.initialize().await.unwrap();
        chunks.initialize().await.unwrap();

        docs.upsert(BTreeMap::from([("k".to_string(), json!("doc"))]))
            .await
            .unwrap();
        assert_eq!(docs.get_by_id("k").await.unwrap(), Some(json!("doc")));
        assert!(chunks.get_by_id("k").await.unwrap().is_none());
        assert_eq!(
            chunks.filter_keys(&["k".to_string()]).await.unwrap(),
            HashSet::from(["k".to_string()])
        );
    }

    #[tokio::test]
    async fn test_vector_query_and_document_delete() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteVectorStorage::new(pool(&tmp).await, "chunks");
        store.initialize().await.unwrap();
        store
            .upsert(vec![
                VectorRecord {
                    id: "a".to_string(),
                    document_id: Some("d1".to_string()),
                    content: "alpha".to_string(),
                    vector: vec![1.0, 0.0],
                    metadata: json!({}),
                },
                VectorRecord {
                    id: "b".to_string(),
                    document_id: Some("d2".to_string()),
                    content: "beta".to_string(),
                    vector: vec![0.0, 1.0],
                    metadata: json!({"k": 1}),
                },
            ])
            .await
            .unwrap();

        let hits = store.query(&[0.9, 0.1], 1).await.unwrap();
        assert_eq!(hits[0].id, "a");
        assert_eq!(store.count_for_document("d2").await.unwrap(), 1);
        assert_eq!(store.delete_by_document("d2").await.unwrap(), 1);
        assert_eq!(store.len().await.unwrap(), 1);
        assert!(store.get_by_ids(&["b".to_string()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_graph_remove_chunks_persists() {
        let tmp = TempDir::new().unwrap();
        let graph = SqliteGraphStorage::new(pool(&tmp).await, "chunk_entity_relation");
        graph.initialize().await.unwrap();

        let mut alice = GraphNode::new("Alice");
        alice.absorb(
            "c1",
            EntityFragment {
                entity_type: "PERSON".to_string(),
                description: "engineer".to_string(),
                file_path: "a.txt".to_string(),
            },
        );
        alice.absorb(
            "c2",
            EntityFragment {
                entity_type: "PERSON".to_string(),
                description: "speaker".to_string(),
                file_path: "b.txt".to_string(),
            },
        );
        graph
            .upsert_batch(&GraphBatch {
                nodes: vec![alice],
                edges: vec![],
            })
            .await
            .unwrap();

        let removal = graph.remove_chunks(&["c1".to_string()]).await.unwrap();
        assert!(removal.removed_nodes.is_empty());
        let node = graph.get_node("Alice").await.unwrap().unwrap();
        assert_eq!(node.description, "speaker");

        let removal = graph.remove_chunks(&["c2".to_string()]).await.unwrap();
        assert_eq!(removal.removed_nodes, vec!["Alice".to_string()]);
        assert_eq!(graph.node_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_doc_status_queries() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteDocStatusStorage::new(pool(&tmp).await, "doc_status");
        store.initialize().await.unwrap();

        let a = DocStatusRecord::pending("first", None, true, "t1");
        let mut b = DocStatusRecord::pending("second", Some("b.md"), false, "t1");
        b.status = DocStatus::Failed;
        store.upsert(&a).await.unwrap();
        store.upsert(&b).await.unwrap();

        assert_eq!(store.by_track_id("t1").await.unwrap().len(), 2);
        let failed = store.by_status(DocStatus::Failed).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(!failed[0].enable_graph);

        let counts = store.counts().await.unwrap();
        assert_eq!(counts[&DocStatus::Pending], 1);
        assert_eq!(counts[&DocStatus::Processing], 0);

        assert!(store.delete(&a.id).await.unwrap());
        assert!(!store.delete(&a.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_storage_rejects_calls() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteKvStorage::new(pool(&tmp).await, "full_docs");
        assert!(store.len().await.is_err());
        store.initialize().await.unwrap();
        store.close().await.unwrap();
        assert!(store.len().await.unwrap_err().to_string().contains("closed"));
    }
}
