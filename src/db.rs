use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// File name of the per-workspace database inside the workspace directory.
pub const DB_FILE: &str = "kb.sqlite";

/// Open (creating if needed) the SQLite database of one workspace.
pub async fn connect(workspace_dir: &Path) -> Result<SqlitePool> {
    std::fs::create_dir_all(workspace_dir)?;
    let db_path = workspace_dir.join(DB_FILE);

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Create every table used by the SQLite backends. Idempotent.
///
/// All namespaces of one kind share a table, distinguished by the
/// `namespace` column.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv_entries (
            namespace TEXT NOT NULL,
            id TEXT NOT NULL,
            value_json TEXT NOT NULL,
            PRIMARY KEY (namespace, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vectors (
            namespace TEXT NOT NULL,
            id TEXT NOT NULL,
            document_id TEXT,
            content TEXT NOT NULL,
            embedding BLOB NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (namespace, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_vectors_document ON vectors(namespace, document_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS graph_nodes (
            namespace TEXT NOT NULL,
            name TEXT NOT NULL,
            node_json TEXT NOT NULL,
            PRIMARY KEY (namespace, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS graph_edges (
            namespace TEXT NOT NULL,
            source TEXT NOT NULL,
            target TEXT NOT NULL,
            edge_json TEXT NOT NULL,
            PRIMARY KEY (namespace, source, target)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS doc_status (
            namespace TEXT NOT NULL,
            id TEXT NOT NULL,
            status TEXT NOT NULL,
            track_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            record_json TEXT NOT NULL,
            PRIMARY KEY (namespace, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_doc_status_status ON doc_status(namespace, status)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_creates_workspace_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("alpha");
        let pool = connect(&dir).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();
        assert!(dir.join(DB_FILE).exists());
        pool.close().await;
    }
}
