//! Core data models shared by the pipeline and every storage backend.
//!
//! Documents are identified by a hash of their content, so resubmitting the
//! same text always lands on the same [`DocStatusRecord`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Source label recorded when the submitter gives none.
pub const UNKNOWN_SOURCE: &str = "unknown_source";

/// Length of the content summary kept on each status record.
const SUMMARY_CHARS: usize = 100;

/// Lifecycle state of a submitted document.
///
/// ```text
/// pending ──▶ processing ──▶ processed
///                  │
///                  └───────▶ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl DocStatus {
    pub const ALL: [DocStatus; 4] = [
        DocStatus::Pending,
        DocStatus::Processing,
        DocStatus::Processed,
        DocStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocStatus::Pending => "pending",
            DocStatus::Processing => "processing",
            DocStatus::Processed => "processed",
            DocStatus::Failed => "failed",
        }
    }

    /// `processed` and `failed` are only left through resubmission.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocStatus::Processed | DocStatus::Failed)
    }

    /// Whether the pipeline may move a record from `self` to `next`.
    pub fn can_transition_to(self, next: DocStatus) -> bool {
        matches!(
            (self, next),
            (DocStatus::Pending, DocStatus::Processing)
                | (DocStatus::Processing, DocStatus::Processed)
                | (DocStatus::Processing, DocStatus::Failed)
        )
    }
}

impl fmt::Display for DocStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(DocStatus::Pending),
            "processing" => Ok(DocStatus::Processing),
            "processed" => Ok(DocStatus::Processed),
            "failed" => Ok(DocStatus::Failed),
            other => anyhow::bail!(
                "Unknown document status: '{}'. Must be pending, processing, processed, or failed.",
                other
            ),
        }
    }
}

/// Persisted lifecycle and metadata record for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocStatusRecord {
    pub id: String,
    pub status: DocStatus,
    /// Gates the extract and merge stages. Chunking always runs.
    pub enable_graph: bool,
    pub chunks_count: usize,
    #[serde(default)]
    pub chunk_ids: Vec<String>,
    pub file_path: String,
    pub content_summary: String,
    pub content_length: usize,
    pub track_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error_msg: Option<String>,
}

impl DocStatusRecord {
    /// Build the fresh `pending` record written at enqueue time.
    pub fn pending(
        content: &str,
        file_path: Option<&str>,
        enable_graph: bool,
        track_id: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: compute_doc_id(content),
            status: DocStatus::Pending,
            enable_graph,
            chunks_count: 0,
            chunk_ids: Vec::new(),
            file_path: file_path
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .unwrap_or(UNKNOWN_SOURCE)
                .to_string(),
            content_summary: summarize(content),
            content_length: content.len(),
            track_id: track_id.to_string(),
            created_at: now,
            updated_at: now,
            error_msg: None,
        }
    }
}

/// An immutable slice of a document's text.
///
/// `start..end` is the byte range of `text` inside the original content,
/// so `&content[chunk.start..chunk.end] == chunk.text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// SHA-256 of `text`; keys the extraction cache.
    pub hash: String,
    pub start: usize,
    pub end: usize,
    pub tokens: usize,
}

/// One entry in a vector namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    /// Owning document for chunk vectors; `None` for entity and relation
    /// vectors, which may be shared by many documents.
    pub document_id: Option<String>,
    pub content: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A vector search hit.
#[derive(Debug, Clone, Serialize)]
pub struct VectorMatch {
    pub id: String,
    pub document_id: Option<String>,
    pub content: String,
    pub score: f64,
}

/// Hex SHA-256 of `text`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `{prefix}` followed by the first 32 hex chars of SHA-256(`text`).
pub fn prefixed_id(prefix: &str, text: &str) -> String {
    let hash = content_hash(text);
    format!("{}{}", prefix, &hash[..32])
}

/// Content-derived document id. Surrounding whitespace does not count.
pub fn compute_doc_id(content: &str) -> String {
    prefixed_id("doc-", content.trim())
}

/// Deterministic chunk id from the parent document and position.
pub fn compute_chunk_id(document_id: &str, index: i64) -> String {
    prefixed_id("chunk-", &format!("{}:{}", document_id, index))
}

fn summarize(content: &str) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= SUMMARY_CHARS {
        collapsed
    } else {
        let mut s: String = collapsed.chars().take(SUMMARY_CHARS).collect();
        s.push_str("...");
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use DocStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Processed));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Processed));
        assert!(!Processed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Pending));
        assert!(Processed.is_terminal() && Failed.is_terminal());
        assert!(!Processing.is_terminal());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("Processed".parse::<DocStatus>().unwrap(), DocStatus::Processed);
        assert!("done".parse::<DocStatus>().is_err());
    }

    #[test]
    fn test_doc_id_ignores_surrounding_whitespace() {
        assert_eq!(compute_doc_id("hello"), compute_doc_id("  hello\n"));
        assert_ne!(compute_doc_id("hello"), compute_doc_id("hello!"));
        assert!(compute_doc_id("x").starts_with("doc-"));
        assert_eq!(compute_doc_id("x").len(), 4 + 32);
    }

    #[test]
    fn test_pending_record_defaults() {
        let rec = DocStatusRecord::pending("some   text\n\nhere", None, true, "insert_1");
        assert_eq!(rec.status, DocStatus::Pending);
        assert_eq!(rec.file_path, UNKNOWN_SOURCE);
        assert_eq!(rec.content_summary, "some text here");
        assert!(rec.enable_graph);
        assert!(rec.error_msg.is_none());
    }

    #[test]
    fn test_summary_truncates() {
        let long = "word ".repeat(100);
        let rec = DocStatusRecord::pending(&long, Some("a.md"), false, "t");
        assert!(rec.content_summary.ends_with("..."));
        assert_eq!(rec.content_summary.chars().count(), SUMMARY_CHARS + 3);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&DocStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }
}
