//! # ragspace
//!
//! A workspace-isolated knowledge-base engine.
//!
//! Every workspace gets its own [`engine::EngineInstance`]: a private set of
//! key-value, vector, graph, and document-status storages plus an ingestion
//! pipeline that turns submitted text into chunks, chunk vectors, and
//! (optionally) knowledge-graph fragments.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌────────────────┐   ┌──────────────┐
//! │ WorkspaceManager │──▶│ EngineInstance │──▶│  StorageSet  │
//! │ (single-flight)  │   │  per workspace │   │ memory/SQLite│
//! └──────────────────┘   └───────┬────────┘   └──────────────┘
//!                                │
//!            enqueue ─▶ chunk ─▶ extract ─▶ merge ─▶ finalize
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`workspace`] | Workspace identifier validation |
//! | [`manager`] | Per-workspace instance cache |
//! | [`engine`] | Engine instance, queries, deletion |
//! | [`pipeline`] | Enqueue and document processing |
//! | [`extract`] | Entity and relation extraction with gleaning |
//! | [`merge`] | Graph merge into storage and vector indexes |
//! | [`embedding`] | Embedding provider bindings |
//! | [`storage`] | Storage set and backend factory |
//! | [`sqlite_store`] | SQLite storage backends |
//! | [`db`] | Database connection and schema |
//! | [`connector_fs`] | Filesystem scanning for the CLI |
//! | [`error`] | Error taxonomy |

pub mod config;
pub mod connector_fs;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod manager;
pub mod merge;
pub mod pipeline;
pub mod sqlite_store;
pub mod storage;
pub mod workspace;

pub use engine::EngineInstance;
pub use error::{KbError, Result};
pub use manager::WorkspaceManager;
pub use workspace::WorkspaceId;
