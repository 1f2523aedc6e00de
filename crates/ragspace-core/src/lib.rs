//! # ragspace core
//!
//! Backend-agnostic building blocks for ragspace: document and status
//! models, the paragraph chunker, the knowledge-graph merge model, the
//! storage capability traits, and the in-memory storage backends.
//!
//! This crate has no tokio, sqlx, or network dependencies. Everything that
//! talks to a database or a model endpoint lives in the `ragspace` crate.

pub mod chunk;
pub mod embedding;
pub mod graph;
pub mod models;
pub mod store;
