//! # docindex core
//!
//! Runtime-agnostic logic for docindex: data models, markdown node
//! splitting, the vector store trait with an in-memory backend, hybrid
//! retrieval, and the embedding provider trait.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O.

pub mod embedding;
pub mod models;
pub mod retrieve;
pub mod split;
pub mod store;
