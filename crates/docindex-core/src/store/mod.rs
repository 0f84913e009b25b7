//! Vector store abstraction.
//!
//! The [`VectorStore`] trait is the only contact point between the pipeline
//! and a storage backend. Backends provide the two retrieval primitives
//! (keyword and vector candidates); score fusion lives in
//! [`retrieve`](crate::retrieve) so every backend ranks hybrid results the
//! same way.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::Node;

/// A candidate node returned from keyword or vector search.
#[derive(Debug, Clone)]
pub struct NodeCandidate {
    /// The stored node. `embedding` is not populated on retrieval.
    pub node: Node,
    /// Raw score from the backend (term-match score or similarity).
    /// Higher is always better.
    pub raw_score: f64,
}

/// Row counts reported by `docindex stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub documents: u64,
    pub nodes: u64,
}

/// Abstract vector store backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ensure_schema`](VectorStore::ensure_schema) | Create tables/indexes (idempotent) |
/// | [`add`](VectorStore::add) | Insert embedded nodes |
/// | [`delete_document`](VectorStore::delete_document) | Remove all nodes of a document |
/// | [`document_ids`](VectorStore::document_ids) | IDs of every stored document |
/// | [`keyword_search`](VectorStore::keyword_search) | Lexical candidates |
/// | [`vector_search`](VectorStore::vector_search) | Similarity candidates |
/// | [`stats`](VectorStore::stats) | Document and node counts |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Short backend name for logs and `stats` output.
    fn name(&self) -> &str;

    /// Create the backing schema if it does not exist yet.
    async fn ensure_schema(&self) -> Result<()>;

    /// Insert nodes. Every node must carry an embedding.
    ///
    /// Returns the IDs of the inserted nodes in input order.
    async fn add(&self, nodes: &[Node]) -> Result<Vec<String>>;

    /// Delete every node belonging to `document_id`.
    async fn delete_document(&self, document_id: &str) -> Result<()>;

    /// IDs of every document that has nodes in the store, sorted.
    async fn document_ids(&self) -> Result<Vec<String>>;

    /// Lexical search: nodes containing query terms, best first.
    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<NodeCandidate>>;

    /// Similarity search: nodes nearest to `query_vec`, best first.
    async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<NodeCandidate>>;

    /// Count stored documents and nodes.
    async fn stats(&self) -> Result<StoreStats>;
}

/// Fail with a descriptive error if any node lacks an embedding.
pub fn ensure_embedded(nodes: &[Node]) -> Result<()> {
    if let Some(missing) = nodes.iter().find(|n| n.embedding.is_none()) {
        anyhow::bail!(
            "node {} (document {}, index {}) has no embedding",
            missing.id,
            missing.document_id,
            missing.node_index
        );
    }
    Ok(())
}

/// Split a query into lowercase search terms.
///
/// Terms are runs of alphanumeric characters; everything else separates.
/// Duplicates are removed while preserving first-seen order.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_terms_strip_punctuation_and_dedup() {
        assert_eq!(
            query_terms("How do I create a Table? create TABLE!"),
            vec!["how", "do", "i", "create", "a", "table"]
        );
        assert!(query_terms("  ?! ").is_empty());
    }
}
