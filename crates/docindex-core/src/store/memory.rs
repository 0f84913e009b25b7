//! In-memory [`VectorStore`] implementation for tests and dry runs.
//!
//! Nodes live in a `Vec` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity; keyword search counts query-term
//! occurrences in lowercased node text.

use std::collections::HashSet;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::Node;

use super::{ensure_embedded, query_terms, NodeCandidate, StoreStats, VectorStore};

/// In-memory store.
pub struct InMemoryStore {
    nodes: RwLock<Vec<Node>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<Node>>> {
        self.nodes
            .read()
            .map_err(|_| anyhow::anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<Node>>> {
        self.nodes
            .write()
            .map_err(|_| anyhow::anyhow!("in-memory store lock poisoned"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn without_embedding(node: &Node) -> Node {
    Node {
        embedding: None,
        ..node.clone()
    }
}

fn sort_and_truncate(candidates: &mut Vec<NodeCandidate>, limit: usize) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node.id.cmp(&b.node.id))
    });
    candidates.truncate(limit);
}

#[async_trait]
impl VectorStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn add(&self, nodes: &[Node]) -> Result<Vec<String>> {
        ensure_embedded(nodes)?;
        let mut stored = self.write()?;
        let incoming: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        stored.retain(|n| !incoming.contains(n.id.as_str()));
        stored.extend(nodes.iter().cloned());
        Ok(nodes.iter().map(|n| n.id.clone()).collect())
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        self.write()?.retain(|n| n.document_id != document_id);
        Ok(())
    }

    async fn document_ids(&self) -> Result<Vec<String>> {
        let stored = self.read()?;
        let mut ids: Vec<String> = stored.iter().map(|n| n.document_id.clone()).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<NodeCandidate>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let stored = self.read()?;
        let mut candidates: Vec<NodeCandidate> = stored
            .iter()
            .filter_map(|node| {
                let text = node.text.to_lowercase();
                let hits: usize = terms.iter().map(|t| text.matches(t.as_str()).count()).sum();
                (hits > 0).then(|| NodeCandidate {
                    node: without_embedding(node),
                    raw_score: hits as f64,
                })
            })
            .collect();
        sort_and_truncate(&mut candidates, limit);
        Ok(candidates)
    }

    async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<NodeCandidate>> {
        let stored = self.read()?;
        let mut candidates: Vec<NodeCandidate> = stored
            .iter()
            .filter_map(|node| {
                let vec = node.embedding.as_ref()?;
                Some(NodeCandidate {
                    node: without_embedding(node),
                    raw_score: cosine_similarity(query_vec, vec) as f64,
                })
            })
            .collect();
        sort_and_truncate(&mut candidates, limit);
        Ok(candidates)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let stored = self.read()?;
        let documents: HashSet<&str> = stored.iter().map(|n| n.document_id.as_str()).collect();
        Ok(StoreStats {
            documents: documents.len() as u64,
            nodes: stored.len() as u64,
        })
    }
}
