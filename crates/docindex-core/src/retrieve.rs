//! Retrieval over a [`VectorStore`] with default, text, and hybrid modes.
//!
//! The calling application embeds the query, builds a [`VectorStoreQuery`],
//! and passes any store implementation.
//!
//! # Hybrid Scoring Algorithm
//!
//! 1. Fetch `similarity_top_k × amplify_ratio` keyword candidates.
//! 2. Fetch the same number of vector candidates.
//! 3. Normalize both sets to `[0, 1]` using min-max normalization.
//! 4. Merge: `score = (1 - α) × keyword + α × vector`.
//! 5. Sort by score (desc), node id (asc).
//! 6. Truncate to `similarity_top_k`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::models::{Node, NodeWithScore};
use crate::store::{NodeCandidate, VectorStore};

/// How the store is searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// Vector similarity only.
    Default,
    /// Keyword matching only.
    Text,
    /// Weighted merge of keyword and vector scores.
    Hybrid,
}

impl QueryMode {
    pub fn needs_embedding(&self) -> bool {
        matches!(self, QueryMode::Default | QueryMode::Hybrid)
    }

    pub fn needs_query_str(&self) -> bool {
        matches!(self, QueryMode::Text | QueryMode::Hybrid)
    }
}

impl FromStr for QueryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" | "vector" | "semantic" => Ok(QueryMode::Default),
            "text" | "keyword" => Ok(QueryMode::Text),
            "hybrid" => Ok(QueryMode::Hybrid),
            other => bail!(
                "Unknown query mode: {}. Use default, text, or hybrid.",
                other
            ),
        }
    }
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryMode::Default => "default",
            QueryMode::Text => "text",
            QueryMode::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

/// All inputs for a single store query.
#[derive(Debug, Clone)]
pub struct VectorStoreQuery {
    /// Pre-computed query embedding (required for default/hybrid).
    pub query_embedding: Option<Vec<f32>>,
    /// Raw query text for text/hybrid. Missing or blank text yields no results.
    pub query_str: Option<String>,
    pub similarity_top_k: usize,
    pub mode: QueryMode,
    /// Weight of the vector channel in hybrid mode.
    pub alpha: f64,
    /// Candidate pool multiplier for hybrid mode.
    pub amplify_ratio: usize,
}

/// Retrieved nodes and their scores, index-aligned.
#[derive(Debug, Clone, Default)]
pub struct VectorStoreQueryResult {
    pub nodes: Vec<Node>,
    pub similarities: Vec<f64>,
}

impl VectorStoreQueryResult {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Pair every node with its score.
    pub fn into_nodes_with_score(self) -> Vec<NodeWithScore> {
        self.nodes
            .into_iter()
            .zip(self.similarities)
            .map(|(node, score)| NodeWithScore { node, score })
            .collect()
    }
}

/// Run a query against a [`VectorStore`] backend.
pub async fn query<S: VectorStore + ?Sized>(
    store: &S,
    q: &VectorStoreQuery,
) -> Result<VectorStoreQueryResult> {
    let top_k = q.similarity_top_k;
    if top_k == 0 {
        return Ok(VectorStoreQueryResult::default());
    }

    let query_str = q.query_str.as_deref().map(str::trim).unwrap_or("");
    if q.mode.needs_query_str() && query_str.is_empty() {
        return Ok(VectorStoreQueryResult::default());
    }

    match q.mode {
        QueryMode::Default => {
            let qv = required_embedding(q)?;
            let candidates = store.vector_search(qv, top_k).await?;
            Ok(from_raw(candidates, top_k))
        }
        QueryMode::Text => {
            let candidates = store.keyword_search(query_str, top_k).await?;
            Ok(from_raw(candidates, top_k))
        }
        QueryMode::Hybrid => {
            let qv = required_embedding(q)?;
            let candidate_k = top_k.saturating_mul(q.amplify_ratio.max(1));
            let vector = store.vector_search(qv, candidate_k).await?;
            let keyword = store.keyword_search(query_str, candidate_k).await?;
            tracing::debug!(
                keyword = keyword.len(),
                vector = vector.len(),
                "hybrid candidates"
            );
            Ok(merge_hybrid(keyword, vector, q.alpha, top_k))
        }
    }
}

fn required_embedding(q: &VectorStoreQuery) -> Result<&[f32]> {
    match q.query_embedding.as_deref() {
        Some(v) => Ok(v),
        None => bail!("query_embedding is required for {} mode", q.mode),
    }
}

fn from_raw(mut candidates: Vec<NodeCandidate>, top_k: usize) -> VectorStoreQueryResult {
    candidates.truncate(top_k);
    let mut result = VectorStoreQueryResult::default();
    for c in candidates {
        result.similarities.push(c.raw_score);
        result.nodes.push(c.node);
    }
    result
}

/// Merge keyword and vector candidates with weight `alpha` on the vector side.
///
/// A node missing from one channel scores 0 in that channel.
pub fn merge_hybrid(
    keyword: Vec<NodeCandidate>,
    vector: Vec<NodeCandidate>,
    alpha: f64,
    top_k: usize,
) -> VectorStoreQueryResult {
    let kw_map: HashMap<String, f64> = normalize_scores(&keyword)
        .into_iter()
        .map(|(c, s)| (c.node.id.clone(), s))
        .collect();
    let vec_map: HashMap<String, f64> = normalize_scores(&vector)
        .into_iter()
        .map(|(c, s)| (c.node.id.clone(), s))
        .collect();

    let mut all: HashMap<String, Node> = HashMap::new();
    for c in keyword.into_iter().chain(vector) {
        all.entry(c.node.id.clone()).or_insert(c.node);
    }

    let mut scored: Vec<(Node, f64)> = all
        .into_iter()
        .map(|(id, node)| {
            let k = kw_map.get(&id).copied().unwrap_or(0.0);
            let v = vec_map.get(&id).copied().unwrap_or(0.0);
            (node, (1.0 - alpha) * k + alpha * v)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.id.cmp(&b.0.id))
    });
    scored.truncate(top_k);

    let mut result = VectorStoreQueryResult::default();
    for (node, score) in scored {
        result.nodes.push(node);
        result.similarities.push(score);
    }
    result
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(candidates: &[NodeCandidate]) -> Vec<(&NodeCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{hash_text, Metadata};
    use crate::store::memory::InMemoryStore;

    fn node(id: &str, text: &str, vec: Option<Vec<f32>>) -> Node {
        Node {
            id: id.to_string(),
            document_id: "d1".to_string(),
            node_index: 0,
            text: text.to_string(),
            hash: hash_text(text),
            metadata: Metadata::new(),
            embedding: vec,
        }
    }

    fn candidate(id: &str, score: f64) -> NodeCandidate {
        NodeCandidate {
            node: node(id, "", None),
            raw_score: score,
        }
    }

    fn ids(result: &VectorStoreQueryResult) -> Vec<&str> {
        result.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    fn base_query(mode: QueryMode) -> VectorStoreQuery {
        VectorStoreQuery {
            query_embedding: Some(vec![1.0, 0.0]),
            query_str: Some("index".to_string()),
            similarity_top_k: 2,
            mode,
            alpha: 0.5,
            amplify_ratio: 2,
        }
    }

    async fn seeded_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .add(&[
                node("a", "vector index index tuning", Some(vec![0.9, 0.1])),
                node("b", "index index index", Some(vec![0.0, 1.0])),
                node("c", "unrelated", Some(vec![1.0, 0.0])),
                node("d", "index once", Some(vec![0.0, 1.0])),
            ])
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_range() {
        let candidates = vec![candidate("c1", 10.0), candidate("c2", 5.0), candidate("c3", 0.0)];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!((result[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        let candidates = vec![candidate("c1", 3.0), candidate("c2", 3.0)];
        for (_, score) in normalize_scores(&candidates) {
            assert!((score - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn alpha_zero_keeps_keyword_order() {
        let kw = vec![candidate("c1", 10.0), candidate("c2", 5.0), candidate("c3", 1.0)];
        let vec_cands = vec![candidate("c3", 0.9), candidate("c2", 0.5), candidate("c1", 0.1)];
        let merged = merge_hybrid(kw, vec_cands, 0.0, 3);
        assert_eq!(ids(&merged), vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn alpha_one_keeps_vector_order() {
        let kw = vec![candidate("c1", 10.0), candidate("c2", 5.0)];
        let vec_cands = vec![candidate("c2", 0.9), candidate("c3", 0.5), candidate("c1", 0.1)];
        let merged = merge_hybrid(kw, vec_cands, 1.0, 3);
        assert_eq!(ids(&merged), vec!["c2", "c3", "c1"]);
    }

    #[test]
    fn merged_scores_stay_in_unit_interval() {
        let kw = vec![candidate("c1", -5.0), candidate("c2", 100.0)];
        let vec_cands = vec![candidate("c2", 0.3), candidate("c3", 0.7)];
        let merged = merge_hybrid(kw, vec_cands, 0.6, 10);
        assert_eq!(merged.len(), 3);
        for s in &merged.similarities {
            assert!((0.0..=1.0).contains(s), "score out of range: {}", s);
        }
    }

    #[test]
    fn mode_parsing_accepts_aliases() {
        assert_eq!("keyword".parse::<QueryMode>().unwrap(), QueryMode::Text);
        assert_eq!("semantic".parse::<QueryMode>().unwrap(), QueryMode::Default);
        assert_eq!("hybrid".parse::<QueryMode>().unwrap(), QueryMode::Hybrid);
        assert!("fuzzy".parse::<QueryMode>().is_err());
    }

    #[tokio::test]
    async fn default_mode_uses_vectors_only() {
        let store = seeded_store().await;
        let result = query(&store, &base_query(QueryMode::Default)).await.unwrap();
        assert_eq!(ids(&result), vec!["c", "a"]);
        assert_eq!(result.similarities.len(), 2);
    }

    #[tokio::test]
    async fn text_mode_uses_keywords_only() {
        let mut q = base_query(QueryMode::Text);
        q.query_embedding = None;
        let store = seeded_store().await;
        let result = query(&store, &q).await.unwrap();
        assert_eq!(ids(&result), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn hybrid_mode_rewards_both_channels() {
        let store = seeded_store().await;
        let result = query(&store, &base_query(QueryMode::Hybrid)).await.unwrap();
        assert_eq!(result.nodes[0].id, "a");
    }

    #[tokio::test]
    async fn vector_modes_require_embedding() {
        let mut q = base_query(QueryMode::Hybrid);
        q.query_embedding = None;
        let store = seeded_store().await;
        assert!(query(&store, &q).await.is_err());
    }

    #[tokio::test]
    async fn empty_text_query_returns_nothing() {
        let mut q = base_query(QueryMode::Text);
        q.query_str = Some("   ".to_string());
        let store = seeded_store().await;
        assert!(query(&store, &q).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hybrid_without_query_text_returns_nothing() {
        let store = seeded_store().await;

        let mut blank = base_query(QueryMode::Hybrid);
        blank.query_str = Some("   ".to_string());
        assert!(query(&store, &blank).await.unwrap().is_empty());

        let mut missing = base_query(QueryMode::Hybrid);
        missing.query_str = None;
        assert!(query(&store, &missing).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn default_mode_ignores_query_text() {
        let mut q = base_query(QueryMode::Default);
        q.query_str = None;
        let store = seeded_store().await;
        assert_eq!(query(&store, &q).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn into_nodes_with_score_pairs_in_order() {
        let store = seeded_store().await;
        let result = query(&store, &base_query(QueryMode::Default)).await.unwrap();
        let scored = result.into_nodes_with_score();
        assert_eq!(scored[0].node.id, "c");
        assert!((scored[0].score - 1.0).abs() < 1e-6);
    }
}
