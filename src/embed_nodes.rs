//! The embedding stage: attach one vector to every node in a batch.

use anyhow::{bail, Result};
use std::sync::Arc;

use docindex_core::models::{EmbeddedBatch, NodeBatch};

use crate::embedding::EmbeddingProvider;

/// Embeds node batches with a single provider.
///
/// The batch driver gives every worker its own `EmbedNodes`, so any state a
/// provider keeps (a loaded local model, an HTTP client) lives per worker.
pub struct EmbedNodes {
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbedNodes {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &dyn EmbeddingProvider {
        self.provider.as_ref()
    }

    /// Embed every node text with one provider call and attach the vectors
    /// in order.
    ///
    /// Fails if the provider returns a different number of vectors than
    /// nodes, or a vector whose length differs from the provider's `dims`.
    pub async fn call(&self, batch: NodeBatch) -> Result<EmbeddedBatch> {
        let mut nodes = batch.nodes;
        if nodes.is_empty() {
            return Ok(EmbeddedBatch::default());
        }

        let texts: Vec<String> = nodes.iter().map(|n| n.text.clone()).collect();
        let vectors = self.provider.embed_texts(&texts).await?;
        if vectors.len() != nodes.len() {
            bail!(
                "embedding provider '{}' returned {} vectors for {} nodes",
                self.provider.model_name(),
                vectors.len(),
                nodes.len()
            );
        }

        let dims = self.provider.dims();
        for (node, vector) in nodes.iter_mut().zip(vectors) {
            if dims > 0 && vector.len() != dims {
                bail!(
                    "embedding for node {} has {} dimensions, expected {}",
                    node.id,
                    vector.len(),
                    dims
                );
            }
            node.embedding = Some(vector);
        }

        tracing::debug!(nodes = nodes.len(), "embedded node batch");
        Ok(EmbeddedBatch {
            embedded_nodes: nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use docindex_core::models::{hash_text, Metadata, Node};

    use crate::embedding::HashProvider;

    struct ShortProvider;

    #[async_trait]
    impl EmbeddingProvider for ShortProvider {
        fn model_name(&self) -> &str {
            "short"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_texts(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(vec![vec![1.0, 0.0]])
        }
    }

    struct WrongDimsProvider;

    #[async_trait]
    impl EmbeddingProvider for WrongDimsProvider {
        fn model_name(&self) -> &str {
            "wrong-dims"
        }
        fn dims(&self) -> usize {
            3
        }
        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0]).collect())
        }
    }

    fn node(index: i64, text: &str) -> Node {
        Node {
            id: format!("n{}", index),
            document_id: "d1".to_string(),
            node_index: index,
            text: text.to_string(),
            hash: hash_text(text),
            metadata: Metadata::new(),
            embedding: None,
        }
    }

    fn batch() -> NodeBatch {
        NodeBatch {
            nodes: vec![node(0, "first chunk"), node(1, "second chunk")],
        }
    }

    #[tokio::test]
    async fn attaches_one_vector_per_node_in_order() {
        let embedder = EmbedNodes::new(Arc::new(HashProvider::new(16).unwrap()));
        let out = embedder.call(batch()).await.unwrap();
        assert_eq!(out.embedded_nodes.len(), 2);
        assert_eq!(out.embedded_nodes[0].id, "n0");
        assert_eq!(out.embedded_nodes[1].id, "n1");
        assert!(out
            .embedded_nodes
            .iter()
            .all(|n| n.embedding.as_ref().map(Vec::len) == Some(16)));
    }

    #[tokio::test]
    async fn count_mismatch_fails() {
        let embedder = EmbedNodes::new(Arc::new(ShortProvider));
        let err = embedder.call(batch()).await.unwrap_err();
        assert!(err.to_string().contains("1 vectors for 2 nodes"));
    }

    #[tokio::test]
    async fn dimension_mismatch_fails() {
        let embedder = EmbedNodes::new(Arc::new(WrongDimsProvider));
        let err = embedder.call(batch()).await.unwrap_err();
        assert!(err.to_string().contains("expected 3"));
    }

    #[tokio::test]
    async fn empty_batch_skips_provider() {
        let embedder = EmbedNodes::new(Arc::new(ShortProvider));
        let out = embedder.call(NodeBatch::default()).await.unwrap();
        assert!(out.embedded_nodes.is_empty());
    }
}
