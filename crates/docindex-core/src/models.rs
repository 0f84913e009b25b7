//! Core data models shared by the indexing and query paths.
//!
//! Records flow through the pipeline in this order:
//! [`FileRow`] → [`Document`] → [`Node`] (grouped as [`NodeBatch`]) →
//! embedded [`Node`] (grouped as [`EmbeddedBatch`]) → vector store →
//! [`NodeWithScore`] at query time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Metadata attached to documents and nodes. Ordered for stable serialization.
pub type Metadata = BTreeMap<String, String>;

/// A single file discovered by the enumerator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileRow {
    pub path: PathBuf,
}

impl FileRow {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// A parsed document: full text plus path metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Deterministic ID derived from the source path (see [`document_id_for_path`]).
    pub id: String,
    pub path: String,
    pub text: String,
    pub metadata: Metadata,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Build a document for `path`, filling `id` and the `path` metadata key.
    pub fn from_path(path: &Path, text: String, updated_at: DateTime<Utc>) -> Self {
        let path_str = path.display().to_string();
        let mut metadata = Metadata::new();
        metadata.insert("path".to_string(), path_str.clone());
        if let Some(name) = path.file_name() {
            metadata.insert("file_name".to_string(), name.to_string_lossy().to_string());
        }
        Self {
            id: document_id_for_path(&path_str),
            path: path_str,
            text,
            metadata,
            updated_at,
        }
    }
}

/// A chunk of a document, optionally carrying its embedding vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: String,
    pub document_id: String,
    pub node_index: i64,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Node {
    pub fn is_embedded(&self) -> bool {
        self.embedding.is_some()
    }
}

/// Input to the embedding stage.
#[derive(Debug, Clone, Default)]
pub struct NodeBatch {
    pub nodes: Vec<Node>,
}

/// Output of the embedding stage. Every node carries `Some(embedding)`.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedBatch {
    pub embedded_nodes: Vec<Node>,
}

/// A retrieved node and its similarity score.
#[derive(Debug, Clone, Serialize)]
pub struct NodeWithScore {
    pub node: Node,
    pub score: f64,
}

/// Stable document ID: first 32 hex chars of SHA-256 over the path.
pub fn document_id_for_path(path: &str) -> String {
    let digest = hash_text(path);
    digest[..32].to_string()
}

/// SHA-256 of `text`, hex encoded.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_is_stable_per_path() {
        let a = document_id_for_path("/docs/a.md");
        let b = document_id_for_path("/docs/a.md");
        let c = document_id_for_path("/docs/b.md");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn from_path_sets_path_metadata() {
        let doc = Document::from_path(Path::new("/docs/guide.md"), "# Hi".into(), Utc::now());
        assert_eq!(doc.metadata.get("path").map(String::as_str), Some("/docs/guide.md"));
        assert_eq!(doc.metadata.get("file_name").map(String::as_str), Some("guide.md"));
        assert_eq!(doc.id, document_id_for_path("/docs/guide.md"));
    }
}
