//! SQLite-backed [`VectorStore`].
//!
//! Keyword search runs on FTS5 (BM25 rank, negated so higher is better);
//! vector search loads every stored vector and ranks by cosine similarity.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;

use docindex_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use docindex_core::models::{Metadata, Node};
use docindex_core::store::{ensure_embedded, query_terms, NodeCandidate, StoreStats, VectorStore};

use crate::db;
use crate::migrate;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(db::connect(path).await?))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Build an FTS5 MATCH expression: every term quoted, joined with OR.
///
/// Returns `None` when the query has no searchable terms.
pub fn fts_match_expression(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn node_from_row(row: &SqliteRow) -> Result<Node> {
    let metadata_json: String = row.get("metadata_json");
    let metadata: Metadata = serde_json::from_str(&metadata_json)
        .with_context(|| "Corrupt node metadata in database")?;
    Ok(Node {
        id: row.get("id"),
        document_id: row.get("document_id"),
        node_index: row.get("node_index"),
        text: row.get("text"),
        hash: row.get("hash"),
        metadata,
        embedding: None,
    })
}

#[async_trait]
impl VectorStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn ensure_schema(&self) -> Result<()> {
        migrate::run_migrations(&self.pool).await
    }

    async fn add(&self, nodes: &[Node]) -> Result<Vec<String>> {
        ensure_embedded(nodes)?;
        let now = chrono::Utc::now().timestamp();

        let mut documents: BTreeMap<&str, &str> = BTreeMap::new();
        for node in nodes {
            let path = node.metadata.get("path").map(String::as_str).unwrap_or("");
            documents.entry(node.document_id.as_str()).or_insert(path);
        }

        let mut tx = self.pool.begin().await?;

        for (id, path) in &documents {
            sqlx::query(
                r#"
                INSERT INTO documents (id, path, indexed_at) VALUES (?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET path = excluded.path, indexed_at = excluded.indexed_at
                "#,
            )
            .bind(*id)
            .bind(*path)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        for node in nodes {
            let metadata_json = serde_json::to_string(&node.metadata)?;
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO nodes (id, document_id, node_index, text, hash, metadata_json)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&node.id)
            .bind(&node.document_id)
            .bind(node.node_index)
            .bind(&node.text)
            .bind(&node.hash)
            .bind(&metadata_json)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM nodes_fts WHERE node_id = ?")
                .bind(&node.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("INSERT INTO nodes_fts (node_id, document_id, text) VALUES (?, ?, ?)")
                .bind(&node.id)
                .bind(&node.document_id)
                .bind(&node.text)
                .execute(&mut *tx)
                .await?;

            if let Some(vector) = &node.embedding {
                sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO node_vectors (node_id, document_id, dims, embedding)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(&node.id)
                .bind(&node.document_id)
                .bind(vector.len() as i64)
                .bind(vec_to_blob(vector))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(nodes.iter().map(|n| n.id.clone()).collect())
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM node_vectors WHERE document_id = ?",
            "DELETE FROM nodes_fts WHERE document_id = ?",
            "DELETE FROM nodes WHERE document_id = ?",
            "DELETE FROM documents WHERE id = ?",
        ] {
            sqlx::query(sql)
                .bind(document_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn document_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM documents ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<NodeCandidate>> {
        let Some(expr) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT n.id, n.document_id, n.node_index, n.text, n.hash, n.metadata_json,
                   nodes_fts.rank AS rank
            FROM nodes_fts
            JOIN nodes n ON n.id = nodes_fts.node_id
            WHERE nodes_fts MATCH ?
            ORDER BY rank, n.id
            LIMIT ?
            "#,
        )
        .bind(&expr)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                Ok(NodeCandidate {
                    node: node_from_row(row)?,
                    raw_score: -rank,
                })
            })
            .collect()
    }

    async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<NodeCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT n.id, n.document_id, n.node_index, n.text, n.hash, n.metadata_json,
                   v.embedding
            FROM node_vectors v
            JOIN nodes n ON n.id = v.node_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
            candidates.push(NodeCandidate {
                node: node_from_row(row)?,
                raw_score: similarity,
            });
        }

        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node.id.cmp(&b.node.id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let nodes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreStats {
            documents: documents as u64,
            nodes: nodes as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docindex_core::models::hash_text;
    use tempfile::TempDir;

    fn node(id: &str, doc: &str, index: i64, text: &str, vec: Vec<f32>) -> Node {
        let mut metadata = Metadata::new();
        metadata.insert("path".to_string(), format!("/docs/{}.md", doc));
        Node {
            id: id.to_string(),
            document_id: doc.to_string(),
            node_index: index,
            text: text.to_string(),
            hash: hash_text(text),
            metadata,
            embedding: Some(vec),
        }
    }

    async fn open_store(tmp: &TempDir) -> SqliteStore {
        let store = SqliteStore::open(&tmp.path().join("data/index.sqlite"))
            .await
            .unwrap();
        store.ensure_schema().await.unwrap();
        store
    }

    #[test]
    fn fts_expression_quotes_terms() {
        assert_eq!(
            fts_match_expression("create \"table\" OR-NOT?").as_deref(),
            Some("\"create\" OR \"table\" OR \"or\" OR \"not\"")
        );
        assert!(fts_match_expression("?!").is_none());
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        store.ensure_schema().await.unwrap();
        assert_eq!(store.stats().await.unwrap(), StoreStats::default());
    }

    #[tokio::test]
    async fn add_search_and_delete() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        store
            .add(&[
                node("n1", "d1", 0, "MSTG vector index tuning", vec![1.0, 0.0]),
                node("n2", "d1", 1, "billing and invoices", vec![0.0, 1.0]),
                node("n3", "d2", 0, "index creation syntax", vec![0.8, 0.2]),
            ])
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats, StoreStats { documents: 2, nodes: 3 });

        let vector = store.vector_search(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(vector[0].node.id, "n1");
        assert_eq!(vector[1].node.id, "n3");
        assert_eq!(vector[0].node.metadata["path"], "/docs/d1.md");
        assert!(vector[0].node.embedding.is_none());

        let keyword = store.keyword_search("index?", 10).await.unwrap();
        let mut ids: Vec<&str> = keyword.iter().map(|c| c.node.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["n1", "n3"]);

        assert_eq!(store.document_ids().await.unwrap(), vec!["d1", "d2"]);
        store.delete_document("d1").await.unwrap();
        assert_eq!(store.document_ids().await.unwrap(), vec!["d2"]);
        assert_eq!(
            store.stats().await.unwrap(),
            StoreStats { documents: 1, nodes: 1 }
        );
        assert!(store.keyword_search("billing", 10).await.unwrap().is_empty());
        store.close().await;
    }

    #[tokio::test]
    async fn add_rejects_unembedded_nodes() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let mut n = node("n1", "d1", 0, "text", vec![1.0]);
        n.embedding = None;
        assert!(store.add(&[n]).await.is_err());
    }

    #[tokio::test]
    async fn re_adding_a_node_replaces_it() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        store
            .add(&[node("n1", "d1", 0, "old words", vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .add(&[node("n1", "d1", 0, "new words", vec![0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(store.stats().await.unwrap().nodes, 1);
        assert!(store.keyword_search("old", 5).await.unwrap().is_empty());
        assert_eq!(store.keyword_search("new", 5).await.unwrap().len(), 1);
    }
}
