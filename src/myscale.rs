//! MyScale [`VectorStore`] over the ClickHouse HTTP interface.
//!
//! Statements are POSTed as the request body with `X-ClickHouse-User` /
//! `X-ClickHouse-Key` authentication. Rows are written and read as
//! `FORMAT JSONEachRow`. The table layout:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS `default`.`llama_index` (
//!     id String, doc_id String, node_index Int64, text String, hash String,
//!     vector Array(Float32), metadata String,
//!     CONSTRAINT vector_length CHECK length(vector) = 768,
//!     VECTOR INDEX llama_index_vector_idx vector TYPE MSTG('metric_type=Cosine')
//! ) ENGINE = MergeTree ORDER BY id
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use docindex_core::models::{Metadata, Node};
use docindex_core::store::{ensure_embedded, query_terms, NodeCandidate, StoreStats, VectorStore};

use crate::config::MyScaleConfig;
use crate::http;

/// Distance metric of the vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Cosine,
    L2,
    Ip,
}

impl Metric {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "l2" => Ok(Metric::L2),
            "ip" => Ok(Metric::Ip),
            other => bail!("Unknown MyScale metric: {}", other),
        }
    }

    fn index_param(&self) -> &'static str {
        match self {
            Metric::Cosine => "Cosine",
            Metric::L2 => "L2",
            Metric::Ip => "IP",
        }
    }

    /// Inner product grows with similarity; the other metrics shrink.
    fn order(&self) -> &'static str {
        match self {
            Metric::Ip => "DESC",
            _ => "ASC",
        }
    }

    /// Convert a `distance()` value into a higher-is-better score.
    pub fn score(&self, distance: f64) -> f64 {
        match self {
            Metric::Cosine => 1.0 - distance,
            Metric::L2 => -distance,
            Metric::Ip => distance,
        }
    }
}

pub struct MyScaleStore {
    client: reqwest::Client,
    endpoint: String,
    username: String,
    password: Option<String>,
    database: String,
    table: String,
    dims: usize,
    metric: Metric,
    index_type: String,
    insert_batch_size: usize,
    max_retries: u32,
}

impl MyScaleStore {
    /// `dims` is the embedding dimensionality enforced by the table's
    /// `CHECK` constraint. It may be 0 when the store is only read.
    pub fn new(config: &MyScaleConfig, dims: usize) -> Result<Self> {
        for (key, value) in [
            ("database", &config.database),
            ("table", &config.table),
            ("index_type", &config.index_type),
        ] {
            if !is_identifier(value) {
                bail!("store.myscale.{} must be a plain identifier, got '{}'", key, value);
            }
        }

        let scheme = if config.secure { "https" } else { "http" };
        Ok(Self {
            client: http::build_client(config.timeout_secs)?,
            endpoint: format!("{}://{}:{}/", scheme, config.host, config.port),
            username: config.username.clone(),
            password: config.resolved_password(),
            database: config.database.clone(),
            table: config.table.clone(),
            dims,
            metric: Metric::parse(&config.metric)?,
            index_type: config.index_type.clone(),
            insert_batch_size: config.insert_batch_size.max(1),
            max_retries: config.max_retries,
        })
    }

    fn qualified_table(&self) -> String {
        format!("`{}`.`{}`", self.database, self.table)
    }

    /// Run one statement and return the raw response body.
    async fn execute(&self, sql: &str) -> Result<String> {
        let build = || {
            let request = self
                .client
                .post(&self.endpoint)
                .query(&[("database", self.database.as_str())])
                .header("X-ClickHouse-User", &self.username)
                .body(sql.to_string());
            match &self.password {
                Some(password) => request.header("X-ClickHouse-Key", password),
                None => request,
            }
        };
        let response =
            http::send_with_retry(build, &self.endpoint, self.max_retries, "MyScale").await?;
        Ok(response.text().await?)
    }

    async fn fetch_rows(&self, sql: &str) -> Result<Vec<serde_json::Value>> {
        let body = self.execute(&format!("{} FORMAT JSONEachRow", sql)).await?;
        parse_json_each_row(&body)
    }

    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             id String, \
             doc_id String, \
             node_index Int64, \
             text String, \
             hash String, \
             vector Array(Float32), \
             metadata String, \
             CONSTRAINT vector_length CHECK length(vector) = {dims}, \
             VECTOR INDEX {index_name} vector TYPE {index_type}('metric_type={metric}')\
             ) ENGINE = MergeTree ORDER BY id",
            table = self.qualified_table(),
            dims = self.dims,
            index_name = format!("{}_vector_idx", self.table),
            index_type = self.index_type,
            metric = self.metric.index_param(),
        )
    }

    /// One `INSERT ... FORMAT JSONEachRow` statement carrying every node.
    pub fn insert_sql(&self, nodes: &[Node]) -> Result<String> {
        let mut sql = format!(
            "INSERT INTO {} (id, doc_id, node_index, text, hash, vector, metadata) FORMAT JSONEachRow\n",
            self.qualified_table()
        );
        for node in nodes {
            let vector = node
                .embedding
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("node {} has no embedding", node.id))?;
            let row = serde_json::json!({
                "id": node.id,
                "doc_id": node.document_id,
                "node_index": node.node_index,
                "text": node.text,
                "hash": node.hash,
                "vector": vector,
                "metadata": serde_json::to_string(&node.metadata)?,
            });
            sql.push_str(&serde_json::to_string(&row)?);
            sql.push('\n');
        }
        Ok(sql)
    }

    pub fn delete_sql(&self, document_id: &str) -> String {
        format!(
            "DELETE FROM {} WHERE doc_id = '{}'",
            self.qualified_table(),
            escape_string(document_id)
        )
    }

    pub fn vector_search_sql(&self, query_vec: &[f32], limit: usize) -> String {
        format!(
            "SELECT id, doc_id, node_index, text, hash, metadata, \
             distance(vector, {vec}) AS dist \
             FROM {table} ORDER BY dist {order}, id ASC LIMIT {limit}",
            vec = vector_literal(query_vec),
            table = self.qualified_table(),
            order = self.metric.order(),
            limit = limit,
        )
    }

    /// `None` when the query has no searchable terms.
    pub fn keyword_search_sql(&self, query: &str, limit: usize) -> Option<String> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return None;
        }
        let score = terms
            .iter()
            .map(|t| format!("countSubstringsCaseInsensitiveUTF8(text, '{}')", escape_string(t)))
            .collect::<Vec<_>>()
            .join(" + ");
        Some(format!(
            "SELECT id, doc_id, node_index, text, hash, metadata, ({score}) AS score \
             FROM {table} WHERE score > 0 ORDER BY score DESC, id ASC LIMIT {limit}",
            score = score,
            table = self.qualified_table(),
            limit = limit,
        ))
    }
}

#[async_trait]
impl VectorStore for MyScaleStore {
    fn name(&self) -> &str {
        "myscale"
    }

    async fn ensure_schema(&self) -> Result<()> {
        if self.dims == 0 {
            bail!(
                "Creating the MyScale table needs the embedding dimensionality. \
                 Set [embedding] provider (and dims where required)."
            );
        }
        self.execute(&self.create_table_sql())
            .await
            .with_context(|| format!("Failed to create MyScale table {}", self.qualified_table()))?;
        Ok(())
    }

    async fn add(&self, nodes: &[Node]) -> Result<Vec<String>> {
        ensure_embedded(nodes)?;
        for batch in nodes.chunks(self.insert_batch_size) {
            self.execute(&self.insert_sql(batch)?).await?;
            tracing::debug!(rows = batch.len(), table = %self.table, "inserted rows");
        }
        Ok(nodes.iter().map(|n| n.id.clone()).collect())
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        self.execute(&self.delete_sql(document_id)).await?;
        Ok(())
    }

    async fn document_ids(&self) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT doc_id FROM {} ORDER BY doc_id",
            self.qualified_table()
        );
        self.fetch_rows(&sql)
            .await?
            .iter()
            .map(|row| json_str(row, "doc_id"))
            .collect()
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<NodeCandidate>> {
        let Some(sql) = self.keyword_search_sql(query, limit) else {
            return Ok(Vec::new());
        };
        self.fetch_rows(&sql)
            .await?
            .iter()
            .map(|row| {
                Ok(NodeCandidate {
                    node: node_from_row(row)?,
                    raw_score: json_f64(row, "score")?,
                })
            })
            .collect()
    }

    async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<NodeCandidate>> {
        let sql = self.vector_search_sql(query_vec, limit);
        self.fetch_rows(&sql)
            .await?
            .iter()
            .map(|row| {
                Ok(NodeCandidate {
                    node: node_from_row(row)?,
                    raw_score: self.metric.score(json_f64(row, "dist")?),
                })
            })
            .collect()
    }

    async fn stats(&self) -> Result<StoreStats> {
        let sql = format!(
            "SELECT uniqExact(doc_id) AS documents, count() AS nodes FROM {}",
            self.qualified_table()
        );
        let rows = self.fetch_rows(&sql).await?;
        let row = rows
            .first()
            .ok_or_else(|| anyhow::anyhow!("MyScale returned no rows for stats"))?;
        Ok(StoreStats {
            documents: json_i64(row, "documents")? as u64,
            nodes: json_i64(row, "nodes")? as u64,
        })
    }
}

/// Escape a value for a single-quoted ClickHouse string literal.
pub fn escape_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn vector_literal(v: &[f32]) -> String {
    let parts: Vec<String> = v.iter().map(|x| x.to_string()).collect();
    format!("[{}]", parts.join(","))
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn parse_json_each_row(body: &str) -> Result<Vec<serde_json::Value>> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).with_context(|| format!("Invalid JSONEachRow line: {}", line))
        })
        .collect()
}

fn node_from_row(row: &serde_json::Value) -> Result<Node> {
    let metadata: Metadata = match row.get("metadata").and_then(|m| m.as_str()) {
        Some(s) if !s.is_empty() => {
            serde_json::from_str(s).with_context(|| "Invalid node metadata from MyScale")?
        }
        _ => Metadata::new(),
    };
    Ok(Node {
        id: json_str(row, "id")?,
        document_id: json_str(row, "doc_id")?,
        node_index: json_i64(row, "node_index")?,
        text: json_str(row, "text")?,
        hash: json_str(row, "hash")?,
        metadata,
        embedding: None,
    })
}

fn json_str(row: &serde_json::Value, key: &str) -> Result<String> {
    row.get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("MyScale row missing string column '{}'", key))
}

/// 64-bit integers arrive as quoted strings in JSON output formats.
fn json_i64(row: &serde_json::Value, key: &str) -> Result<i64> {
    match row.get(key) {
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|u| u as i64))
            .ok_or_else(|| anyhow::anyhow!("MyScale column '{}' is not an integer", key)),
        Some(serde_json::Value::String(s)) => s
            .parse()
            .with_context(|| format!("MyScale column '{}' is not an integer: {}", key, s)),
        _ => bail!("MyScale row missing integer column '{}'", key),
    }
}

fn json_f64(row: &serde_json::Value, key: &str) -> Result<f64> {
    match row.get(key) {
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("MyScale column '{}' is not a number", key)),
        Some(serde_json::Value::String(s)) => s
            .parse()
            .with_context(|| format!("MyScale column '{}' is not a number: {}", key, s)),
        _ => bail!("MyScale row missing numeric column '{}'", key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docindex_core::models::hash_text;

    fn config() -> MyScaleConfig {
        let toml = r#"
host = "msc-test.us-east-1.aws.myscale.cloud"
username = "default"
password = "pw"
"#;
        toml::from_str(toml).unwrap()
    }

    fn store() -> MyScaleStore {
        MyScaleStore::new(&config(), 3).unwrap()
    }

    fn node(id: &str, text: &str) -> Node {
        let mut metadata = Metadata::new();
        metadata.insert("path".to_string(), "/docs/it's.md".to_string());
        Node {
            id: id.to_string(),
            document_id: "doc1".to_string(),
            node_index: 2,
            text: text.to_string(),
            hash: hash_text(text),
            metadata,
            embedding: Some(vec![0.5, -1.0, 0.25]),
        }
    }

    #[test]
    fn escapes_quotes_and_backslashes() {
        assert_eq!(escape_string(r"it's a \path"), r"it\'s a \\path");
    }

    #[test]
    fn endpoint_uses_https_and_port() {
        assert_eq!(
            store().endpoint,
            "https://msc-test.us-east-1.aws.myscale.cloud:443/"
        );
    }

    #[test]
    fn rejects_non_identifier_table() {
        let mut cfg = config();
        cfg.table = "nodes; DROP TABLE x".to_string();
        assert!(MyScaleStore::new(&cfg, 3).is_err());
    }

    #[tokio::test]
    async fn schema_needs_known_dims() {
        let store = MyScaleStore::new(&config(), 0).unwrap();
        let err = store.ensure_schema().await.err().unwrap();
        assert!(err.to_string().contains("dimensionality"));
    }

    #[test]
    fn create_table_has_constraint_and_index() {
        let sql = store().create_table_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS `default`.`llama_index`"));
        assert!(sql.contains("CHECK length(vector) = 3"));
        assert!(sql.contains("VECTOR INDEX llama_index_vector_idx vector TYPE MSTG('metric_type=Cosine')"));
    }

    #[test]
    fn insert_writes_one_json_row_per_node() {
        let sql = store()
            .insert_sql(&[node("n1", "don't"), node("n2", "line\nbreak")])
            .unwrap();
        let (head, body) = sql.split_once('\n').unwrap();
        assert_eq!(
            head,
            "INSERT INTO `default`.`llama_index` (id, doc_id, node_index, text, hash, vector, metadata) FORMAT JSONEachRow"
        );
        let rows = parse_json_each_row(body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["text"], "don't");
        assert_eq!(rows[0]["vector"], serde_json::json!([0.5, -1.0, 0.25]));
        assert_eq!(rows[1]["text"], "line\nbreak");

        let node = node_from_row(&rows[0]).unwrap();
        assert_eq!(node.node_index, 2);
        assert_eq!(node.metadata["path"], "/docs/it's.md");
    }

    #[test]
    fn insert_requires_embeddings() {
        let mut n = node("n1", "x");
        n.embedding = None;
        assert!(store().insert_sql(&[n]).is_err());
    }

    #[test]
    fn search_sql_shapes() {
        let s = store();
        let vector = s.vector_search_sql(&[1.0, 0.0, 0.0], 5);
        assert!(vector.contains("distance(vector, [1,0,0]) AS dist"));
        assert!(vector.ends_with("ORDER BY dist ASC, id ASC LIMIT 5"));

        let keyword = s.keyword_search_sql("MSTG index?", 10).unwrap();
        assert!(keyword.contains("countSubstringsCaseInsensitiveUTF8(text, 'mstg') + countSubstringsCaseInsensitiveUTF8(text, 'index')"));
        assert!(s.keyword_search_sql("??", 10).is_none());

        assert_eq!(
            s.delete_sql("a'b"),
            "DELETE FROM `default`.`llama_index` WHERE doc_id = 'a\\'b'"
        );
    }

    #[test]
    fn parses_json_each_row_with_quoted_integers() {
        let body = concat!(
            r#"{"id":"n1","doc_id":"d1","node_index":"3","text":"hello","hash":"h","metadata":"{\"path\":\"/a.md\"}","dist":0.25}"#,
            "\n\n",
            r#"{"documents":"2","nodes":7}"#,
            "\n"
        );
        let rows = parse_json_each_row(body).unwrap();
        assert_eq!(rows.len(), 2);
        let node = node_from_row(&rows[0]).unwrap();
        assert_eq!(node.node_index, 3);
        assert_eq!(node.metadata["path"], "/a.md");
        assert!((Metric::Cosine.score(json_f64(&rows[0], "dist").unwrap()) - 0.75).abs() < 1e-9);
        assert_eq!(json_i64(&rows[1], "documents").unwrap(), 2);
        assert_eq!(json_i64(&rows[1], "nodes").unwrap(), 7);
    }

    #[test]
    fn metric_scores_are_higher_is_better() {
        assert!(Metric::L2.score(0.1) > Metric::L2.score(2.0));
        assert!(Metric::Ip.score(0.9) > Metric::Ip.score(0.1));
        assert_eq!(Metric::parse("IP").unwrap(), Metric::Ip);
        assert!(Metric::parse("hamming").is_err());
    }
}
