//! Sequential indexing: enumerate → load → split → embed → write.
//!
//! Every document's nodes are embedded with a single [`EmbedNodes`] call.
//! The writer replaces each document's previous nodes and drops documents
//! the run no longer produced, so re-running the pipeline over unchanged
//! files leaves the store unchanged.

use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use docindex_core::models::{Document, Node, NodeBatch};
use docindex_core::split::split_document;
use docindex_core::store::VectorStore;

use crate::config::Config;
use crate::embed_nodes::EmbedNodes;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::enumerate::enumerate_files;
use crate::loader::load_and_parse_file;
use crate::progress::{IndexPhase, IndexProgressEvent, IndexProgressReporter};
use crate::store::{self, open_store};

/// Counts reported at the end of an index run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSummary {
    pub files: usize,
    pub documents: usize,
    pub nodes: usize,
    pub written: usize,
}

impl IndexSummary {
    pub fn print(&self, label: &str, store: &str, dry_run: bool) {
        if dry_run {
            println!("index {} (dry-run)", label);
        } else {
            println!("index {}", label);
        }
        println!("  store: {}", store);
        println!("  files: {}", self.files);
        println!("  documents: {}", self.documents);
        println!("  nodes: {}", self.nodes);
        if !dry_run {
            println!("  nodes written: {}", self.written);
        }
        println!("ok");
    }
}

/// Build the embedding provider for an index run, refusing `disabled`.
pub fn indexing_provider(config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    if !config.embedding.is_enabled() {
        bail!(
            "Indexing needs an embedding provider. Set [embedding] provider \
             (\"hash\" works offline)."
        );
    }
    create_provider(&config.embedding)
}

pub async fn run_index(
    config: &Config,
    dry_run: bool,
    reporter: &dyn IndexProgressReporter,
) -> Result<IndexSummary> {
    reporter.report(IndexProgressEvent::Discovering {
        root: config.source.root.display().to_string(),
    });
    let files = enumerate_files(&config.source)?;
    let total_files = files.len() as u64;

    if dry_run {
        let mut summary = IndexSummary {
            files: files.len(),
            ..IndexSummary::default()
        };
        for (i, file) in files.iter().enumerate() {
            for doc in load_and_parse_file(file, &config.source.extensions)? {
                summary.documents += 1;
                summary.nodes += split_document(&doc, config.chunking.max_tokens).len();
            }
            report_advance(reporter, IndexPhase::Loading, i + 1, total_files);
        }
        summary.print("sequential", &store::describe(config), true);
        return Ok(summary);
    }

    let provider = indexing_provider(config)?;
    let embedder = EmbedNodes::new(Arc::clone(&provider));

    let mut documents: Vec<Document> = Vec::new();
    for (i, file) in files.iter().enumerate() {
        documents.extend(load_and_parse_file(file, &config.source.extensions)?);
        report_advance(reporter, IndexPhase::Loading, i + 1, total_files);
    }

    let mut split: Vec<Vec<Node>> = documents
        .iter()
        .map(|doc| split_document(doc, config.chunking.max_tokens))
        .collect();
    let total_nodes: usize = split.iter().map(Vec::len).sum();

    let mut embedded: Vec<Node> = Vec::with_capacity(total_nodes);
    for nodes in split.drain(..) {
        let batch = embedder.call(NodeBatch { nodes }).await?;
        embedded.extend(batch.embedded_nodes);
        report_advance(reporter, IndexPhase::Embedding, embedded.len(), total_nodes as u64);
    }
    tracing::info!(
        documents = documents.len(),
        nodes = embedded.len(),
        model = provider.model_name(),
        "embedded all documents"
    );

    let vector_store = open_store(config, provider.dims()).await?;
    vector_store.ensure_schema().await?;
    let written = write_index(vector_store.as_ref(), embedded, reporter).await?;

    let summary = IndexSummary {
        files: files.len(),
        documents: documents.len(),
        nodes: total_nodes,
        written,
    };
    summary.print("sequential", &store::describe(config), false);
    Ok(summary)
}

/// Persist embedded nodes document by document: delete the document's
/// previous nodes, then add the new ones. Returns the number of nodes added.
///
/// A store holds one source tree, so any stored document without nodes in
/// this run (its file was removed or is now empty) is deleted afterwards.
pub async fn write_index(
    store: &dyn VectorStore,
    nodes: Vec<Node>,
    reporter: &dyn IndexProgressReporter,
) -> Result<usize> {
    let groups = group_by_document(nodes);
    let live: HashSet<String> = groups.iter().map(|(id, _)| id.clone()).collect();
    let total = groups.len() as u64;
    let mut written = 0;

    for (i, (document_id, nodes)) in groups.into_iter().enumerate() {
        store.delete_document(&document_id).await?;
        written += store.add(&nodes).await?.len();
        report_advance(reporter, IndexPhase::Writing, i + 1, total);
    }

    let mut pruned = 0;
    for document_id in store.document_ids().await? {
        if !live.contains(&document_id) {
            store.delete_document(&document_id).await?;
            pruned += 1;
        }
    }

    tracing::info!(store = store.name(), nodes = written, pruned, "index written");
    Ok(written)
}

/// Group nodes by document, keeping first-seen document order.
fn group_by_document(nodes: Vec<Node>) -> Vec<(String, Vec<Node>)> {
    let mut groups: Vec<(String, Vec<Node>)> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();
    for node in nodes {
        let idx = match position.get(&node.document_id) {
            Some(&idx) => idx,
            None => {
                position.insert(node.document_id.clone(), groups.len());
                groups.push((node.document_id.clone(), Vec::new()));
                groups.len() - 1
            }
        };
        groups[idx].1.push(node);
    }
    groups
}

fn report_advance(reporter: &dyn IndexProgressReporter, phase: IndexPhase, n: usize, total: u64) {
    reporter.report(IndexProgressEvent::Advanced {
        phase,
        n: n as u64,
        total,
    });
}
