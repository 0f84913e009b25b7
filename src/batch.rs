//! Distributed batch indexing.
//!
//! Same stages as [`pipeline`](crate::pipeline), run in parallel:
//!
//! 1. **load**: files are read concurrently on the blocking pool, at most
//!    `batch.load_concurrency` at a time;
//! 2. **split**: documents are flat-mapped to nodes;
//! 3. **embed**: nodes are cut into batches of `batch.batch_size` and pulled
//!    from a shared queue by `batch.workers` tasks. Each worker builds its
//!    own [`EmbedNodes`] once and reuses it for every batch it takes.
//!
//! Results are reassembled by batch index, so the output order (document,
//! then node index) does not depend on which worker finished first.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;

use docindex_core::models::{Document, EmbeddedBatch, FileRow, Node, NodeBatch};
use docindex_core::split::split_document;
use docindex_core::store::ensure_embedded;

use crate::config::Config;
use crate::embed_nodes::EmbedNodes;
use crate::embedding::EmbeddingProvider;
use crate::enumerate::enumerate_files;
use crate::loader::load_and_parse_file;
use crate::pipeline::{indexing_provider, write_index, IndexSummary};
use crate::progress::{IndexPhase, IndexProgressEvent, IndexProgressReporter};
use crate::store::{self, open_store};

/// Builds one embedding provider per worker.
pub type ProviderFactory = dyn Fn() -> Result<Arc<dyn EmbeddingProvider>> + Send + Sync;

/// Output of [`embed_dataset`].
#[derive(Debug, Default)]
pub struct EmbeddedDataset {
    pub documents: usize,
    pub nodes: Vec<Node>,
}

pub async fn run_batch_index(
    config: &Config,
    dry_run: bool,
    reporter: &dyn IndexProgressReporter,
) -> Result<IndexSummary> {
    reporter.report(IndexProgressEvent::Discovering {
        root: config.source.root.display().to_string(),
    });
    let files = enumerate_files(&config.source)?;

    if dry_run {
        let documents = load_stage(&files, config, reporter).await?;
        let nodes = split_stage(&documents, config.chunking.max_tokens);
        let summary = IndexSummary {
            files: files.len(),
            documents: documents.len(),
            nodes: nodes.len(),
            written: 0,
        };
        summary.print("distributed", &store::describe(config), true);
        return Ok(summary);
    }

    // Built once up front so configuration errors surface before any work
    // starts, and to learn the vector width for the store.
    let probe = indexing_provider(config)?;
    let dims = probe.dims();
    let embedding = config.embedding.clone();
    let factory: Arc<ProviderFactory> =
        Arc::new(move || crate::embedding::create_provider(&embedding));

    let file_count = files.len();
    let dataset = embed_dataset(files, config, factory, reporter).await?;
    let node_count = dataset.nodes.len();

    let vector_store = open_store(config, dims).await?;
    vector_store.ensure_schema().await?;
    let written = write_index(vector_store.as_ref(), dataset.nodes, reporter).await?;

    let summary = IndexSummary {
        files: file_count,
        documents: dataset.documents,
        nodes: node_count,
        written,
    };
    summary.print("distributed", &store::describe(config), false);
    Ok(summary)
}

/// Load, split and embed `files` with a pool of embedding workers.
///
/// Fails if any worker fails, or if any node comes back without an
/// embedding.
pub async fn embed_dataset(
    files: Vec<FileRow>,
    config: &Config,
    provider_factory: Arc<ProviderFactory>,
    reporter: &dyn IndexProgressReporter,
) -> Result<EmbeddedDataset> {
    let documents = load_stage(&files, config, reporter).await?;
    let nodes = split_stage(&documents, config.chunking.max_tokens);
    tracing::info!(
        files = files.len(),
        documents = documents.len(),
        nodes = nodes.len(),
        "loaded and split dataset"
    );

    let batches = embed_stage(
        nodes,
        config.batch.batch_size,
        config.batch.workers,
        provider_factory,
        reporter,
    )
    .await?;
    let nodes = collect_embedded(batches)?;

    Ok(EmbeddedDataset {
        documents: documents.len(),
        nodes,
    })
}

async fn load_stage(
    files: &[FileRow],
    config: &Config,
    reporter: &dyn IndexProgressReporter,
) -> Result<Vec<Document>> {
    let semaphore = Arc::new(Semaphore::new(config.batch.load_concurrency.max(1)));
    let extensions = Arc::new(config.source.extensions.clone());
    let mut set = JoinSet::new();

    for (idx, file) in files.iter().cloned().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let extensions = Arc::clone(&extensions);
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await?;
            let docs =
                tokio::task::spawn_blocking(move || load_and_parse_file(&file, &extensions))
                    .await??;
            Ok::<_, anyhow::Error>((idx, docs))
        });
    }

    let total = files.len() as u64;
    let mut loaded: Vec<(usize, Vec<Document>)> = Vec::with_capacity(files.len());
    while let Some(joined) = set.join_next().await {
        let (idx, docs) = joined.context("load task panicked")??;
        loaded.push((idx, docs));
        reporter.report(IndexProgressEvent::Advanced {
            phase: IndexPhase::Loading,
            n: loaded.len() as u64,
            total,
        });
    }

    loaded.sort_by_key(|(idx, _)| *idx);
    Ok(loaded.into_iter().flat_map(|(_, docs)| docs).collect())
}

fn split_stage(documents: &[Document], max_tokens: usize) -> Vec<Node> {
    documents
        .iter()
        .flat_map(|doc| split_document(doc, max_tokens))
        .collect()
}

/// Cut `nodes` into batches and embed them on `workers` tasks.
///
/// Returns the embedded batches sorted by their position in the input.
async fn embed_stage(
    nodes: Vec<Node>,
    batch_size: usize,
    workers: usize,
    provider_factory: Arc<ProviderFactory>,
    reporter: &dyn IndexProgressReporter,
) -> Result<Vec<EmbeddedBatch>> {
    let total = nodes.len() as u64;
    let batches = into_batches(nodes, batch_size.max(1));
    let workers = workers.max(1);

    let (work_tx, work_rx) = mpsc::channel::<(usize, NodeBatch)>(workers * 2);
    let work_rx = Arc::new(Mutex::new(work_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<(usize, EmbeddedBatch)>(workers * 2);

    let mut pool = JoinSet::new();
    for worker in 0..workers {
        let work_rx = Arc::clone(&work_rx);
        let result_tx = result_tx.clone();
        let factory = Arc::clone(&provider_factory);
        pool.spawn(async move {
            let embedder = EmbedNodes::new(factory()?);
            loop {
                let next = { work_rx.lock().await.recv().await };
                let Some((idx, batch)) = next else { break };
                let size = batch.nodes.len();
                let embedded = embedder
                    .call(batch)
                    .await
                    .with_context(|| format!("worker {} failed on batch {}", worker, idx))?;
                tracing::debug!(worker, batch = idx, nodes = size, "batch embedded");
                if result_tx.send((idx, embedded)).await.is_err() {
                    break;
                }
            }
            Ok::<_, anyhow::Error>(())
        });
    }
    drop(result_tx);

    let producer = tokio::spawn(async move {
        for item in batches {
            // Every worker has exited; their errors surface on join.
            if work_tx.send(item).await.is_err() {
                break;
            }
        }
    });

    let mut done: Vec<(usize, EmbeddedBatch)> = Vec::new();
    let mut embedded_nodes = 0u64;
    while let Some((idx, batch)) = result_rx.recv().await {
        embedded_nodes += batch.embedded_nodes.len() as u64;
        done.push((idx, batch));
        reporter.report(IndexProgressEvent::Advanced {
            phase: IndexPhase::Embedding,
            n: embedded_nodes,
            total,
        });
    }

    producer.await.context("batch producer panicked")?;
    while let Some(joined) = pool.join_next().await {
        joined.context("embedding worker panicked")??;
    }

    done.sort_by_key(|(idx, _)| *idx);
    Ok(done.into_iter().map(|(_, batch)| batch).collect())
}

fn into_batches(nodes: Vec<Node>, batch_size: usize) -> Vec<(usize, NodeBatch)> {
    let mut batches = Vec::with_capacity(nodes.len().div_ceil(batch_size));
    let mut current = Vec::with_capacity(batch_size);
    for node in nodes {
        current.push(node);
        if current.len() == batch_size {
            let nodes = std::mem::replace(&mut current, Vec::with_capacity(batch_size));
            batches.push((batches.len(), NodeBatch { nodes }));
        }
    }
    if !current.is_empty() {
        batches.push((batches.len(), NodeBatch { nodes: current }));
    }
    batches
}

/// Flatten embedded batches, failing if any node lacks a vector.
fn collect_embedded(batches: Vec<EmbeddedBatch>) -> Result<Vec<Node>> {
    let nodes: Vec<Node> = batches
        .into_iter()
        .flat_map(|batch| batch.embedded_nodes)
        .collect();
    ensure_embedded(&nodes).context("embedding stage left nodes without vectors")?;
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use docindex_core::models::{hash_text, Metadata};

    use crate::embedding::HashProvider;
    use crate::progress::NoProgress;

    fn node(document: &str, index: i64) -> Node {
        let text = format!("{} node {}", document, index);
        Node {
            id: format!("{}-{}", document, index),
            document_id: document.to_string(),
            node_index: index,
            hash: hash_text(&text),
            text,
            metadata: Metadata::new(),
            embedding: None,
        }
    }

    /// Sleeps longer for earlier batches so completion order is reversed.
    struct SlowFirstProvider;

    #[async_trait]
    impl EmbeddingProvider for SlowFirstProvider {
        fn model_name(&self) -> &str {
            "slow-first"
        }

        fn dims(&self) -> usize {
            1
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let first: i64 = texts[0]
                .rsplit(' ')
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis((20 - first.min(20)) as u64 * 5)).await;
            Ok(texts.iter().map(|_| vec![1.0]).collect())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        fn model_name(&self) -> &str {
            "failing"
        }

        fn dims(&self) -> usize {
            1
        }

        async fn embed_texts(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            anyhow::bail!("upstream unavailable")
        }
    }

    #[test]
    fn batches_are_numbered_in_order() {
        let nodes: Vec<Node> = (0..5).map(|i| node("d", i)).collect();
        let batches = into_batches(nodes, 2);
        let sizes: Vec<(usize, usize)> = batches
            .iter()
            .map(|(idx, b)| (*idx, b.nodes.len()))
            .collect();
        assert_eq!(sizes, vec![(0, 2), (1, 2), (2, 1)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn output_order_ignores_completion_order() {
        let nodes: Vec<Node> = (0..12).map(|i| node("d", i)).collect();
        let factory: Arc<ProviderFactory> =
            Arc::new(|| -> Result<Arc<dyn EmbeddingProvider>> { Ok(Arc::new(SlowFirstProvider)) });
        let batches = embed_stage(nodes, 2, 4, factory, &NoProgress).await.unwrap();
        let embedded = collect_embedded(batches).unwrap();
        let indices: Vec<i64> = embedded.iter().map(|n| n.node_index).collect();
        assert_eq!(indices, (0..12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn each_worker_builds_one_provider() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let factory: Arc<ProviderFactory> =
            Arc::new(move || -> Result<Arc<dyn EmbeddingProvider>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(HashProvider::new(8)?))
            });
        let nodes: Vec<Node> = (0..30).map(|i| node("d", i)).collect();
        let batches = embed_stage(nodes, 3, 3, factory, &NoProgress).await.unwrap();
        assert_eq!(batches.len(), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn worker_failure_fails_the_run() {
        let factory: Arc<ProviderFactory> =
            Arc::new(|| -> Result<Arc<dyn EmbeddingProvider>> { Ok(Arc::new(FailingProvider)) });
        let nodes: Vec<Node> = (0..4).map(|i| node("d", i)).collect();
        let err = embed_stage(nodes, 2, 2, factory, &NoProgress)
            .await
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("upstream unavailable"));
    }

    #[test]
    fn missing_embedding_is_rejected() {
        let mut embedded = node("d", 0);
        embedded.embedding = Some(vec![1.0]);
        let batches = vec![EmbeddedBatch {
            embedded_nodes: vec![embedded, node("d", 1)],
        }];
        let err = collect_embedded(batches).err().unwrap();
        assert!(format!("{:#}", err).contains("has no embedding"));
    }

    #[tokio::test]
    async fn distributed_run_matches_sequential_counts() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("setup.md"),
            "# Setup\n\nInstall the client.\n\n## Connect\n\nUse port 443.\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("index.md"), "# Vector Index\n\nMSTG.\n").unwrap();

        let mut config = Config::minimal();
        config.source.root = tmp.path().to_path_buf();
        config.embedding.provider = "hash".to_string();
        config.embedding.dims = Some(16);
        config.batch.batch_size = 1;
        config.batch.workers = 2;

        let summary = run_batch_index(&config, false, &NoProgress).await.unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(summary.documents, 2);
        assert_eq!(summary.nodes, 3);
        assert_eq!(summary.written, 3);
    }
}
