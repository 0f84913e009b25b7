//! The `docindex query` command: embed → retrieve → synthesize.

use anyhow::{bail, Context, Result};
use std::io::{BufRead, Write};

use docindex_core::models::NodeWithScore;
use docindex_core::retrieve::{self, QueryMode, VectorStoreQuery};

use crate::config::Config;
use crate::embedding::create_provider;
use crate::store::{configured_dims, open_store};
use crate::synthesize::Synthesizer;

const SNIPPET_CHARS: usize = 240;

pub async fn run_query(
    config: &Config,
    query: Option<String>,
    mode: Option<QueryMode>,
    top_k: Option<usize>,
    synthesize: bool,
    show_sources: bool,
) -> Result<()> {
    let query = match query {
        Some(q) if !q.trim().is_empty() => q,
        _ => {
            let stdin = std::io::stdin();
            let mut stdout = std::io::stdout();
            read_query(&mut stdin.lock(), &mut stdout)?
        }
    };

    let nodes = retrieve_nodes(config, &query, mode, top_k).await?;

    if synthesize && config.synthesis.is_enabled() {
        let synthesizer = Synthesizer::from_config(&config.synthesis)?;
        let response = synthesizer.synthesize(&query, &nodes).await?;
        println!("Response: {}", response);
        if show_sources {
            println!();
            println!("Sources:");
            print_nodes(&response.source_nodes);
        }
        return Ok(());
    }

    if synthesize {
        tracing::warn!("[synthesis] provider is disabled; printing retrieved nodes");
    }
    if nodes.is_empty() {
        println!("No results.");
    } else {
        print_nodes(&nodes);
    }
    Ok(())
}

/// Prompt for a query until a non-empty line is entered.
pub fn read_query<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> Result<String> {
    write!(output, "Query: ")?;
    output.flush()?;
    loop {
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            bail!("No query given");
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
        write!(output, "\nQuery: ")?;
        output.flush()?;
    }
}

/// Embed the query if the mode needs it and run it against the store.
pub async fn retrieve_nodes(
    config: &Config,
    query: &str,
    mode: Option<QueryMode>,
    top_k: Option<usize>,
) -> Result<Vec<NodeWithScore>> {
    let mode = mode.unwrap_or(config.retrieval.mode);

    let (query_embedding, dims) = if mode.needs_embedding() {
        if !config.embedding.is_enabled() {
            bail!(
                "Mode '{}' requires embeddings. Set [embedding] provider in config, \
                 or use --mode text.",
                mode
            );
        }
        let provider = create_provider(&config.embedding)?;
        let vector = provider
            .embed_query(query)
            .await
            .context("failed to embed query")?;
        (Some(vector), provider.dims())
    } else {
        (None, configured_dims(config))
    };

    let store = open_store(config, dims).await?;
    let request = VectorStoreQuery {
        query_embedding,
        query_str: Some(query.to_string()),
        similarity_top_k: top_k.unwrap_or(config.retrieval.similarity_top_k),
        mode,
        alpha: config.retrieval.hybrid_alpha,
        amplify_ratio: config.retrieval.amplify_ratio,
    };
    let result = retrieve::query(store.as_ref(), &request).await?;
    tracing::info!(mode = %mode, results = result.len(), "query complete");
    Ok(result.into_nodes_with_score())
}

fn print_nodes(nodes: &[NodeWithScore]) {
    for (i, scored) in nodes.iter().enumerate() {
        println!("{}", format_node(i, scored));
        println!();
    }
}

fn format_node(i: usize, scored: &NodeWithScore) -> String {
    let meta = &scored.node.metadata;
    let path = meta.get("path").map(String::as_str).unwrap_or("(unknown)");
    let mut out = format!("{}. [{:.2}] {}", i + 1, scored.score, path);
    if let Some(header) = meta.get("header") {
        out.push_str(&format!("\n    header: {}", header));
    }
    out.push_str(&format!("\n    excerpt: \"{}\"", snippet(&scored.node.text)));
    out.push_str(&format!("\n    id: {}", scored.node.id));
    out
}

fn snippet(text: &str) -> String {
    let flat = text.replace('\n', " ");
    let flat = flat.trim();
    if flat.chars().count() <= SNIPPET_CHARS {
        return flat.to_string();
    }
    let cut: String = flat.chars().take(SNIPPET_CHARS).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use docindex_core::models::{hash_text, Metadata, Node};
    use std::io::Cursor;

    #[test]
    fn prompt_repeats_until_non_empty() {
        let mut input = Cursor::new("\n   \nhow do I connect?\n");
        let mut output: Vec<u8> = Vec::new();
        let q = read_query(&mut input, &mut output).unwrap();
        assert_eq!(q, "how do I connect?");
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "Query: \nQuery: \nQuery: "
        );
    }

    #[test]
    fn prompt_fails_on_eof() {
        let mut input = Cursor::new("");
        let mut output: Vec<u8> = Vec::new();
        assert!(read_query(&mut input, &mut output).is_err());
    }

    #[test]
    fn formats_ranked_node() {
        let mut metadata = Metadata::new();
        metadata.insert("path".to_string(), "docs/setup.md".to_string());
        metadata.insert("header".to_string(), "Connect".to_string());
        let scored = NodeWithScore {
            node: Node {
                id: "n1".to_string(),
                document_id: "d1".to_string(),
                node_index: 0,
                text: "## Connect\nUse port 443.".to_string(),
                hash: hash_text("x"),
                metadata,
                embedding: None,
            },
            score: 0.5,
        };
        let out = format_node(0, &scored);
        assert!(out.starts_with("1. [0.50] docs/setup.md"));
        assert!(out.contains("header: Connect"));
        assert!(out.contains("excerpt: \"## Connect Use port 443.\""));
    }

    #[test]
    fn long_snippets_are_cut() {
        let text = "word ".repeat(200);
        let s = snippet(&text);
        assert!(s.ends_with("..."));
        assert!(s.chars().count() <= SNIPPET_CHARS + 3);
    }

    #[tokio::test]
    async fn default_mode_needs_an_embedder() {
        let mut config = Config::minimal();
        config.embedding.provider = "disabled".to_string();
        let err = retrieve_nodes(&config, "anything", Some(QueryMode::Default), None)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("requires embeddings"));
    }

    #[tokio::test]
    async fn text_mode_on_empty_store_returns_nothing() {
        let config = Config::minimal();
        let nodes = retrieve_nodes(&config, "port", Some(QueryMode::Text), Some(5))
            .await
            .unwrap();
        assert!(nodes.is_empty());
    }
}
