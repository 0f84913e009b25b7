//! Answer synthesis over retrieved nodes.
//!
//! Compact-and-refine: node texts are packed in score order into context
//! windows of at most `max_context_chars`. The first window is answered with
//! a question-answering prompt; every further window asks the model to refine
//! the answer it already has.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use docindex_core::models::NodeWithScore;

use crate::config::SynthesisConfig;
use crate::http;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const EMPTY_RESPONSE: &str = "Empty Response";

const TEXT_QA_TEMPLATE: &str = "Context information is below.\n\
---------------------\n\
{context}\n\
---------------------\n\
Given the context information and not prior knowledge, answer the query.\n\
Query: {query}\n\
Answer: ";

const REFINE_TEMPLATE: &str = "The original query is as follows: {query}\n\
We have provided an existing answer: {answer}\n\
We have the opportunity to refine the existing answer (only if needed) with some more context below.\n\
------------\n\
{context}\n\
------------\n\
Given the new context, refine the original answer to better answer the query. \
If the context isn't useful, return the original answer.\n\
Refined Answer: ";

/// A text-completion backend.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, prompt: &str) -> Result<String>;
}

pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn complete(&self, _prompt: &str) -> Result<String> {
        bail!("Synthesis provider is disabled. Set [synthesis] provider in the config or pass --no-synthesize.")
    }
}

/// OpenAI chat completions. Requires `OPENAI_API_KEY`.
pub struct OpenAIChat {
    model: String,
    temperature: f32,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIChat {
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("synthesis.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model,
            temperature: config.temperature,
            api_key,
            max_retries: config.max_retries,
            client: http::build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [{"role": "user", "content": prompt}],
        });
        let json = http::post_json_with_retry(
            &self.client,
            OPENAI_CHAT_URL,
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI API",
        )
        .await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|c| c.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
    }
}

/// Ollama `/api/chat` without streaming.
pub struct OllamaChat {
    model: String,
    temperature: f32,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaChat {
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("synthesis.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        Ok(Self {
            model,
            temperature: config.temperature,
            url: url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            client: http::build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "stream": false,
            "options": {"temperature": self.temperature},
            "messages": [{"role": "user", "content": prompt}],
        });
        let json = http::post_json_with_retry(
            &self.client,
            &format!("{}/api/chat", self.url),
            None,
            &body,
            self.max_retries,
            "Ollama API",
        )
        .await?;
        json.pointer("/message/content")
            .and_then(|c| c.as_str())
            .map(|c| c.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing message.content"))
    }
}

pub fn create_language_model(config: &SynthesisConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "openai" => Ok(Arc::new(OpenAIChat::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaChat::new(config)?)),
        other => bail!("Unknown synthesis provider: {}", other),
    }
}

/// A synthesized answer and the nodes it was built from.
#[derive(Debug, Clone)]
pub struct Response {
    pub response: String,
    pub source_nodes: Vec<NodeWithScore>,
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.response)
    }
}

pub struct Synthesizer {
    llm: Arc<dyn LanguageModel>,
    max_context_chars: usize,
}

impl Synthesizer {
    pub fn new(llm: Arc<dyn LanguageModel>, max_context_chars: usize) -> Self {
        Self {
            llm,
            max_context_chars: max_context_chars.max(1),
        }
    }

    pub fn from_config(config: &SynthesisConfig) -> Result<Self> {
        Ok(Self::new(
            create_language_model(config)?,
            config.max_context_chars,
        ))
    }

    pub async fn synthesize(&self, query: &str, nodes: &[NodeWithScore]) -> Result<Response> {
        let texts: Vec<&str> = nodes
            .iter()
            .map(|n| n.node.text.as_str())
            .filter(|t| !t.trim().is_empty())
            .collect();
        let windows = pack_contexts(&texts, self.max_context_chars);

        let mut answer: Option<String> = None;
        for (i, context) in windows.iter().enumerate() {
            let prompt = match &answer {
                None => render(TEXT_QA_TEMPLATE, &[("context", context), ("query", query)]),
                Some(existing) => render(
                    REFINE_TEMPLATE,
                    &[("query", query), ("answer", existing), ("context", context)],
                ),
            };
            tracing::debug!(
                window = i,
                chars = context.len(),
                model = self.llm.model_name(),
                "synthesis step"
            );
            answer = Some(self.llm.complete(&prompt).await?);
        }

        Ok(Response {
            response: answer.unwrap_or_else(|| EMPTY_RESPONSE.to_string()),
            source_nodes: nodes.to_vec(),
        })
    }
}

/// Substitute `{name}` placeholders in one pass, so substituted values are
/// never themselves expanded.
fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        match vars
            .iter()
            .find(|(key, _)| tail.starts_with(key) && tail[key.len()..].starts_with('}'))
        {
            Some((key, value)) => {
                out.push_str(value);
                rest = &tail[key.len() + 1..];
            }
            None => {
                out.push('{');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Pack texts, in order and separated by blank lines, into windows of at
/// most `max_chars` characters. A single text longer than `max_chars` is cut
/// at character boundaries across several windows.
pub fn pack_contexts(texts: &[&str], max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut windows = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for text in texts {
        for piece in split_chars(text, max_chars) {
            let piece_chars = piece.chars().count();
            let sep = if current.is_empty() { 0 } else { 2 };
            if current_chars + sep + piece_chars > max_chars && !current.is_empty() {
                windows.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            if !current.is_empty() {
                current.push_str("\n\n");
                current_chars += 2;
            }
            current.push_str(piece);
            current_chars += piece_chars;
        }
    }
    if !current.is_empty() {
        windows.push(current);
    }
    windows
}

fn split_chars(text: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (idx, _) in text.char_indices() {
        if count == max_chars {
            pieces.push(&text[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}
