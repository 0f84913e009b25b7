//! Tract-based local embeddings (fallback for musl and Intel Mac).
//!
//! Pure Rust: the ONNX model runs on tract-onnx and text is tokenized with
//! the tokenizers crate. Sentence vectors are mean-pooled over the attention
//! mask and L2-normalized.
#![cfg_attr(
    all(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract"),
    allow(dead_code)
)]

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use tract_onnx::prelude::*;

use docindex_core::embedding::normalize_l2;

const MAX_SEQ_LEN: usize = 256;

pub(crate) struct ModelFiles {
    repo: &'static str,
    onnx: &'static str,
    tokenizer: &'static str,
    dims: usize,
}

pub(crate) fn model_manifest(model_name: &str) -> Result<ModelFiles> {
    match model_name {
        "all-minilm-l6-v2" => Ok(ModelFiles {
            repo: "sentence-transformers/all-MiniLM-L6-v2",
            onnx: "onnx/model.onnx",
            tokenizer: "tokenizer.json",
            dims: 384,
        }),
        "all-mpnet-base-v2" => Ok(ModelFiles {
            repo: "sentence-transformers/all-mpnet-base-v2",
            onnx: "onnx/model.onnx",
            tokenizer: "tokenizer.json",
            dims: 768,
        }),
        _ => bail!(
            "Tract backend supports all-minilm-l6-v2 and all-mpnet-base-v2. Requested: '{}'",
            model_name
        ),
    }
}

fn cache_dir() -> Result<PathBuf> {
    let base = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let dir = PathBuf::from(base)
        .join(".cache")
        .join("docindex")
        .join("models");
    std::fs::create_dir_all(&dir).map_err(|e| anyhow::anyhow!("Create cache dir: {}", e))?;
    Ok(dir)
}

fn download_to_cache(repo: &str, file: &str, cache_path: &Path) -> Result<()> {
    if cache_path.exists() {
        return Ok(());
    }
    let url = format!("https://huggingface.co/{}/resolve/main/{}", repo, file);
    tracing::info!(%url, "downloading model file");
    let bytes = reqwest::blocking::get(&url)
        .and_then(|resp| resp.error_for_status())
        .and_then(|resp| resp.bytes())
        .map_err(|e| anyhow::anyhow!("Download {}: {}", url, e))?;
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| anyhow::anyhow!("Create cache parent: {}", e))?;
    }
    std::fs::write(cache_path, &bytes).map_err(|e| anyhow::anyhow!("Write cache: {}", e))?;
    Ok(())
}

/// A loaded tokenizer and optimized ONNX plan. Blocking; call from
/// `spawn_blocking`.
pub struct TractModel {
    tokenizer: tokenizers::Tokenizer,
    plan: TypedRunnableModel<TypedModel>,
    input_count: usize,
    dims: usize,
}

impl TractModel {
    pub fn load(model_name: &str) -> Result<Self> {
        let files = model_manifest(model_name)?;
        let model_dir = cache_dir()?.join(model_name);
        let onnx_path = model_dir.join(files.onnx);
        let tokenizer_path = model_dir.join(files.tokenizer);
        download_to_cache(files.repo, files.onnx, &onnx_path)?;
        download_to_cache(files.repo, files.tokenizer, &tokenizer_path)?;

        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Load tokenizer: {}", e))?;
        let model = tract_onnx::onnx()
            .model_for_path(&onnx_path)
            .map_err(|e| anyhow::anyhow!("Load ONNX: {}", e))?;
        let input_count = model.inputs.len();
        let plan = model
            .into_optimized()
            .map_err(|e| anyhow::anyhow!("Optimize: {}", e))?
            .into_runnable()
            .map_err(|e| anyhow::anyhow!("Build tract runnable: {}", e))?;

        Ok(Self {
            tokenizer,
            plan,
            input_count,
            dims: files.dims,
        })
    }

    pub fn embed(&self, texts: &[String], batch_size: usize) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(batch_size.max(1)) {
            all.extend(self.embed_batch(chunk)?);
        }
        Ok(all)
    }

    fn embed_batch(&self, chunk: &[String]) -> Result<Vec<Vec<f32>>> {
        let encodings = chunk
            .iter()
            .map(|s| {
                self.tokenizer
                    .encode(s.as_str(), true)
                    .map_err(|e| anyhow::anyhow!("Tokenize: {}", e))
            })
            .collect::<Result<Vec<_>>>()?;

        let seq_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(1)
            .clamp(1, MAX_SEQ_LEN);
        let rows = encodings.len();

        let mut input_ids = vec![0i64; rows * seq_len];
        let mut attention_mask = vec![0i64; rows * seq_len];
        let mut token_type_ids = vec![0i64; rows * seq_len];
        for (i, enc) in encodings.iter().enumerate() {
            for (j, &id) in enc.get_ids().iter().take(seq_len).enumerate() {
                input_ids[i * seq_len + j] = id as i64;
                attention_mask[i * seq_len + j] = 1;
            }
            for (j, &t) in enc.get_type_ids().iter().take(seq_len).enumerate() {
                token_type_ids[i * seq_len + j] = t as i64;
            }
        }

        let shape = (rows, seq_len);
        let ids: Tensor = ndarray::Array2::from_shape_vec(shape, input_ids)
            .map_err(|e| anyhow::anyhow!("Input ids shape: {}", e))?
            .into();
        let mask: Tensor = ndarray::Array2::from_shape_vec(shape, attention_mask.clone())
            .map_err(|e| anyhow::anyhow!("Attention mask shape: {}", e))?
            .into();

        // MiniLM exports take (ids, mask, token types); MPNet exports take (ids, mask).
        let inputs = if self.input_count >= 3 {
            let types: Tensor = ndarray::Array2::from_shape_vec(shape, token_type_ids)
                .map_err(|e| anyhow::anyhow!("Token type shape: {}", e))?
                .into();
            tvec!(ids.into(), mask.into(), types.into())
        } else {
            tvec!(ids.into(), mask.into())
        };

        let result = self.plan.run(inputs)?;
        let output = result
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No output tensor"))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| anyhow::anyhow!("Output to array: {}", e))?;

        let out_shape = view.shape().to_vec();
        match out_shape.len() {
            2 => Ok((0..out_shape[0])
                .map(|i| {
                    normalize_l2(view.slice(ndarray::s![i, ..]).iter().copied().collect())
                })
                .collect()),
            3 => {
                let mut vecs = Vec::with_capacity(rows);
                for i in 0..rows {
                    let mut sum = vec![0f32; self.dims];
                    let mut count = 0f32;
                    for j in 0..out_shape[1].min(seq_len) {
                        if attention_mask[i * seq_len + j] == 0 {
                            continue;
                        }
                        for (k, &v) in view.slice(ndarray::s![i, j, ..]).iter().enumerate() {
                            if k < self.dims {
                                sum[k] += v;
                            }
                        }
                        count += 1.0;
                    }
                    if count > 0.0 {
                        sum.iter_mut().for_each(|x| *x /= count);
                    }
                    vecs.push(normalize_l2(sum));
                }
                Ok(vecs)
            }
            _ => bail!("Unexpected output shape: {:?}", out_shape),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_knows_supported_models() {
        assert_eq!(model_manifest("all-minilm-l6-v2").unwrap().dims, 384);
        assert_eq!(model_manifest("all-mpnet-base-v2").unwrap().dims, 768);
        assert!(model_manifest("bge-large-en-v1.5").is_err());
    }
}
