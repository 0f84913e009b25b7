//! Backend selection for `[store]`.

use anyhow::{bail, Result};
use std::sync::Arc;

use docindex_core::store::memory::InMemoryStore;
use docindex_core::store::VectorStore;

use crate::config::Config;
use crate::embedding::resolve_local_model;
use crate::myscale::MyScaleStore;
use crate::sqlite_store::SqliteStore;

/// Open the configured vector store.
///
/// `dims` is the embedding dimensionality, needed by backends that fix the
/// vector length in their schema.
pub async fn open_store(config: &Config, dims: usize) -> Result<Arc<dyn VectorStore>> {
    match config.store.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        "sqlite" => {
            let sqlite = config
                .store
                .sqlite
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[store.sqlite] section missing"))?;
            Ok(Arc::new(SqliteStore::open(&sqlite.path).await?))
        }
        "myscale" => {
            let myscale = config
                .store
                .myscale
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[store.myscale] section missing"))?;
            Ok(Arc::new(MyScaleStore::new(myscale, dims)?))
        }
        other => bail!("Unknown store backend: {}", other),
    }
}

/// Embedding width implied by `[embedding]`, or 0 when it is unknown.
pub fn configured_dims(config: &Config) -> usize {
    match config.embedding.provider.as_str() {
        "local" => resolve_local_model(&config.embedding).1,
        _ => config.embedding.dims.unwrap_or(0),
    }
}

/// Human-readable location of the configured store, for command output.
pub fn describe(config: &Config) -> String {
    match config.store.backend.as_str() {
        "sqlite" => config
            .store
            .sqlite
            .as_ref()
            .map(|s| format!("sqlite {}", s.path.display()))
            .unwrap_or_else(|| "sqlite".to_string()),
        "myscale" => config
            .store
            .myscale
            .as_ref()
            .map(|m| format!("myscale {}/{}.{}", m.host, m.database, m.table))
            .unwrap_or_else(|| "myscale".to_string()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn minimal_config_opens_memory_store() {
        let store = open_store(&Config::minimal(), 0).await.unwrap();
        assert_eq!(store.name(), "memory");
        assert_eq!(describe(&Config::minimal()), "memory");
    }

    #[test]
    fn dims_follow_embedding_config() {
        let mut config = Config::minimal();
        assert_eq!(configured_dims(&config), 0);
        config.embedding.provider = "local".to_string();
        assert_eq!(configured_dims(&config), 384);
        config.embedding.provider = "hash".to_string();
        config.embedding.dims = Some(64);
        assert_eq!(configured_dims(&config), 64);
    }
}
