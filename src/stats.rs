//! Store statistics for `docindex stats`.

use anyhow::Result;

use crate::config::Config;
use crate::store::{self, open_store};

pub async fn run_stats(config: &Config) -> Result<()> {
    let vector_store = open_store(config, store::configured_dims(config)).await?;
    // Counting must not create a remote table.
    if vector_store.name() != "myscale" {
        vector_store.ensure_schema().await?;
    }
    let stats = vector_store.stats().await?;

    println!("docindex stats");
    println!("==============");
    println!();
    println!("  Store:       {}", store::describe(config));
    if let Some(sqlite) = &config.store.sqlite {
        if config.store.backend == "sqlite" {
            let size = std::fs::metadata(&sqlite.path).map(|m| m.len()).unwrap_or(0);
            println!("  Size:        {}", format_bytes(size));
        }
    }
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  Nodes:       {}", stats.nodes);
    println!(
        "  Per doc:     {}",
        if stats.documents > 0 {
            format!("{:.1}", stats.nodes as f64 / stats.documents as f64)
        } else {
            "-".to_string()
        }
    );
    println!();
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
