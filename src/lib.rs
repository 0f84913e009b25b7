//! # docindex
//!
//! Index a directory of markdown documents into a vector store and answer
//! natural-language questions over it.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────┐   ┌─────────┐   ┌──────────┐   ┌──────────────┐
//! │ enumerate │──▶│  loader  │──▶│  split  │──▶│  embed   │──▶│ vector store │
//! │  (walk)   │   │ (clean)  │   │ (nodes) │   │ (batch)  │   │ SQLite/MyScale│
//! └───────────┘   └──────────┘   └─────────┘   └──────────┘   └──────┬───────┘
//!                                                                    │
//!                         query ──▶ embed ──▶ retrieve ──▶ synthesize ◀┘
//! ```
//!
//! Indexing runs either sequentially ([`pipeline`]) or on a pool of
//! embedding workers ([`batch`]). Both write through the same index writer,
//! so the store is the only state shared with the query path.
//!
//! ## Quick Start
//!
//! ```bash
//! docindex init
//! docindex index --progress
//! docindex query "How do I create a vector index?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`enumerate`] | File discovery |
//! | [`loader`] | Markdown loading and cleanup |
//! | [`embedding`] | Embedding providers |
//! | [`embed_nodes`] | Batch embedding stage |
//! | [`store`] | Store backend selection |
//! | [`sqlite_store`] | SQLite + FTS5 backend |
//! | [`myscale`] | MyScale backend over ClickHouse HTTP |
//! | [`synthesize`] | Compact-and-refine answer synthesis |
//! | [`pipeline`] | Sequential indexing |
//! | [`batch`] | Distributed batch indexing |
//! | [`query`] | The query command |

pub mod batch;
pub mod config;
pub mod db;
pub mod embed_nodes;
pub mod embedding;
pub mod enumerate;
pub mod http;
pub mod loader;
pub mod migrate;
pub mod myscale;
pub mod pipeline;
pub mod progress;
pub mod query;
pub mod sqlite_store;
pub mod stats;
pub mod store;
pub mod synthesize;

pub use docindex_core::{models, retrieve, split};
