//! # drive-index
//!
//! Permission-aware indexing and hybrid retrieval over a Drive-style
//! document source.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │  Crawl   │──▶│ Extract  │──▶│  Embed   │──▶│  Write   │──▶ SQLite (FTS5 + vectors)
//! │ Drive v3 │   │ Docs v1  │   │ provider │   │  batches │          ▲
//! └──────────┘   └──────────┘   └──────────┘   └──────────┘          │
//!        └────────── snapshot cache (extracted / embedded) ─┘   query engine
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export DRIVE_ACCESS_TOKEN=...
//! dix index                                  # crawl, embed, write
//! dix search "budget" --as alice@example.com # permission-filtered search
//! dix counts "budget" --as alice@example.com # hits by app / entity
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Stage-tagged pipeline errors |
//! | [`drive`] | Drive/Docs REST client and the `DocumentSource` trait |
//! | [`render`] | Docs document → plain text |
//! | [`crawl`] | Paginated metadata crawl |
//! | [`extract`] | Fetch, render, chunk, tag with permissions |
//! | [`embedding`] | Embedding providers |
//! | [`embed_stage`] | Batched embedding with failure isolation and resume |
//! | [`cache`] | Checksummed stage snapshots |
//! | [`writer`] | Batched full replace of the index |
//! | [`sqlite_store`] | SQLite `HybridStore` |
//! | [`pipeline`] | `index` and `export-text` orchestration |
//! | [`search`] | `search` and `counts` commands |

pub mod cache;
pub mod config;
pub mod crawl;
pub mod db;
pub mod drive;
pub mod embed_stage;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod logging;
pub mod pipeline;
pub mod progress;
pub mod render;
pub mod search;
pub mod sqlite_store;
pub mod worker;
pub mod writer;
