//! # drive-index core
//!
//! Shared, I/O-free logic for drive-index: document and record models,
//! permission normalization, MIME→entity lookup, chunking, record assembly,
//! the hybrid store abstraction, score fusion, and the query engine.
//!
//! This crate contains no tokio runtime, sqlx, HTTP client, or filesystem
//! access. The application crate supplies the document source, embedding
//! providers, snapshot cache, and the SQLite-backed store.

pub mod chunk;
pub mod embedding;
pub mod mime;
pub mod models;
pub mod permissions;
pub mod records;
pub mod search;
pub mod store;
