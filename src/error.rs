//! Pipeline error taxonomy.
//!
//! Helpers inside each stage return `anyhow::Result`; the stage boundary
//! maps failures into a [`PipelineError`], which carries the [`Stage`] the
//! CLI prints as `error [stage]: message`.

use std::fmt;
use std::path::PathBuf;

use drive_index_core::models::RecordKey;
use serde::Serialize;

/// Pipeline stage a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Config,
    Crawl,
    Extract,
    Embed,
    Cache,
    Write,
    Query,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Config => "config",
            Stage::Crawl => "crawl",
            Stage::Extract => "extract",
            Stage::Embed => "embed",
            Stage::Cache => "cache",
            Stage::Write => "write",
            Stage::Query => "query",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record the embedding stage could not embed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingFailure {
    #[serde(flatten)]
    pub key: RecordKey,
    pub reason: String,
}

/// Distinct, sorted document ids of a failure list.
pub fn failed_doc_ids(failures: &[EmbeddingFailure]) -> Vec<String> {
    let mut ids: Vec<String> = failures.iter().map(|f| f.key.doc_id.clone()).collect();
    ids.sort();
    ids.dedup();
    ids
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("document source unavailable: {reason}")]
    SourceUnavailable { stage: Stage, reason: String },

    #[error("cache snapshot '{snapshot}' is corrupt: {reason} (run `dix cache clear {snapshot}`)")]
    CorruptCache { snapshot: String, reason: String },

    #[error(
        "{count} record(s) failed to embed; pending in cache for documents: {ids}",
        count = .failures.len(),
        ids = failed_doc_ids(.failures).join(", ")
    )]
    EmbeddingFailures { failures: Vec<EmbeddingFailure> },

    #[error("index write failed at batch {batch}: {reason}")]
    IndexWriteFailure { batch: usize, reason: String },

    #[error("duplicate record {key}")]
    DuplicateRecord { key: RecordKey },

    #[error("record {key} has {actual} dims, expected {expected}")]
    DimensionMismatch {
        key: RecordKey,
        expected: usize,
        actual: usize,
    },

    #[error("cache I/O error on {}: {source}", .path.display())]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Config(String),

    /// Infrastructure failure (store, embedding provider) outside the
    /// specific cases above.
    #[error("{reason}")]
    Backend { stage: Stage, reason: String },

    #[error("interrupted")]
    Interrupted { stage: Stage },
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::SourceUnavailable { stage, .. } => *stage,
            PipelineError::CorruptCache { .. } | PipelineError::CacheIo { .. } => Stage::Cache,
            PipelineError::EmbeddingFailures { .. } => Stage::Embed,
            PipelineError::IndexWriteFailure { .. }
            | PipelineError::DuplicateRecord { .. }
            | PipelineError::DimensionMismatch { .. } => Stage::Write,
            PipelineError::Config(_) => Stage::Config,
            PipelineError::Backend { stage, .. } => *stage,
            PipelineError::Interrupted { stage } => *stage,
        }
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Interrupted { .. } => 130,
            PipelineError::Config(_) => 2,
            _ => 1,
        }
    }

    /// Wrap an arbitrary error as a backend failure of `stage`.
    pub fn backend(stage: Stage, err: impl fmt::Display) -> Self {
        PipelineError::Backend {
            stage,
            reason: format!("{:#}", err),
        }
    }
}

/// Result alias for stage boundaries.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn key(doc: &str, i: i64) -> RecordKey {
        RecordKey {
            doc_id: doc.into(),
            chunk_index: i,
        }
    }

    #[test]
    fn test_stage_mapping() {
        let err = PipelineError::IndexWriteFailure {
            batch: 3,
            reason: "disk full".into(),
        };
        assert_eq!(err.stage(), Stage::Write);
        assert_eq!(err.to_string(), "index write failed at batch 3: disk full");

        let err = PipelineError::CorruptCache {
            snapshot: "embedded".into(),
            reason: "checksum mismatch".into(),
        };
        assert_eq!(err.stage(), Stage::Cache);
        assert!(err.to_string().contains("dix cache clear embedded"));
    }

    #[test]
    fn test_embedding_failures_lists_doc_ids_once() {
        let err = PipelineError::EmbeddingFailures {
            failures: vec![
                EmbeddingFailure {
                    key: key("b", 0),
                    reason: "timeout".into(),
                },
                EmbeddingFailure {
                    key: key("a", 1),
                    reason: "timeout".into(),
                },
                EmbeddingFailure {
                    key: key("b", 2),
                    reason: "timeout".into(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "3 record(s) failed to embed; pending in cache for documents: a, b"
        );
        assert_eq!(err.stage(), Stage::Embed);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(PipelineError::Config("bad".into()).exit_code(), 2);
        assert_eq!(
            PipelineError::Interrupted {
                stage: Stage::Extract
            }
            .exit_code(),
            130
        );
        assert_eq!(
            PipelineError::backend(Stage::Query, anyhow::anyhow!("boom")).exit_code(),
            1
        );
    }
}
