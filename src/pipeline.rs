//! Pipeline orchestration.
//!
//! `dix index` runs crawl → extract → embed → write. Each stage output is
//! persisted to the snapshot cache once the stage completes, so a rerun
//! after a failure or Ctrl-C resumes from the last finished stage:
//!
//! - `embedded` snapshot present and complete: nothing is crawled or embedded.
//! - `embedded` snapshot with pending shells: only those are embedded.
//! - `extracted` snapshot present: the crawl and document fetches are skipped.
//!
//! `dix export-text` crawls documents only and caches their full text.

use std::sync::Arc;
use std::time::Duration;

use drive_index_core::embedding::EmbeddingProvider;
use drive_index_core::models::RecordProperties;
use drive_index_core::store::HybridStore;

use crate::cache::{CacheStage, SnapshotCache};
use crate::config::Config;
use crate::crawl::crawl;
use crate::drive::DocumentSource;
use crate::embed_stage::{run_embed_stage, Shells};
use crate::error::PipelineResult;
use crate::extract::{extract_full_texts, extract_records, FullText};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::worker::WorkerPool;
use crate::writer::IndexWriter;

/// Outcome of a successful `dix index` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSummary {
    pub records_written: usize,
    pub model: String,
    pub dims: usize,
}

pub fn worker_pool(config: &Config) -> WorkerPool {
    WorkerPool::new(
        config.pipeline.concurrency,
        Duration::from_secs(config.pipeline.task_timeout_secs),
    )
}

/// Record shells from the `extracted` snapshot, or crawl and extract them.
async fn extracted_shells(
    config: &Config,
    source: Arc<dyn DocumentSource>,
    cache: &SnapshotCache,
    pool: &WorkerPool,
    progress: &dyn ProgressReporter,
) -> PipelineResult<Vec<RecordProperties>> {
    if let Some(shells) = cache.load::<Vec<RecordProperties>>(CacheStage::Extracted)? {
        progress.report(ProgressEvent::CacheHit {
            stage: CacheStage::Extracted.key().to_string(),
            records: shells.len() as u64,
        });
        tracing::info!(records = shells.len(), "using extracted snapshot");
        return Ok(shells);
    }

    let files = crawl(
        source.as_ref(),
        config.source.page_size,
        config.source.only_documents,
        progress,
    )
    .await?;
    tracing::info!(files = files.len(), "crawl complete");

    let shells = extract_records(
        source,
        &files,
        &config.source.identity,
        config.chunking.max_tokens,
        pool,
        progress,
    )
    .await?;
    cache.save(CacheStage::Extracted, &shells)?;
    Ok(shells)
}

/// Run the indexing pipeline end to end.
///
/// With `fresh`, every snapshot is cleared first. Records that failed to
/// embed stay pending in the `embedded` snapshot; everything else is still
/// written, and the run then fails with
/// [`PipelineError::EmbeddingFailures`](crate::error::PipelineError::EmbeddingFailures).
pub async fn run_index<S: HybridStore>(
    config: &Config,
    source: Arc<dyn DocumentSource>,
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<S>,
    cache: &SnapshotCache,
    progress: &dyn ProgressReporter,
    fresh: bool,
) -> PipelineResult<IndexSummary> {
    if fresh {
        let removed = cache.clear(None)?;
        tracing::info!(removed = removed.len(), "cleared snapshot cache");
    }

    let pool = worker_pool(config);
    let dims = provider.dims();
    let model = provider.model_name().to_string();

    let shells = Shells::Deferred(Box::pin(extracted_shells(
        config,
        source,
        cache,
        &pool,
        progress,
    )));
    let (records, failure) = run_embed_stage(
        cache,
        provider,
        shells,
        config.embedding.batch_size,
        &pool,
        progress,
    )
    .await?;

    let writer = IndexWriter::new(store, config.index.batch_size, dims);
    let records_written = writer.replace_all(&records, progress).await?;

    if let Some(failure) = failure {
        return Err(failure);
    }
    Ok(IndexSummary {
        records_written,
        model,
        dims,
    })
}

/// Full text of every Google Docs document, from the `full-text` snapshot
/// when present.
pub async fn run_export_text(
    config: &Config,
    source: Arc<dyn DocumentSource>,
    cache: &SnapshotCache,
    progress: &dyn ProgressReporter,
) -> PipelineResult<Vec<FullText>> {
    if let Some(texts) = cache.load::<Vec<FullText>>(CacheStage::FullText)? {
        progress.report(ProgressEvent::CacheHit {
            stage: CacheStage::FullText.key().to_string(),
            records: texts.len() as u64,
        });
        return Ok(texts);
    }

    let pool = worker_pool(config);
    let files = crawl(source.as_ref(), config.source.page_size, true, progress).await?;
    let texts = extract_full_texts(source, &files, &pool, progress).await?;
    cache.save(CacheStage::FullText, &texts)?;
    tracing::info!(documents = texts.len(), "full-text export complete");
    Ok(texts)
}
