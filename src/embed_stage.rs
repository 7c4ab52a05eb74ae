//! Embedding stage: record shells → index records.
//!
//! Shells are embedded in batches on the worker pool. A multi-item batch
//! the provider rejects gets one bounded retry, item by item, so a single
//! bad input only fails itself. A rejected single-item batch is not sent
//! again. Failed shells are kept as `pending` in the `embedded` snapshot
//! and are the only thing a later run embeds.

use std::sync::Arc;

use drive_index_core::embedding::{embedding_input, normalize_l2, EmbeddingProvider};
use drive_index_core::models::{IndexRecord, RecordProperties};

use crate::cache::{CacheStage, EmbeddedSnapshot, SnapshotCache};
use crate::error::{EmbeddingFailure, PipelineError, PipelineResult};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::worker::WorkerPool;

/// Result of embedding a set of shells.
#[derive(Debug, Default)]
pub struct EmbedOutcome {
    pub records: Vec<IndexRecord>,
    pub pending: Vec<RecordProperties>,
    pub failures: Vec<EmbeddingFailure>,
}

type ItemResult = (RecordProperties, Result<Vec<f32>, String>);

/// Validate and normalize one provider vector.
fn finish_vector(mut vector: Vec<f32>, dims: usize) -> Result<Vec<f32>, String> {
    if vector.len() != dims {
        return Err(format!("expected {} dims, got {}", dims, vector.len()));
    }
    normalize_l2(&mut vector);
    Ok(vector)
}

async fn embed_isolated(provider: Arc<dyn EmbeddingProvider>, batch: Vec<RecordProperties>) -> Vec<ItemResult> {
    let dims = provider.dims();
    let texts: Vec<String> = batch.iter().map(embedding_input).collect();

    let reason = match provider.embed_batch(&texts).await {
        Ok(vectors) if vectors.len() == batch.len() => {
            return batch
                .into_iter()
                .zip(vectors)
                .map(|(shell, v)| (shell, finish_vector(v, dims)))
                .collect();
        }
        Ok(vectors) => format!(
            "provider returned {} vectors for {} inputs",
            vectors.len(),
            batch.len()
        ),
        Err(e) => format!("{:#}", e),
    };

    if batch.len() == 1 {
        return batch.into_iter().map(|shell| (shell, Err(reason.clone()))).collect();
    }
    tracing::warn!(size = batch.len(), error = %reason, "embedding batch failed, retrying item by item");

    let mut out = Vec::with_capacity(batch.len());
    for (shell, text) in batch.into_iter().zip(texts) {
        let result = match provider.embed_batch(std::slice::from_ref(&text)).await {
            Ok(mut vectors) if vectors.len() == 1 => finish_vector(vectors.remove(0), dims),
            Ok(vectors) => Err(format!("provider returned {} vectors for 1 input", vectors.len())),
            Err(e) => Err(format!("{:#}", e)),
        };
        out.push((shell, result));
    }
    out
}

/// Embed every shell, collecting failures instead of stopping at them.
pub async fn embed_records(
    provider: Arc<dyn EmbeddingProvider>,
    shells: Vec<RecordProperties>,
    batch_size: usize,
    pool: &WorkerPool,
    progress: &dyn ProgressReporter,
) -> EmbedOutcome {
    let total = shells.len() as u64;
    let batch_size = batch_size.max(1);
    let batches: Vec<Vec<RecordProperties>> = shells.chunks(batch_size).map(|c| c.to_vec()).collect();
    let inputs = batches.clone();

    let results = pool
        .run(
            inputs,
            move |batch| {
                let provider = provider.clone();
                async move { Ok(embed_isolated(provider, batch).await) }
            },
            |done| {
                let n = ((done * batch_size) as u64).min(total);
                progress.report(ProgressEvent::Embed { n, total });
            },
        )
        .await;

    let mut outcome = EmbedOutcome::default();
    for (batch, result) in batches.into_iter().zip(results) {
        let items: Vec<ItemResult> = match result {
            Ok(items) => items,
            // The whole task failed (timeout): every item in it failed.
            Err(e) => {
                let reason = format!("{:#}", e);
                batch.into_iter().map(|s| (s, Err(reason.clone()))).collect()
            }
        };
        for (shell, result) in items {
            match result {
                Ok(vector) => outcome.records.push(IndexRecord {
                    properties: shell,
                    vector,
                }),
                Err(reason) => {
                    tracing::warn!(record = %shell.key(), %reason, "embedding failed");
                    outcome.failures.push(EmbeddingFailure {
                        key: shell.key(),
                        reason,
                    });
                    outcome.pending.push(shell);
                }
            }
        }
    }
    outcome
}

/// Source of shells for [`run_embed_stage`] when no usable snapshot exists.
pub enum Shells<'a> {
    /// Shells are already in hand.
    Ready(Vec<RecordProperties>),
    /// Shells must be produced (crawl + extract, or the `extracted` snapshot).
    Deferred(std::pin::Pin<Box<dyn std::future::Future<Output = PipelineResult<Vec<RecordProperties>>> + Send + 'a>>),
}

/// Produce the full set of embedded records, resuming from the `embedded`
/// snapshot when one exists for the same model.
///
/// The snapshot is always saved, including any still-pending shells. If
/// anything failed, the successful records are returned alongside a
/// [`PipelineError::EmbeddingFailures`] so the caller can still index them.
pub async fn run_embed_stage(
    cache: &SnapshotCache,
    provider: Arc<dyn EmbeddingProvider>,
    shells: Shells<'_>,
    batch_size: usize,
    pool: &WorkerPool,
    progress: &dyn ProgressReporter,
) -> PipelineResult<(Vec<IndexRecord>, Option<PipelineError>)> {
    let model = provider.model_name().to_string();
    let dims = provider.dims();

    let (mut records, to_embed) = match cache.load::<EmbeddedSnapshot>(CacheStage::Embedded)? {
        Some(snap) if snap.model == model && snap.dims == dims => {
            progress.report(ProgressEvent::CacheHit {
                stage: CacheStage::Embedded.key().to_string(),
                records: snap.records.len() as u64,
            });
            if snap.pending.is_empty() {
                return Ok((snap.records, None));
            }
            tracing::info!(pending = snap.pending.len(), "resuming pending embeddings");
            (snap.records, snap.pending)
        }
        other => {
            if let Some(snap) = other {
                tracing::warn!(
                    cached_model = %snap.model,
                    cached_dims = snap.dims,
                    %model,
                    dims,
                    "embedded snapshot is for a different model, re-embedding"
                );
            }
            let shells = match shells {
                Shells::Ready(shells) => shells,
                Shells::Deferred(fut) => fut.await?,
            };
            (Vec::new(), shells)
        }
    };

    let outcome = embed_records(provider, to_embed, batch_size, pool, progress).await;
    records.extend(outcome.records);

    cache.save(
        CacheStage::Embedded,
        &EmbeddedSnapshot {
            model,
            dims,
            records: records.clone(),
            pending: outcome.pending,
        },
    )?;

    tracing::info!(records = records.len(), failed = outcome.failures.len(), "embedding complete");
    let failure = (!outcome.failures.is_empty()).then(|| PipelineError::EmbeddingFailures {
        failures: outcome.failures,
    });
    Ok((records, failure))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use drive_index_core::models::{Entity, PermissionSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Flaky {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for Flaky {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.iter().any(|t| t.contains("poison")) {
                bail!("invalid input");
            }
            Ok(texts.iter().map(|_| vec![3.0, 4.0]).collect())
        }
    }

    fn shell(id: &str, chunk: &str) -> RecordProperties {
        RecordProperties {
            doc_id: id.into(),
            chunk_index: 0,
            title: id.into(),
            chunk: chunk.into(),
            url: String::new(),
            app: "google".into(),
            entity: Entity::Docs,
            mime_type: String::new(),
            owner: None,
            owner_email: None,
            owner_photo: None,
            permissions: PermissionSet::new(),
        }
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(2, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_bad_item_is_isolated() {
        let provider = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
        });
        let shells = vec![shell("a", "fine"), shell("b", "poison"), shell("c", "fine")];
        let outcome = embed_records(provider, shells, 3, &pool(), &NoProgress).await;

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].key.doc_id, "b");
        assert_eq!(outcome.pending[0].doc_id, "b");
        let v = &outcome.records[0].vector;
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_resume_embeds_only_pending() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(dir.path());
        let provider = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
        });

        let shells = vec![shell("a", "fine"), shell("b", "poison")];
        let (records, failure) = run_embed_stage(&cache, provider.clone(), Shells::Ready(shells), 10, &pool(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(matches!(failure, Some(PipelineError::EmbeddingFailures { .. })));

        let snap: EmbeddedSnapshot = cache.load(CacheStage::Embedded).unwrap().unwrap();
        assert_eq!(snap.pending.len(), 1);

        // The next run sees only the pending shell; deferred shells are never produced.
        let calls_before = provider.calls.load(Ordering::SeqCst);
        let (records, failure) = run_embed_stage(
            &cache,
            provider.clone(),
            Shells::Deferred(Box::pin(async {
                Err::<Vec<RecordProperties>, _>(PipelineError::Config(
                    "shells should come from the snapshot".into(),
                ))
            })),
            10,
            &pool(),
            &NoProgress,
        )
        .await
        .unwrap();
        assert_eq!(records.len(), 1);
        assert!(failure.is_some());
        // A single-item batch is sent once.
        assert_eq!(provider.calls.load(Ordering::SeqCst) - calls_before, 1);
    }

    #[tokio::test]
    async fn test_complete_snapshot_skips_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(dir.path());
        let provider = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
        });
        run_embed_stage(&cache, provider.clone(), Shells::Ready(vec![shell("a", "x")]), 10, &pool(), &NoProgress)
            .await
            .unwrap();
        let calls = provider.calls.load(Ordering::SeqCst);

        let (records, failure) = run_embed_stage(&cache, provider.clone(), Shells::Ready(vec![]), 10, &pool(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(failure.is_none());
        assert_eq!(provider.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_single_item_batches_are_not_retried() {
        let provider = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
        });
        let shells = vec![shell("a", "fine"), shell("b", "poison")];
        let outcome = embed_records(provider.clone(), shells, 1, &pool(), &NoProgress).await;

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.failures[0].key.doc_id, "b");
        assert!(outcome.failures[0].reason.contains("invalid input"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_wrong_dims_are_failures() {
        struct Short;
        #[async_trait]
        impl EmbeddingProvider for Short {
            fn model_name(&self) -> &str {
                "short"
            }
            fn dims(&self) -> usize {
                3
            }
            async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
                Ok(texts.iter().map(|_| vec![1.0]).collect())
            }
        }
        let outcome = embed_records(Arc::new(Short), vec![shell("a", "x")], 4, &pool(), &NoProgress).await;
        assert!(outcome.records.is_empty());
        assert!(outcome.failures[0].reason.contains("expected 3 dims"));
    }
}
