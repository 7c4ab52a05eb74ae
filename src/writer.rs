//! Index writer: full replace of the store's generation in batches.

use std::sync::Arc;

use drive_index_core::models::IndexRecord;
use drive_index_core::records::first_duplicate;
use drive_index_core::store::{CollectionSchema, HybridStore};

use crate::error::{PipelineError, PipelineResult, Stage};
use crate::progress::{ProgressEvent, ProgressReporter};

pub struct IndexWriter<S: HybridStore> {
    store: Arc<S>,
    batch_size: usize,
    dims: usize,
}

impl<S: HybridStore> IndexWriter<S> {
    pub fn new(store: Arc<S>, batch_size: usize, dims: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            dims,
        }
    }

    /// Replace the whole collection with `records`.
    ///
    /// Records are validated before anything is dropped, so a duplicate key
    /// or a wrong-sized vector leaves the previous generation in place.
    /// Returns the number of records written. Holds the store's generation
    /// lock throughout, so concurrent calls on one store run one at a time.
    pub async fn replace_all(
        &self,
        records: &[IndexRecord],
        progress: &dyn ProgressReporter,
    ) -> PipelineResult<usize> {
        if let Some(key) = first_duplicate(records.iter().map(|r| &r.properties)) {
            return Err(PipelineError::DuplicateRecord { key });
        }
        if let Some(bad) = records.iter().find(|r| r.vector.len() != self.dims) {
            return Err(PipelineError::DimensionMismatch {
                key: bad.key(),
                expected: self.dims,
                actual: bad.vector.len(),
            });
        }

        let _generation = self
            .store
            .lock_generation()
            .await
            .map_err(|e| PipelineError::backend(Stage::Write, e))?;

        self.store
            .recreate_collection(&CollectionSchema::drive_files(self.dims))
            .await
            .map_err(|e| PipelineError::backend(Stage::Write, e))?;

        let total = records.len() as u64;
        let mut written = 0usize;
        for (i, batch) in records.chunks(self.batch_size).enumerate() {
            self.store
                .insert_batch(batch)
                .await
                .map_err(|e| PipelineError::IndexWriteFailure {
                    batch: i + 1,
                    reason: format!("{:#}", e),
                })?;
            written += batch.len();
            progress.report(ProgressEvent::Write {
                n: written as u64,
                total,
            });
        }

        tracing::info!(records = written, dims = self.dims, "index replaced");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use drive_index_core::models::{Entity, PermissionSet, RecordProperties};
    use drive_index_core::store::memory::InMemoryStore;
    use drive_index_core::store::{GenerationGuard, HybridQuery, QueryHit};
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    fn record(doc_id: &str, chunk_index: i64, dims: usize) -> IndexRecord {
        IndexRecord {
            properties: RecordProperties {
                doc_id: doc_id.into(),
                chunk_index,
                title: doc_id.into(),
                chunk: String::new(),
                url: String::new(),
                app: "google".into(),
                entity: Entity::Docs,
                mime_type: String::new(),
                owner: None,
                owner_email: None,
                owner_photo: None,
                permissions: PermissionSet::new(),
            },
            vector: vec![0.5; dims],
        }
    }

    struct Recording {
        progress: StdMutex<Vec<ProgressEvent>>,
    }

    impl ProgressReporter for Recording {
        fn report(&self, event: ProgressEvent) {
            self.progress.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn test_writes_in_batches_with_cumulative_progress() {
        let store = Arc::new(InMemoryStore::default());
        let writer = IndexWriter::new(store.clone(), 30, 4);
        let records: Vec<IndexRecord> = (0..70).map(|i| record("d", i, 4)).collect();
        let progress = Recording {
            progress: StdMutex::new(Vec::new()),
        };

        assert_eq!(writer.replace_all(&records, &progress).await.unwrap(), 70);
        assert_eq!(store.count().await.unwrap(), 70);
        let events = progress.progress.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                ProgressEvent::Write { n: 30, total: 70 },
                ProgressEvent::Write { n: 60, total: 70 },
                ProgressEvent::Write { n: 70, total: 70 },
            ]
        );
    }

    #[tokio::test]
    async fn test_second_run_replaces_first() {
        let store = Arc::new(InMemoryStore::default());
        let writer = IndexWriter::new(store.clone(), 30, 2);
        writer
            .replace_all(&[record("a", 0, 2), record("b", 0, 2)], &NoProgress)
            .await
            .unwrap();
        writer.replace_all(&[record("c", 0, 2)], &NoProgress).await.unwrap();
        let keys: Vec<String> = store
            .records()
            .unwrap()
            .iter()
            .map(|r| r.properties.doc_id.clone())
            .collect();
        assert_eq!(keys, vec!["c"]);
    }

    #[tokio::test]
    async fn test_validation_keeps_previous_generation() {
        let store = Arc::new(InMemoryStore::default());
        let writer = IndexWriter::new(store.clone(), 30, 2);
        writer.replace_all(&[record("a", 0, 2)], &NoProgress).await.unwrap();

        let err = writer
            .replace_all(&[record("b", 0, 2), record("b", 0, 2)], &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateRecord { .. }));

        let err = writer
            .replace_all(&[record("b", 0, 3)], &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DimensionMismatch {
                expected: 2,
                actual: 3,
                ..
            }
        ));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    struct FailSecondBatch {
        inner: InMemoryStore,
        batches: StdMutex<usize>,
    }

    #[async_trait]
    impl HybridStore for FailSecondBatch {
        async fn lock_generation(&self) -> Result<GenerationGuard> {
            self.inner.lock_generation().await
        }
        async fn recreate_collection(&self, schema: &CollectionSchema) -> Result<()> {
            self.inner.recreate_collection(schema).await
        }
        async fn insert_batch(&self, records: &[IndexRecord]) -> Result<()> {
            let n = {
                let mut b = self.batches.lock().unwrap();
                *b += 1;
                *b
            };
            if n == 2 {
                bail!("connection reset");
            }
            self.inner.insert_batch(records).await
        }
        async fn hybrid_query(&self, query: &HybridQuery) -> Result<Vec<QueryHit>> {
            self.inner.hybrid_query(query).await
        }
        async fn count(&self) -> Result<usize> {
            self.inner.count().await
        }
    }

    #[tokio::test]
    async fn test_failing_batch_is_reported_by_index() {
        let store = Arc::new(FailSecondBatch {
            inner: InMemoryStore::default(),
            batches: StdMutex::new(0),
        });
        let writer = IndexWriter::new(store, 2, 2);
        let records: Vec<IndexRecord> = (0..5).map(|i| record("d", i, 2)).collect();
        let err = writer.replace_all(&records, &NoProgress).await.unwrap_err();
        match err {
            PipelineError::IndexWriteFailure { batch, reason } => {
                assert_eq!(batch, 2);
                assert!(reason.contains("connection reset"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Yields to the scheduler before every write, so concurrent writers
    /// interleave unless the generation lock keeps them apart.
    struct Yielding(InMemoryStore);

    #[async_trait]
    impl HybridStore for Yielding {
        async fn lock_generation(&self) -> Result<GenerationGuard> {
            self.0.lock_generation().await
        }
        async fn recreate_collection(&self, schema: &CollectionSchema) -> Result<()> {
            tokio::task::yield_now().await;
            self.0.recreate_collection(schema).await
        }
        async fn insert_batch(&self, records: &[IndexRecord]) -> Result<()> {
            tokio::task::yield_now().await;
            self.0.insert_batch(records).await
        }
        async fn hybrid_query(&self, query: &HybridQuery) -> Result<Vec<QueryHit>> {
            self.0.hybrid_query(query).await
        }
        async fn count(&self) -> Result<usize> {
            self.0.count().await
        }
    }

    #[tokio::test]
    async fn test_concurrent_writers_leave_one_generation() {
        let store = Arc::new(Yielding(InMemoryStore::default()));
        let first = IndexWriter::new(store.clone(), 1, 2);
        let second = IndexWriter::new(store.clone(), 1, 2);
        let a: Vec<IndexRecord> = (0..4).map(|i| record("a", i, 2)).collect();
        let b: Vec<IndexRecord> = (0..3).map(|i| record("b", i, 2)).collect();

        let (ra, rb) = tokio::join!(
            first.replace_all(&a, &NoProgress),
            second.replace_all(&b, &NoProgress)
        );
        assert_eq!(ra.unwrap(), 4);
        assert_eq!(rb.unwrap(), 3);

        let stored = store.0.records().unwrap();
        let docs: HashSet<&str> = stored.iter().map(|r| r.properties.doc_id.as_str()).collect();
        assert_eq!(docs.len(), 1, "generations mixed: {:?}", docs);
        let expected = if docs.contains("a") { a.len() } else { b.len() };
        assert_eq!(stored.len(), expected);
    }
}
