//! In-memory [`HybridStore`] implementation for tests and small indexes.
//!
//! Records live in a `Vec` behind `std::sync::RwLock`. Keyword scoring
//! counts query-term occurrences in `title` and `chunk`; vector scoring is
//! brute-force cosine similarity. Filters run before either leg.

use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::embedding::cosine_similarity;
use crate::models::{IndexRecord, RecordKey};
use crate::search::{fuse, page, Candidate};

use super::{CollectionSchema, GenerationGuard, HybridQuery, HybridStore, QueryHit};

#[derive(Default)]
struct Collection {
    schema: Option<CollectionSchema>,
    records: Vec<IndexRecord>,
}

/// In-memory hybrid store.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Collection>,
    generation: Arc<Mutex<()>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored record, in insertion order.
    pub fn records(&self) -> Result<Vec<IndexRecord>> {
        let guard = self.inner.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(guard.records.clone())
    }
}

fn keyword_score(terms: &[String], title: &str, chunk: &str) -> f64 {
    let title = title.to_lowercase();
    let chunk = chunk.to_lowercase();
    terms
        .iter()
        .map(|t| (title.matches(t.as_str()).count() + chunk.matches(t.as_str()).count()) as f64)
        .sum()
}

fn query_terms(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|t| {
            t.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

#[async_trait]
impl HybridStore for InMemoryStore {
    async fn lock_generation(&self) -> Result<GenerationGuard> {
        Ok(GenerationGuard::new(self.generation.clone().lock_owned().await))
    }

    async fn recreate_collection(&self, schema: &CollectionSchema) -> Result<()> {
        let mut guard = self.inner.write().map_err(|_| anyhow!("store lock poisoned"))?;
        guard.schema = Some(schema.clone());
        guard.records.clear();
        Ok(())
    }

    async fn insert_batch(&self, records: &[IndexRecord]) -> Result<()> {
        let mut guard = self.inner.write().map_err(|_| anyhow!("store lock poisoned"))?;
        let dims = match &guard.schema {
            Some(schema) => schema.dims,
            None => bail!("collection does not exist"),
        };
        for r in records {
            if r.vector.len() != dims {
                bail!(
                    "record {} has {} dims, collection expects {}",
                    r.key(),
                    r.vector.len(),
                    dims
                );
            }
            if guard.records.iter().any(|existing| existing.key() == r.key()) {
                bail!("record {} already exists", r.key());
            }
        }
        guard.records.extend_from_slice(records);
        Ok(())
    }

    async fn hybrid_query(&self, query: &HybridQuery) -> Result<Vec<QueryHit>> {
        let guard = self.inner.read().map_err(|_| anyhow!("store lock poisoned"))?;
        let visible: Vec<&IndexRecord> = guard
            .records
            .iter()
            .filter(|r| query.filter.matches(&r.properties))
            .collect();

        let terms = query_terms(&query.text);
        let keyword: Vec<Candidate<RecordKey>> = visible
            .iter()
            .filter_map(|r| {
                let score = keyword_score(&terms, &r.properties.title, &r.properties.chunk);
                (score > 0.0).then(|| Candidate {
                    key: r.key(),
                    raw_score: score,
                })
            })
            .collect();
        let vector: Vec<Candidate<RecordKey>> = visible
            .iter()
            .map(|r| Candidate {
                key: r.key(),
                raw_score: cosine_similarity(&query.vector, &r.vector) as f64,
            })
            .collect();

        let fused = page(
            fuse(&keyword, &vector, query.alpha, query.fusion),
            query.offset,
            query.limit,
        );

        let hits = fused
            .into_iter()
            .filter_map(|f| {
                let record = visible.iter().find(|r| r.key() == f.key)?;
                let explain = query.explain.then_some(f.explain);
                Some(QueryHit::from_properties(
                    &record.properties,
                    query.fields,
                    f.score,
                    explain,
                ))
            })
            .collect();
        Ok(hits)
    }

    async fn count(&self) -> Result<usize> {
        let guard = self.inner.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(guard.records.len())
    }
}
