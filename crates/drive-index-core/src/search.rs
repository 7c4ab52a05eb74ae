//! Hybrid retrieval: score fusion, the query engine, and faceted counts.
//!
//! Stores produce two candidate lists for a query (keyword and vector, both
//! already restricted by the query's [`Filter`]) and combine them with
//! [`fuse`]. The [`QueryEngine`] sits on top of a [`HybridStore`] handle and
//! an embedding provider and enforces the authorization rule: a request
//! without permissions returns nothing, never an unfiltered result.
//!
//! # Fusion
//!
//! - **Ranked** (default): reciprocal rank,
//!   `score = (1-α)/(60 + rank_kw) + α/(60 + rank_vec)`, ranks from 0.
//! - **RelativeScore**: min-max normalize each list to `[0, 1]`, then
//!   `score = (1-α) × keyword + α × vector`.
//!
//! A candidate missing from one list contributes nothing for that list.
//! `α < 0.5` lets keyword relevance dominate.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::embedding::{embed_one, EmbeddingProvider};
use crate::models::{Entity, PermissionSet};
use crate::store::{FieldSelection, Filter, FilterProperty, HybridQuery, HybridStore, QueryHit};

/// Default fusion weight; keyword signal dominates.
pub const DEFAULT_ALPHA: f64 = 0.25;
/// Rank offset used by reciprocal-rank fusion.
pub const RANK_CONSTANT: f64 = 60.0;
/// Result cap for [`QueryEngine::search_group_by_count`].
pub const DEFAULT_GROUP_LIMIT: usize = 500;
/// Hits at or below this score are not counted.
pub const DEFAULT_MIN_GROUP_SCORE: f64 = 0.01;

/// How keyword and vector candidate lists are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FusionType {
    #[default]
    Ranked,
    RelativeScore,
}

/// A scored candidate from one retrieval leg.
#[derive(Debug, Clone)]
pub struct Candidate<K> {
    pub key: K,
    /// Raw backend score (term matches, BM25, cosine similarity, ...).
    pub raw_score: f64,
}

/// Scoring breakdown for a fused hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreExplanation {
    pub fusion: FusionType,
    /// The weight used: `hybrid = (1-α)*keyword + α*vector`.
    pub alpha: f64,
    /// Position in the keyword list (0-based), if present there.
    pub keyword_rank: Option<usize>,
    pub keyword_score: Option<f64>,
    /// Position in the vector list (0-based), if present there.
    pub vector_rank: Option<usize>,
    pub vector_score: Option<f64>,
}

/// A candidate after fusion.
#[derive(Debug, Clone)]
pub struct Fused<K> {
    pub key: K,
    pub score: f64,
    pub explain: ScoreExplanation,
}

/// Combine keyword and vector candidates into one list.
///
/// Inputs need not be sorted. The output is sorted by descending score,
/// ties broken by ascending key, so paging over it is deterministic.
pub fn fuse<K>(
    keyword: &[Candidate<K>],
    vector: &[Candidate<K>],
    alpha: f64,
    fusion: FusionType,
) -> Vec<Fused<K>>
where
    K: Clone + Eq + Hash + Ord,
{
    let kw = ranked(keyword);
    let vec = ranked(vector);

    let kw_norm = normalize_scores(&kw);
    let vec_norm = normalize_scores(&vec);

    let mut merged: HashMap<K, Fused<K>> = HashMap::new();
    let mut add = |cands: &[&Candidate<K>], norms: &[f64], is_keyword: bool| {
        let weight = if is_keyword { 1.0 - alpha } else { alpha };
        for (rank, (c, norm)) in cands.iter().zip(norms).enumerate() {
            let contribution = match fusion {
                FusionType::Ranked => weight / (RANK_CONSTANT + rank as f64),
                FusionType::RelativeScore => weight * norm,
            };
            let entry = merged.entry(c.key.clone()).or_insert_with(|| Fused {
                key: c.key.clone(),
                score: 0.0,
                explain: ScoreExplanation {
                    fusion,
                    alpha,
                    keyword_rank: None,
                    keyword_score: None,
                    vector_rank: None,
                    vector_score: None,
                },
            });
            entry.score += contribution;
            if is_keyword {
                entry.explain.keyword_rank = Some(rank);
                entry.explain.keyword_score = Some(c.raw_score);
            } else {
                entry.explain.vector_rank = Some(rank);
                entry.explain.vector_score = Some(c.raw_score);
            }
        }
    };
    add(&kw, &kw_norm, true);
    add(&vec, &vec_norm, false);

    let mut out: Vec<Fused<K>> = merged.into_values().collect();
    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.key.cmp(&b.key))
    });
    out
}

/// Sort candidates by descending raw score; ties by key.
fn ranked<K: Ord>(cands: &[Candidate<K>]) -> Vec<&Candidate<K>> {
    let mut sorted: Vec<&Candidate<K>> = cands.iter().collect();
    sorted.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.key.cmp(&b.key))
    });
    sorted
}

/// Min-max normalize raw scores to `[0.0, 1.0]`, preserving input order.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores<K>(candidates: &[&Candidate<K>]) -> Vec<f64> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

/// Apply `offset` then `limit` to an already-sorted list.
pub fn page<T>(items: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    items.into_iter().skip(offset).take(limit).collect()
}

/// Build the query filter: permissions, plus `app` and `entity` equality
/// only when *both* are given. One without the other is ignored.
pub fn build_filter(permissions: &PermissionSet, app: Option<&str>, entity: Option<Entity>) -> Filter {
    match (app, entity) {
        (Some(app), Some(entity)) => Filter::And(vec![
            Filter::equal(FilterProperty::App, app),
            Filter::equal(FilterProperty::Entity, entity.as_str()),
            Filter::permissions(permissions),
        ]),
        _ => Filter::permissions(permissions),
    }
}

/// `app -> entity -> count`, created on first use and incremented after.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct GroupCounts(BTreeMap<String, BTreeMap<String, usize>>);

impl GroupCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, app: &str, entity: &str) {
        *self
            .0
            .entry(app.to_string())
            .or_default()
            .entry(entity.to_string())
            .or_insert(0) += 1;
    }

    /// Count for a pair; `0` when never incremented.
    pub fn get(&self, app: &str, entity: &str) -> usize {
        self.0
            .get(app)
            .and_then(|entities| entities.get(entity))
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().flat_map(|e| e.values()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `(app, entity, count)` triples in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, usize)> {
        self.0.iter().flat_map(|(app, entities)| {
            entities
                .iter()
                .map(move |(entity, n)| (app.as_str(), entity.as_str(), *n))
        })
    }
}

/// Count hits scoring strictly above `min_score` by app and entity.
pub fn aggregate_counts<'a, I>(hits: I, min_score: f64) -> GroupCounts
where
    I: IntoIterator<Item = &'a QueryHit>,
{
    let mut counts = GroupCounts::new();
    for hit in hits.into_iter().filter(|h| h.score > min_score) {
        counts.increment(&hit.app, hit.entity.as_str());
    }
    counts
}

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone)]
pub struct QueryParams {
    pub alpha: f64,
    pub fusion: FusionType,
    pub group_limit: usize,
    pub min_group_score: f64,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            fusion: FusionType::Ranked,
            group_limit: DEFAULT_GROUP_LIMIT,
            min_group_score: DEFAULT_MIN_GROUP_SCORE,
        }
    }
}

/// Inputs for [`QueryEngine::search`].
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    pub limit: usize,
    pub offset: usize,
    /// Principals of the requesting user. Empty means "sees nothing".
    pub permissions: &'a PermissionSet,
    pub app: Option<&'a str>,
    pub entity: Option<Entity>,
}

/// Permission-filtered hybrid search over a [`HybridStore`].
pub struct QueryEngine<S: HybridStore> {
    store: Arc<S>,
    embedder: Arc<dyn EmbeddingProvider>,
    params: QueryParams,
}

impl<S: HybridStore> QueryEngine<S> {
    pub fn new(store: Arc<S>, embedder: Arc<dyn EmbeddingProvider>, params: QueryParams) -> Result<Self> {
        if !(0.0..0.5).contains(&params.alpha) {
            bail!("fusion alpha must be in [0.0, 0.5), got {}", params.alpha);
        }
        Ok(Self {
            store,
            embedder,
            params,
        })
    }

    /// Hybrid search returning up to `limit` hits after `offset`, each with
    /// its score explanation.
    pub async fn search(&self, req: &SearchRequest<'_>) -> Result<Vec<QueryHit>> {
        if req.permissions.is_empty() || req.query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query = self
            .hybrid_query(req.query, req.permissions, req.app, req.entity)
            .await?;
        let query = HybridQuery {
            limit: req.limit,
            offset: req.offset,
            fields: FieldSelection::All,
            explain: true,
            ..query
        };
        let hits = self.store.hybrid_query(&query).await?;
        tracing::debug!(query = req.query, hits = hits.len(), "search");
        Ok(hits)
    }

    /// Faceted counts of hits above the relevance floor.
    pub async fn search_group_by_count(
        &self,
        query: &str,
        permissions: &PermissionSet,
        app: Option<&str>,
        entity: Option<Entity>,
    ) -> Result<GroupCounts> {
        if permissions.is_empty() || query.trim().is_empty() {
            return Ok(GroupCounts::new());
        }
        let q = self.hybrid_query(query, permissions, app, entity).await?;
        let q = HybridQuery {
            limit: self.params.group_limit,
            offset: 0,
            fields: FieldSelection::Facets,
            explain: false,
            ..q
        };
        let hits = self.store.hybrid_query(&q).await?;
        let counts = aggregate_counts(&hits, self.params.min_group_score);
        tracing::debug!(query, hits = hits.len(), counted = counts.total(), "group counts");
        Ok(counts)
    }

    async fn hybrid_query(
        &self,
        text: &str,
        permissions: &PermissionSet,
        app: Option<&str>,
        entity: Option<Entity>,
    ) -> Result<HybridQuery> {
        let vector = embed_one(self.embedder.as_ref(), text).await?;
        Ok(HybridQuery {
            text: text.to_string(),
            vector,
            alpha: self.params.alpha,
            fusion: self.params.fusion,
            limit: 0,
            offset: 0,
            filter: build_filter(permissions, app, entity),
            fields: FieldSelection::All,
            explain: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKey;

    fn cand(key: &str, score: f64) -> Candidate<String> {
        Candidate {
            key: key.to_string(),
            raw_score: score,
        }
    }

    fn hit(app: &str, entity: Entity, score: f64) -> QueryHit {
        QueryHit {
            key: RecordKey {
                doc_id: "d".into(),
                chunk_index: 0,
            },
            app: app.into(),
            entity,
            properties: None,
            score,
            explain: None,
        }
    }

    #[test]
    fn test_normalize_range() {
        let c = [cand("a", 10.0), cand("b", 5.0), cand("c", 0.0)];
        let refs: Vec<&Candidate<String>> = c.iter().collect();
        let n = normalize_scores(&refs);
        assert!((n[0] - 1.0).abs() < 1e-9);
        assert!((n[1] - 0.5).abs() < 1e-9);
        assert!(n[2].abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        let c = [cand("a", 3.0), cand("b", 3.0)];
        let refs: Vec<&Candidate<String>> = c.iter().collect();
        assert!(normalize_scores(&refs).iter().all(|s| (*s - 1.0).abs() < 1e-9));
    }

    #[test]
    fn test_ranked_fusion_keyword_dominates() {
        // "kw" tops the keyword list, "vec" tops the vector list.
        let keyword = [cand("kw", 3.0), cand("vec", 1.0)];
        let vector = [cand("vec", 0.9), cand("kw", 0.1)];
        let fused = fuse(&keyword, &vector, 0.25, FusionType::Ranked);
        assert_eq!(fused[0].key, "kw");
        let expected = 0.75 / 60.0 + 0.25 / 61.0;
        assert!((fused[0].score - expected).abs() < 1e-12);
        assert_eq!(fused[0].explain.keyword_rank, Some(0));
        assert_eq!(fused[0].explain.vector_rank, Some(1));
    }

    #[test]
    fn test_ranked_fusion_single_leg() {
        let fused = fuse(&[], &[cand("only", 0.5)], 0.25, FusionType::Ranked);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 0.25 / 60.0).abs() < 1e-12);
        assert!(fused[0].explain.keyword_rank.is_none());
    }

    #[test]
    fn test_relative_score_alpha_zero_is_keyword_order() {
        let keyword = [cand("c1", 10.0), cand("c2", 5.0), cand("c3", 1.0)];
        let vector = [cand("c1", 0.1), cand("c2", 0.9)];
        let fused = fuse(&keyword, &vector, 0.0, FusionType::RelativeScore);
        let order: Vec<&str> = fused.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(order, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_relative_score_alpha_one_is_vector_order() {
        let keyword = [cand("c1", 10.0), cand("c2", 5.0)];
        let vector = [cand("c1", 0.1), cand("c2", 0.9), cand("c3", 0.5)];
        let fused = fuse(&keyword, &vector, 1.0, FusionType::RelativeScore);
        let order: Vec<&str> = fused.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(order, vec!["c2", "c3", "c1"]);
    }

    #[test]
    fn test_ties_broken_by_key() {
        let fused = fuse(&[cand("b", 1.0), cand("a", 1.0)], &[], 0.25, FusionType::RelativeScore);
        assert_eq!(fused[0].key, "a");
        assert_eq!(fused[1].key, "b");
    }

    #[test]
    fn test_page() {
        let v: Vec<u32> = (0..10).collect();
        assert_eq!(page(v.clone(), 2, 3), vec![2, 3, 4]);
        assert!(page(v, 20, 3).is_empty());
    }

    #[test]
    fn test_build_filter_requires_both_app_and_entity() {
        let perms: PermissionSet = ["a@x.com"].into_iter().collect();
        assert_eq!(build_filter(&perms, Some("google"), None), Filter::permissions(&perms));
        assert_eq!(build_filter(&perms, None, Some(Entity::Docs)), Filter::permissions(&perms));
        match build_filter(&perms, Some("google"), Some(Entity::Docs)) {
            Filter::And(parts) => assert_eq!(parts.len(), 3),
            other => panic!("expected And filter, got {:?}", other),
        }
    }

    #[test]
    fn test_aggregate_counts_drops_low_scores() {
        let hits = vec![
            hit("A", Entity::Docs, 0.02),
            hit("A", Entity::Docs, 0.005),
            hit("A", Entity::Docs, 0.5),
        ];
        let counts = aggregate_counts(&hits, DEFAULT_MIN_GROUP_SCORE);
        assert_eq!(counts.get("A", "docs"), 2);
        assert_eq!(counts.total(), 2);
    }

    #[test]
    fn test_group_counts_nested() {
        let mut counts = GroupCounts::new();
        counts.increment("google", "docs");
        counts.increment("google", "sheets");
        counts.increment("google", "docs");
        assert_eq!(counts.get("google", "docs"), 2);
        assert_eq!(counts.get("google", "slides"), 0);
        assert_eq!(counts.get("other", "docs"), 0);
        assert_eq!(
            serde_json::to_value(&counts).unwrap(),
            serde_json::json!({"google": {"docs": 2, "sheets": 1}})
        );
    }

    struct FixedEmbedder;

    #[async_trait::async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    async fn engine() -> QueryEngine<crate::store::memory::InMemoryStore> {
        use crate::models::{IndexRecord, RecordProperties};
        use crate::store::{CollectionSchema, HybridStore};

        let store = crate::store::memory::InMemoryStore::new();
        store
            .recreate_collection(&CollectionSchema::drive_files(2))
            .await
            .unwrap();
        let rec = |id: &str, entity: Entity, perms: &[&str]| IndexRecord {
            properties: RecordProperties {
                doc_id: id.into(),
                chunk_index: 0,
                title: format!("Roadmap {id}"),
                chunk: "planning notes".into(),
                url: String::new(),
                app: "google".into(),
                entity,
                mime_type: String::new(),
                owner: None,
                owner_email: None,
                owner_photo: None,
                permissions: perms.iter().copied().collect(),
            },
            vector: vec![1.0, 0.0],
        };
        store
            .insert_batch(&[
                rec("d1", Entity::Docs, &["alice@x.com"]),
                rec("d2", Entity::Sheets, &["domain"]),
                rec("d3", Entity::Docs, &["bob@x.com"]),
            ])
            .await
            .unwrap();
        QueryEngine::new(Arc::new(store), Arc::new(FixedEmbedder), QueryParams::default()).unwrap()
    }

    #[test]
    fn test_engine_rejects_vector_heavy_alpha() {
        let params = QueryParams {
            alpha: 0.7,
            ..QueryParams::default()
        };
        let store = Arc::new(crate::store::memory::InMemoryStore::new());
        assert!(QueryEngine::new(store, Arc::new(FixedEmbedder), params).is_err());
    }

    #[tokio::test]
    async fn test_search_empty_permissions_returns_nothing() {
        let engine = engine().await;
        let none = PermissionSet::new();
        let req = SearchRequest {
            query: "roadmap",
            limit: 10,
            offset: 0,
            permissions: &none,
            app: None,
            entity: None,
        };
        assert!(engine.search(&req).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_blank_query_returns_nothing() {
        let engine = engine().await;
        let perms: PermissionSet = ["domain"].into_iter().collect();
        let req = SearchRequest {
            query: "   ",
            limit: 10,
            offset: 0,
            permissions: &perms,
            app: None,
            entity: None,
        };
        assert!(engine.search(&req).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_filters_by_permission_and_entity() {
        let engine = engine().await;
        let perms: PermissionSet = ["alice@x.com", "domain"].into_iter().collect();
        let req = SearchRequest {
            query: "roadmap",
            limit: 10,
            offset: 0,
            permissions: &perms,
            app: None,
            entity: None,
        };
        let hits = engine.search(&req).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.key.doc_id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&"d3"));
        assert!(hits.iter().all(|h| h.explain.is_some() && h.properties.is_some()));

        let req = SearchRequest {
            app: Some("google"),
            entity: Some(Entity::Sheets),
            ..req
        };
        let hits = engine.search(&req).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key.doc_id, "d2");
    }

    #[tokio::test]
    async fn test_group_by_count() {
        let engine = engine().await;
        let perms: PermissionSet = ["alice@x.com", "bob@x.com", "domain"].into_iter().collect();
        let counts = engine
            .search_group_by_count("roadmap", &perms, None, None)
            .await
            .unwrap();
        assert_eq!(counts.get("google", "docs"), 2);
        assert_eq!(counts.get("google", "sheets"), 1);

        let counts = engine
            .search_group_by_count("roadmap", &PermissionSet::new(), None, None)
            .await
            .unwrap();
        assert!(counts.is_empty());
    }
}
