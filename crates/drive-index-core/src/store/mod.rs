//! Hybrid store abstraction.
//!
//! The [`HybridStore`] trait is everything the index writer and the query
//! engine need from a vector/lexical backend: recreate the collection,
//! insert batches of records, and run a filtered, fused hybrid query.
//! Implementations are handed around as explicit handles (`Arc<S>`); there
//! is no ambient "current collection".
//!
//! Implementations must be `Send + Sync` to work with async runtimes, and
//! must apply [`Filter`]s *before* candidate generation so a record the
//! caller may not read can never contribute to fusion.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{Entity, IndexRecord, PermissionSet, RecordKey, RecordProperties};
use crate::search::{FusionType, ScoreExplanation};

/// Name of the single collection each deployment writes.
pub const COLLECTION_NAME: &str = "DriveFiles";

/// Storage type of a schema property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PropertyKind {
    Text,
    Int,
    TextArray,
}

/// One property of the collection schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertySpec {
    pub name: &'static str,
    pub kind: PropertyKind,
    /// Participates in lexical (keyword) scoring.
    pub searchable: bool,
    /// Usable in a [`Filter`].
    pub filterable: bool,
}

const fn prop(name: &'static str, kind: PropertyKind, searchable: bool, filterable: bool) -> PropertySpec {
    PropertySpec {
        name,
        kind,
        searchable,
        filterable,
    }
}

/// Collection schema: the record properties plus the vector dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionSchema {
    pub name: String,
    pub dims: usize,
    pub properties: Vec<PropertySpec>,
}

impl CollectionSchema {
    /// The schema for [`IndexRecord`]s with `dims`-dimensional vectors.
    pub fn drive_files(dims: usize) -> Self {
        use PropertyKind::*;
        Self {
            name: COLLECTION_NAME.to_string(),
            dims,
            properties: vec![
                prop("docId", Text, false, false),
                prop("chunkIndex", Int, false, false),
                prop("title", Text, true, false),
                prop("chunk", Text, true, false),
                prop("url", Text, false, false),
                prop("app", Text, false, true),
                prop("entity", Text, false, true),
                prop("mimeType", Text, false, false),
                prop("owner", Text, false, false),
                prop("ownerEmail", Text, false, false),
                prop("ownerPhoto", Text, false, false),
                prop("permissions", TextArray, false, true),
            ],
        }
    }
}

/// Properties a [`Filter`] may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FilterProperty {
    App,
    Entity,
    Permissions,
}

impl FilterProperty {
    pub fn name(&self) -> &'static str {
        match self {
            FilterProperty::App => "app",
            FilterProperty::Entity => "entity",
            FilterProperty::Permissions => "permissions",
        }
    }
}

/// Attribute filter applied by the store before scoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Filter {
    /// The property (or, for multi-valued properties, one of its values)
    /// equals any of `values`. An empty `values` list matches nothing.
    ContainsAny {
        property: FilterProperty,
        values: Vec<String>,
    },
    Equal {
        property: FilterProperty,
        value: String,
    },
    /// All sub-filters match.
    And(Vec<Filter>),
}

impl Filter {
    /// Records readable by at least one of `permissions`.
    pub fn permissions(permissions: &PermissionSet) -> Self {
        Filter::ContainsAny {
            property: FilterProperty::Permissions,
            values: permissions.iter().map(str::to_string).collect(),
        }
    }

    pub fn equal(property: FilterProperty, value: impl Into<String>) -> Self {
        Filter::Equal {
            property,
            value: value.into(),
        }
    }

    /// Evaluate the filter against a record's properties.
    pub fn matches(&self, props: &RecordProperties) -> bool {
        match self {
            Filter::ContainsAny { property, values } => match property {
                FilterProperty::Permissions => values.iter().any(|v| props.permissions.contains(v)),
                FilterProperty::App => values.iter().any(|v| *v == props.app),
                FilterProperty::Entity => values.iter().any(|v| v == props.entity.as_str()),
            },
            Filter::Equal { property, value } => match property {
                FilterProperty::Permissions => props.permissions.contains(value),
                FilterProperty::App => props.app == *value,
                FilterProperty::Entity => props.entity.as_str() == value,
            },
            Filter::And(filters) => filters.iter().all(|f| f.matches(props)),
        }
    }
}

/// Which record properties a query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldSelection {
    /// All stored properties.
    #[default]
    All,
    /// Only `app` and `entity` (plus the record key); used for counting.
    Facets,
}

/// A fused lexical + vector query.
#[derive(Debug, Clone)]
pub struct HybridQuery {
    pub text: String,
    pub vector: Vec<f32>,
    /// Fusion weight: `0.0` is pure keyword, `1.0` pure vector.
    pub alpha: f64,
    pub fusion: FusionType,
    pub limit: usize,
    pub offset: usize,
    pub filter: Filter,
    pub fields: FieldSelection,
    /// Attach a [`ScoreExplanation`] to every hit.
    pub explain: bool,
}

/// One result of a [`HybridQuery`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryHit {
    #[serde(flatten)]
    pub key: RecordKey,
    pub app: String,
    pub entity: Entity,
    /// Present when the query asked for [`FieldSelection::All`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<RecordProperties>,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<ScoreExplanation>,
}

impl QueryHit {
    /// Build a hit from stored properties, honoring the field selection.
    pub fn from_properties(
        props: &RecordProperties,
        fields: FieldSelection,
        score: f64,
        explain: Option<ScoreExplanation>,
    ) -> Self {
        Self {
            key: props.key(),
            app: props.app.clone(),
            entity: props.entity,
            properties: match fields {
                FieldSelection::All => Some(props.clone()),
                FieldSelection::Facets => None,
            },
            score,
            explain,
        }
    }
}

/// Exclusive right to replace a store's collection. Dropping it releases
/// the lock.
pub struct GenerationGuard {
    _held: Box<dyn Send>,
}

impl GenerationGuard {
    pub fn new(held: impl Send + 'static) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

/// Abstract vector/lexical storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`lock_generation`](HybridStore::lock_generation) | Wait for exclusive write access |
/// | [`recreate_collection`](HybridStore::recreate_collection) | Drop any prior generation and create the schema |
/// | [`insert_batch`](HybridStore::insert_batch) | Insert one batch of records |
/// | [`hybrid_query`](HybridStore::hybrid_query) | Filtered, fused keyword + vector query |
/// | [`count`](HybridStore::count) | Number of records in the current generation |
#[async_trait]
pub trait HybridStore: Send + Sync {
    /// Wait until no other writer is replacing this store. The guard is held
    /// from `recreate_collection` through the last `insert_batch`, so every
    /// handle to the same store sees at most one replacement in flight.
    async fn lock_generation(&self) -> Result<GenerationGuard>;

    /// Delete the existing collection, if any, then create it from `schema`.
    async fn recreate_collection(&self, schema: &CollectionSchema) -> Result<()>;

    /// Insert records into the current collection.
    async fn insert_batch(&self, records: &[IndexRecord]) -> Result<()>;

    /// Run a hybrid query. Hits are ordered by descending score, ties broken
    /// by `(docId, chunkIndex)`, with `offset`/`limit` already applied.
    async fn hybrid_query(&self, query: &HybridQuery) -> Result<Vec<QueryHit>>;

    /// Number of records currently stored.
    async fn count(&self) -> Result<usize>;
}
