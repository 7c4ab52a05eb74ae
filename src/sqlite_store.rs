//! SQLite-backed [`HybridStore`].
//!
//! One generation of the collection lives in four tables:
//!
//! | Table | Contents |
//! |-------|----------|
//! | `collection_meta` | collection name and vector dimension |
//! | `records` | stored properties and the vector as a little-endian BLOB |
//! | `record_permissions` | one row per (record, principal) for filtering |
//! | `records_fts` | FTS5 index over `title` and `chunk`, keyed by `records.id` |
//!
//! Filters compile to a SQL predicate applied to both the FTS5 leg and the
//! vector leg, so unreadable records never become candidates. Vector
//! similarity is brute-force cosine over the filtered rows.
//!
//! Replacements are serialized per store handle by an async mutex and,
//! when a lock file is configured, across processes by an exclusive SQLite
//! lock on that file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use drive_index_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use drive_index_core::models::{Entity, IndexRecord, RecordKey, RecordProperties};
use drive_index_core::search::{fuse, page, Candidate};
use drive_index_core::store::{
    CollectionSchema, FieldSelection, Filter, FilterProperty, GenerationGuard, HybridQuery,
    HybridStore, QueryHit,
};

use crate::db;

pub struct SqliteStore {
    pool: SqlitePool,
    generation: Arc<Mutex<()>>,
    lock_file: Option<PathBuf>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            generation: Arc::new(Mutex::new(())),
            lock_file: None,
        }
    }

    /// Also take an exclusive lock on `path` while replacing, so writers in
    /// other processes wait their turn.
    pub fn with_lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_file = Some(path.into());
        self
    }

    async fn collection_exists(&self) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='collection_meta'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn collection_dims(&self) -> Result<usize> {
        if !self.collection_exists().await? {
            bail!("collection does not exist; run `dix index` first");
        }
        let dims: Option<i64> = sqlx::query_scalar("SELECT dims FROM collection_meta LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        dims.map(|d| d as usize)
            .ok_or_else(|| anyhow!("collection metadata missing"))
    }

    async fn load_properties(&self, id: i64) -> Result<RecordProperties> {
        let row = sqlx::query(
            r#"
            SELECT doc_id, chunk_index, title, chunk, url, app, entity, mime_type,
                   owner, owner_email, owner_photo
            FROM records WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        let principals: Vec<String> = sqlx::query_scalar(
            "SELECT principal FROM record_permissions WHERE record_id = ? ORDER BY principal",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let entity: String = row.get("entity");
        Ok(RecordProperties {
            doc_id: row.get("doc_id"),
            chunk_index: row.get("chunk_index"),
            title: row.get("title"),
            chunk: row.get("chunk"),
            url: row.get("url"),
            app: row.get("app"),
            entity: entity.parse::<Entity>()?,
            mime_type: row.get("mime_type"),
            owner: row.get("owner"),
            owner_email: row.get("owner_email"),
            owner_photo: row.get("owner_photo"),
            permissions: principals.into_iter().collect(),
        })
    }

}

/// Row id and facets of a candidate, read along with its score.
struct CandidateRow {
    id: i64,
    app: String,
    entity: String,
}

impl CandidateRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            app: row.get("app"),
            entity: row.get("entity"),
        }
    }
}

/// Compile a [`Filter`] into a SQL predicate over `records r`, plus the
/// values to bind in order.
pub fn compile_filter(filter: &Filter) -> (String, Vec<String>) {
    fn column(property: FilterProperty) -> &'static str {
        match property {
            FilterProperty::App => "r.app",
            FilterProperty::Entity => "r.entity",
            FilterProperty::Permissions => "",
        }
    }

    fn placeholders(n: usize) -> String {
        vec!["?"; n].join(", ")
    }

    match filter {
        Filter::ContainsAny { values, .. } if values.is_empty() => ("0".to_string(), Vec::new()),
        Filter::ContainsAny {
            property: FilterProperty::Permissions,
            values,
        } => (
            format!(
                "r.id IN (SELECT record_id FROM record_permissions WHERE principal IN ({}))",
                placeholders(values.len())
            ),
            values.clone(),
        ),
        Filter::ContainsAny { property, values } => (
            format!("{} IN ({})", column(*property), placeholders(values.len())),
            values.clone(),
        ),
        Filter::Equal {
            property: FilterProperty::Permissions,
            value,
        } => (
            "r.id IN (SELECT record_id FROM record_permissions WHERE principal = ?)".to_string(),
            vec![value.clone()],
        ),
        Filter::Equal { property, value } => {
            (format!("{} = ?", column(*property)), vec![value.clone()])
        }
        Filter::And(filters) if filters.is_empty() => ("1".to_string(), Vec::new()),
        Filter::And(filters) => {
            let mut parts = Vec::with_capacity(filters.len());
            let mut binds = Vec::new();
            for f in filters {
                let (sql, b) = compile_filter(f);
                parts.push(format!("({})", sql));
                binds.extend(b);
            }
            (parts.join(" AND "), binds)
        }
    }
}

/// Turn free text into an FTS5 expression: every term quoted, OR-joined.
/// Returns `None` when no searchable term remains.
pub fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split_whitespace()
        .map(|t| t.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[async_trait]
impl HybridStore for SqliteStore {
    async fn lock_generation(&self) -> Result<GenerationGuard> {
        let local = self.generation.clone().lock_owned().await;
        match &self.lock_file {
            Some(path) => {
                let conn = db::lock_exclusive(path, db::WRITER_LOCK_TIMEOUT).await?;
                tracing::debug!(lock = %path.display(), "writer lock acquired");
                Ok(GenerationGuard::new((local, conn)))
            }
            None => Ok(GenerationGuard::new(local)),
        }
    }

    async fn recreate_collection(&self, schema: &CollectionSchema) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for stmt in [
            "DROP TABLE IF EXISTS records_fts",
            "DROP TABLE IF EXISTS record_permissions",
            "DROP TABLE IF EXISTS records",
            "DROP TABLE IF EXISTS collection_meta",
        ] {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE collection_meta (
                name TEXT PRIMARY KEY,
                dims INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE records (
                id INTEGER PRIMARY KEY,
                doc_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                title TEXT NOT NULL,
                chunk TEXT NOT NULL,
                url TEXT NOT NULL,
                app TEXT NOT NULL,
                entity TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                owner TEXT,
                owner_email TEXT,
                owner_photo TEXT,
                embedding BLOB NOT NULL,
                UNIQUE(doc_id, chunk_index)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE record_permissions (
                record_id INTEGER NOT NULL,
                principal TEXT NOT NULL,
                PRIMARY KEY (record_id, principal),
                FOREIGN KEY (record_id) REFERENCES records(id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE VIRTUAL TABLE records_fts USING fts5(title, chunk)")
            .execute(&mut *tx)
            .await?;

        sqlx::query("CREATE INDEX idx_record_permissions_principal ON record_permissions(principal)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX idx_records_app_entity ON records(app, entity)")
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO collection_meta (name, dims, created_at) VALUES (?, ?, ?)")
            .bind(&schema.name)
            .bind(schema.dims as i64)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_batch(&self, records: &[IndexRecord]) -> Result<()> {
        let dims = self.collection_dims().await?;
        let mut tx = self.pool.begin().await?;

        for record in records {
            let p = &record.properties;
            if record.vector.len() != dims {
                bail!(
                    "record {} has {} dims, collection expects {}",
                    p.key(),
                    record.vector.len(),
                    dims
                );
            }

            let result = sqlx::query(
                r#"
                INSERT INTO records (doc_id, chunk_index, title, chunk, url, app, entity,
                                     mime_type, owner, owner_email, owner_photo, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&p.doc_id)
            .bind(p.chunk_index)
            .bind(&p.title)
            .bind(&p.chunk)
            .bind(&p.url)
            .bind(&p.app)
            .bind(p.entity.as_str())
            .bind(&p.mime_type)
            .bind(&p.owner)
            .bind(&p.owner_email)
            .bind(&p.owner_photo)
            .bind(vec_to_blob(&record.vector))
            .execute(&mut *tx)
            .await?;
            let id = result.last_insert_rowid();

            sqlx::query("INSERT INTO records_fts (rowid, title, chunk) VALUES (?, ?, ?)")
                .bind(id)
                .bind(&p.title)
                .bind(&p.chunk)
                .execute(&mut *tx)
                .await?;

            for principal in p.permissions.iter() {
                sqlx::query("INSERT INTO record_permissions (record_id, principal) VALUES (?, ?)")
                    .bind(id)
                    .bind(principal)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn hybrid_query(&self, query: &HybridQuery) -> Result<Vec<QueryHit>> {
        if !self.collection_exists().await? {
            return Ok(Vec::new());
        }
        let (predicate, binds) = compile_filter(&query.filter);
        let mut rows: HashMap<RecordKey, CandidateRow> = HashMap::new();

        let mut keyword = Vec::new();
        if let Some(fts) = fts_query(&query.text) {
            let sql = format!(
                r#"
                SELECT r.id, r.doc_id, r.chunk_index, r.app, r.entity,
                       bm25(records_fts) AS bm25_score
                FROM records_fts
                JOIN records r ON r.id = records_fts.rowid
                WHERE records_fts MATCH ? AND {}
                "#,
                predicate
            );
            let mut q = sqlx::query(&sql).bind(fts);
            for b in &binds {
                q = q.bind(b);
            }
            for row in q.fetch_all(&self.pool).await? {
                let key = RecordKey {
                    doc_id: row.get("doc_id"),
                    chunk_index: row.get("chunk_index"),
                };
                let rank: f64 = row.get("bm25_score");
                rows.insert(key.clone(), CandidateRow::from_row(&row));
                keyword.push(Candidate {
                    key,
                    raw_score: -rank,
                });
            }
        }

        let sql = format!(
            "SELECT r.id, r.doc_id, r.chunk_index, r.app, r.entity, r.embedding FROM records r WHERE {}",
            predicate
        );
        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = q.bind(b);
        }
        let mut vector = Vec::new();
        for row in q.fetch_all(&self.pool).await? {
            let key = RecordKey {
                doc_id: row.get("doc_id"),
                chunk_index: row.get("chunk_index"),
            };
            let blob: Vec<u8> = row.get("embedding");
            let similarity = cosine_similarity(&query.vector, &blob_to_vec(&blob)) as f64;
            rows.insert(key.clone(), CandidateRow::from_row(&row));
            vector.push(Candidate {
                key,
                raw_score: similarity,
            });
        }

        let fused = page(
            fuse(&keyword, &vector, query.alpha, query.fusion),
            query.offset,
            query.limit,
        );

        let mut hits = Vec::with_capacity(fused.len());
        for f in fused {
            let row = rows
                .remove(&f.key)
                .ok_or_else(|| anyhow!("fused key {} has no row", f.key))?;
            let explain = query.explain.then_some(f.explain);
            let hit = match query.fields {
                FieldSelection::All => {
                    let props = self.load_properties(row.id).await?;
                    QueryHit::from_properties(&props, FieldSelection::All, f.score, explain)
                }
                FieldSelection::Facets => QueryHit {
                    key: f.key,
                    app: row.app,
                    entity: row.entity.parse::<Entity>()?,
                    properties: None,
                    score: f.score,
                    explain,
                },
            };
            hits.push(hit);
        }
        Ok(hits)
    }

    async fn count(&self) -> Result<usize> {
        if !self.collection_exists().await? {
            return Ok(0);
        }
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }
}
