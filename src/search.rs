//! `dix search` and `dix counts`: the query engine over the SQLite index.

use std::sync::Arc;

use drive_index_core::models::{Entity, PermissionSet};
use drive_index_core::search::{GroupCounts, QueryEngine, SearchRequest};
use drive_index_core::store::QueryHit;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::sqlite_store::SqliteStore;

/// Who is asking, and which slice of the index they want.
#[derive(Debug, Clone, Default)]
pub struct QueryScope {
    pub principals: Vec<String>,
    pub app: Option<String>,
    pub entity: Option<Entity>,
}

impl QueryScope {
    pub fn permissions(&self) -> PermissionSet {
        self.principals.iter().map(String::as_str).collect()
    }
}

pub async fn open_engine(config: &Config) -> PipelineResult<QueryEngine<SqliteStore>> {
    let pool = db::connect(&config.index.db_path)
        .await
        .map_err(|e| PipelineError::backend(Stage::Query, e))?;
    let provider = embedding::create_provider(&config.embedding)
        .map_err(|e| PipelineError::Config(format!("{:#}", e)))?;
    QueryEngine::new(
        Arc::new(SqliteStore::new(pool)),
        provider,
        config.retrieval.query_params(),
    )
    .map_err(|e| PipelineError::Config(format!("{:#}", e)))
}

pub async fn run_search(
    config: &Config,
    query: &str,
    scope: &QueryScope,
    limit: Option<usize>,
    offset: usize,
    json: bool,
) -> PipelineResult<()> {
    if scope.principals.is_empty() {
        tracing::warn!("no --as principals given; nothing is visible");
    }
    let engine = open_engine(config).await?;
    let permissions = scope.permissions();
    let hits = engine
        .search(&SearchRequest {
            query,
            limit: limit.unwrap_or(config.retrieval.final_limit),
            offset,
            permissions: &permissions,
            app: scope.app.as_deref(),
            entity: scope.entity,
        })
        .await
        .map_err(|e| PipelineError::backend(Stage::Query, e))?;

    if json {
        let out = serde_json::to_string_pretty(&hits)
            .map_err(|e| PipelineError::backend(Stage::Query, e))?;
        println!("{}", out);
    } else {
        print_hits(&hits, offset);
    }
    Ok(())
}

pub async fn run_counts(
    config: &Config,
    query: &str,
    scope: &QueryScope,
    json: bool,
) -> PipelineResult<()> {
    let engine = open_engine(config).await?;
    let counts = engine
        .search_group_by_count(
            query,
            &scope.permissions(),
            scope.app.as_deref(),
            scope.entity,
        )
        .await
        .map_err(|e| PipelineError::backend(Stage::Query, e))?;

    if json {
        let out = serde_json::to_string_pretty(&counts)
            .map_err(|e| PipelineError::backend(Stage::Query, e))?;
        println!("{}", out);
    } else {
        print_counts(&counts);
    }
    Ok(())
}

fn print_hits(hits: &[QueryHit], offset: usize) {
    if hits.is_empty() {
        println!("No results.");
        return;
    }
    for (i, hit) in hits.iter().enumerate() {
        let Some(props) = hit.properties.as_ref() else {
            continue;
        };
        println!(
            "{}. [{:.4}] {} / {} / {}",
            offset + i + 1,
            hit.score,
            hit.app,
            hit.entity,
            props.title
        );
        if !props.url.is_empty() {
            println!("    url: {}", props.url);
        }
        if let Some(owner) = props.owner.as_deref().or(props.owner_email.as_deref()) {
            println!("    owner: {}", owner);
        }
        if !props.chunk.is_empty() {
            println!("    excerpt: \"{}\"", excerpt(&props.chunk, 160));
        }
        if let Some(explain) = &hit.explain {
            println!(
                "    keyword: {} vector: {}",
                rank_display(explain.keyword_rank),
                rank_display(explain.vector_rank)
            );
        }
        println!("    id: {}", hit.key);
        println!();
    }
}

fn print_counts(counts: &GroupCounts) {
    if counts.is_empty() {
        println!("No results.");
        return;
    }
    for (app, entity, n) in counts.iter() {
        println!("{:<12} {:<12} {}", app, entity, n);
    }
    println!("total: {}", counts.total());
}

fn rank_display(rank: Option<usize>) -> String {
    rank.map(|r| format!("#{}", r + 1))
        .unwrap_or_else(|| "-".to_string())
}

/// First `max_chars` characters of `text` on one line.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_flattens_and_truncates() {
        assert_eq!(excerpt("a\n\nb  c", 10), "a b c");
        assert_eq!(excerpt("abcdef ghij", 6), "abcdef…");
    }

    #[test]
    fn test_scope_permissions() {
        let scope = QueryScope {
            principals: vec!["b@x.com".into(), "a@x.com".into(), "a@x.com".into()],
            ..Default::default()
        };
        let perms = scope.permissions();
        assert_eq!(perms.len(), 2);
        assert!(perms.contains("a@x.com"));
    }

    #[test]
    fn test_rank_display() {
        assert_eq!(rank_display(Some(0)), "#1");
        assert_eq!(rank_display(None), "-");
    }
}
