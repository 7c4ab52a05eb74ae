//! Content pipeline: metadata snapshot → record shells.
//!
//! Text documents are fetched, rendered, cleaned, and chunked on the
//! worker pool; every other file becomes a single title-only shell.
//! Output order is fixed: title-only shells first (crawl order), then the
//! chunks of each text document (crawl order, chunk order).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use drive_index_core::chunk::chunk_text;
use drive_index_core::mime::is_text_document;
use drive_index_core::models::{DocumentMetadata, RecordProperties};
use drive_index_core::permissions::normalize_permissions;
use drive_index_core::records::{document_records, file_record};

use crate::drive::DocumentSource;
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::render::render;
use crate::worker::WorkerPool;

/// Full cleaned text of one text document, for downstream synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullText {
    pub doc_id: String,
    pub title: String,
    pub url: Option<String>,
    pub text: String,
}

/// Build the record shells for a crawl snapshot.
///
/// # Errors
///
/// [`PipelineError::SourceUnavailable`] naming every document whose fetch
/// failed after the client's retries. No shells are returned in that case.
pub async fn extract_records(
    source: Arc<dyn DocumentSource>,
    files: &[DocumentMetadata],
    identity: &str,
    max_tokens: usize,
    pool: &WorkerPool,
    progress: &dyn ProgressReporter,
) -> PipelineResult<Vec<RecordProperties>> {
    let (docs, others): (Vec<&DocumentMetadata>, Vec<&DocumentMetadata>) =
        files.iter().partition(|m| is_text_document(&m.mime_type));

    let mut records: Vec<RecordProperties> = others
        .iter()
        .map(|meta| {
            let perms = normalize_permissions(meta.raw_permissions.as_deref(), identity);
            file_record(meta, &perms)
        })
        .collect();

    let total = docs.len() as u64;
    let ids: Vec<String> = docs.iter().map(|m| m.id.clone()).collect();
    let inputs: Vec<DocumentMetadata> = docs.into_iter().cloned().collect();
    let identity = identity.to_string();

    let results = pool
        .run(
            inputs,
            move |meta| {
                let source = source.clone();
                let identity = identity.clone();
                async move {
                    let doc = source.fetch_document(&meta.id).await?;
                    let chunks = chunk_text(&render(&doc), max_tokens);
                    let perms = normalize_permissions(meta.raw_permissions.as_deref(), &identity);
                    Ok(document_records(&meta, &perms, chunks))
                }
            },
            |n| progress.report(ProgressEvent::Extract { n: n as u64, total }),
        )
        .await;

    let mut failed = Vec::new();
    for (id, result) in ids.into_iter().zip(results) {
        match result {
            Ok(chunks) => records.extend(chunks),
            Err(e) => {
                tracing::warn!(doc_id = %id, error = %format!("{:#}", e), "document fetch failed");
                failed.push(id);
            }
        }
    }
    if !failed.is_empty() {
        return Err(PipelineError::SourceUnavailable {
            stage: Stage::Extract,
            reason: format!(
                "{} document(s) could not be fetched: {}",
                failed.len(),
                failed.join(", ")
            ),
        });
    }

    tracing::info!(files = files.len(), records = records.len(), "extraction complete");
    Ok(records)
}

/// Fetch and render every text document without chunking.
pub async fn extract_full_texts(
    source: Arc<dyn DocumentSource>,
    files: &[DocumentMetadata],
    pool: &WorkerPool,
    progress: &dyn ProgressReporter,
) -> PipelineResult<Vec<FullText>> {
    let inputs: Vec<DocumentMetadata> = files
        .iter()
        .filter(|m| is_text_document(&m.mime_type))
        .cloned()
        .collect();
    let total = inputs.len() as u64;
    let ids: Vec<String> = inputs.iter().map(|m| m.id.clone()).collect();

    let results = pool
        .run(
            inputs,
            move |meta| {
                let source = source.clone();
                async move {
                    let doc = source.fetch_document(&meta.id).await?;
                    Ok(FullText {
                        doc_id: meta.id,
                        title: meta.title,
                        url: meta.url,
                        text: render(&doc),
                    })
                }
            },
            |n| progress.report(ProgressEvent::Extract { n: n as u64, total }),
        )
        .await;

    let mut texts = Vec::with_capacity(results.len());
    let mut failed = Vec::new();
    for (id, result) in ids.into_iter().zip(results) {
        match result {
            Ok(text) => texts.push(text),
            Err(e) => {
                tracing::warn!(doc_id = %id, error = %format!("{:#}", e), "document fetch failed");
                failed.push(id);
            }
        }
    }
    if !failed.is_empty() {
        return Err(PipelineError::SourceUnavailable {
            stage: Stage::Extract,
            reason: format!(
                "{} document(s) could not be fetched: {}",
                failed.len(),
                failed.join(", ")
            ),
        });
    }
    Ok(texts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::{FilePage, ListRequest};
    use crate::progress::NoProgress;
    use crate::render::DocsDocument;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use drive_index_core::mime::{GOOGLE_DOCUMENT, GOOGLE_SPREADSHEET};
    use drive_index_core::models::{Entity, RawPermission};
    use std::time::Duration;

    struct DocSource;

    #[async_trait]
    impl DocumentSource for DocSource {
        async fn list_files(&self, _req: &ListRequest) -> Result<FilePage> {
            Ok(FilePage::default())
        }

        async fn fetch_document(&self, id: &str) -> Result<DocsDocument> {
            if id.starts_with("broken") {
                bail!("404 not found");
            }
            let para = "z".repeat(35);
            Ok(serde_json::from_value(serde_json::json!({"body": {"content": [
                {"paragraph": {"elements": [{"textRun": {"content": format!("{para}\n")}}]}},
                {"paragraph": {"elements": [{"textRun": {"content": format!("{para}\n")}}]}},
                {"paragraph": {"elements": [{"textRun": {"content": format!("{para}\n")}}]}}
            ]}}))?)
        }
    }

    fn meta(id: &str, mime: &str) -> DocumentMetadata {
        DocumentMetadata {
            id: id.into(),
            title: format!("T {id}"),
            url: None,
            mime_type: mime.into(),
            created_time: None,
            modified_time: None,
            owner: None,
            raw_permissions: Some(vec![RawPermission::user("a@x.com")]),
        }
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(4, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_shells_first_then_chunks() {
        let files = vec![
            meta("doc1", GOOGLE_DOCUMENT),
            meta("sheet1", GOOGLE_SPREADSHEET),
            meta("doc2", GOOGLE_DOCUMENT),
        ];
        let records = extract_records(Arc::new(DocSource), &files, "crawler@x.com", 10, &pool(), &NoProgress)
            .await
            .unwrap();

        assert_eq!(records.len(), 7);
        assert_eq!(records[0].doc_id, "sheet1");
        assert_eq!(records[0].entity, Entity::Sheets);
        assert_eq!(records[0].chunk, "");
        let keys: Vec<(String, i64)> = records[1..]
            .iter()
            .map(|r| (r.doc_id.clone(), r.chunk_index))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("doc1".to_string(), 0),
                ("doc1".to_string(), 1),
                ("doc1".to_string(), 2),
                ("doc2".to_string(), 0),
                ("doc2".to_string(), 1),
                ("doc2".to_string(), 2),
            ]
        );
        assert!(records[1..].iter().all(|r| r.entity == Entity::Docs));
        assert!(records.iter().all(|r| r.permissions.contains("a@x.com")));
    }

    #[tokio::test]
    async fn test_fetch_failures_are_listed() {
        let files = vec![
            meta("broken-1", GOOGLE_DOCUMENT),
            meta("ok", GOOGLE_DOCUMENT),
            meta("broken-2", GOOGLE_DOCUMENT),
        ];
        let err = extract_records(Arc::new(DocSource), &files, "crawler@x.com", 10, &pool(), &NoProgress)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("broken-1") && msg.contains("broken-2"));
        assert!(!msg.contains("ok,"));
        assert_eq!(err.stage(), Stage::Extract);
    }

    #[tokio::test]
    async fn test_full_texts_only_documents() {
        let files = vec![meta("doc1", GOOGLE_DOCUMENT), meta("sheet1", GOOGLE_SPREADSHEET)];
        let texts = extract_full_texts(Arc::new(DocSource), &files, &pool(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0].doc_id, "doc1");
        assert_eq!(texts[0].text.matches("\n\n").count(), 2);
    }
}
