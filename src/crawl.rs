//! Metadata crawler.
//!
//! Walks `files.list` page by page, following continuation tokens until
//! the source stops returning one. Pages are fetched sequentially; each
//! page depends on the previous page's token.

use std::collections::HashSet;

use drive_index_core::models::DocumentMetadata;

use crate::drive::{DocumentSource, ListRequest};
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::progress::{ProgressEvent, ProgressReporter};

/// Fetch the complete metadata snapshot.
///
/// Files are de-duplicated by id, first occurrence wins. A continuation
/// token the source has already returned means the listing is looping and
/// fails the crawl. Any page error fails the whole crawl; partial results
/// are discarded.
pub async fn crawl(
    source: &dyn DocumentSource,
    page_size: u32,
    only_documents: bool,
    progress: &dyn ProgressReporter,
) -> PipelineResult<Vec<DocumentMetadata>> {
    let mut req = ListRequest::first_page(page_size, only_documents);
    let mut seen_ids = HashSet::new();
    let mut seen_tokens = HashSet::new();
    let mut files = Vec::new();
    let mut pages = 0u64;

    loop {
        let page = source
            .list_files(&req)
            .await
            .map_err(|e| PipelineError::SourceUnavailable {
                stage: Stage::Crawl,
                reason: format!("page {} failed: {:#}", pages + 1, e),
            })?;
        pages += 1;

        for file in page.files {
            if seen_ids.insert(file.id.clone()) {
                files.push(DocumentMetadata::from(file));
            } else {
                tracing::debug!(id = %file.id, "duplicate file in listing");
            }
        }
        progress.report(ProgressEvent::Crawl {
            pages,
            files: files.len() as u64,
        });

        match page.next_page_token.filter(|t| !t.is_empty()) {
            Some(token) => {
                if !seen_tokens.insert(token.clone()) {
                    return Err(PipelineError::SourceUnavailable {
                        stage: Stage::Crawl,
                        reason: format!("continuation token repeated after page {}", pages),
                    });
                }
                req.page_token = Some(token);
            }
            None => break,
        }
    }

    tracing::info!(pages, files = files.len(), only_documents, "crawl complete");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::{DriveFile, FilePage};
    use crate::progress::NoProgress;
    use crate::render::DocsDocument;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct PagedSource {
        pages: Vec<FilePage>,
        requests: Mutex<Vec<ListRequest>>,
        fail_at: Option<usize>,
    }

    impl PagedSource {
        fn new(pages: Vec<FilePage>) -> Self {
            Self {
                pages,
                requests: Mutex::new(Vec::new()),
                fail_at: None,
            }
        }
    }

    fn page(ids: &[&str], next: Option<&str>) -> FilePage {
        FilePage {
            files: ids
                .iter()
                .map(|id| DriveFile {
                    id: id.to_string(),
                    name: format!("File {id}"),
                    mime_type: "application/pdf".into(),
                    ..DriveFile::default()
                })
                .collect(),
            next_page_token: next.map(str::to_string),
        }
    }

    #[async_trait]
    impl DocumentSource for PagedSource {
        async fn list_files(&self, req: &ListRequest) -> Result<FilePage> {
            let mut requests = self.requests.lock().unwrap();
            let n = requests.len();
            requests.push(req.clone());
            if self.fail_at == Some(n) {
                bail!("503 backend error");
            }
            Ok(self.pages[n].clone())
        }

        async fn fetch_document(&self, _id: &str) -> Result<DocsDocument> {
            bail!("not used")
        }
    }

    #[tokio::test]
    async fn test_follows_tokens_and_dedups() {
        let source = PagedSource::new(vec![
            page(&["a", "b"], Some("t1")),
            page(&["b", "c"], Some("t2")),
            page(&["d"], None),
        ]);
        let files = crawl(&source, 100, false, &NoProgress).await.unwrap();
        let ids: Vec<&str> = files.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);

        let requests = source.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].page_token.is_none());
        assert_eq!(requests[1].page_token.as_deref(), Some("t1"));
        assert_eq!(requests[2].page_token.as_deref(), Some("t2"));
        assert!(requests.iter().all(|r| r.page_size == 100 && r.query.is_none()));
    }

    #[tokio::test]
    async fn test_only_documents_sets_query() {
        let source = PagedSource::new(vec![page(&["a"], None)]);
        crawl(&source, 50, true, &NoProgress).await.unwrap();
        let requests = source.requests.lock().unwrap();
        assert_eq!(
            requests[0].query.as_deref(),
            Some("mimeType='application/vnd.google-apps.document'")
        );
    }

    #[tokio::test]
    async fn test_repeated_token_fails() {
        let source = PagedSource::new(vec![
            page(&["a"], Some("loop")),
            page(&["b"], Some("loop")),
            page(&["c"], None),
        ]);
        let err = crawl(&source, 100, false, &NoProgress).await.unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { stage: Stage::Crawl, .. }));
    }

    #[tokio::test]
    async fn test_page_error_fails_crawl() {
        let mut source = PagedSource::new(vec![page(&["a"], Some("t1")), page(&["b"], None)]);
        source.fail_at = Some(1);
        let err = crawl(&source, 100, false, &NoProgress).await.unwrap_err();
        assert!(err.to_string().contains("page 2"));
    }

    #[tokio::test]
    async fn test_empty_listing() {
        let source = PagedSource::new(vec![page(&[], None)]);
        assert!(crawl(&source, 100, false, &NoProgress).await.unwrap().is_empty());
    }
}
