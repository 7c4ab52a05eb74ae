//! Document source: the Drive v3 file listing and the Docs v1 document
//! fetch.
//!
//! [`DocumentSource`] is the seam the crawler and content pipeline depend
//! on; [`DriveClient`] is the HTTP implementation. Authentication is a
//! bearer token read from the environment variable named in
//! `source.token_env`.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use drive_index_core::mime::GOOGLE_DOCUMENT;
use drive_index_core::models::{DocumentMetadata, Owner, RawPermission};

use crate::config::SourceConfig;
use crate::render::DocsDocument;

/// Field selector for `files.list`.
pub const FILE_FIELDS: &str = "nextPageToken, files(id, webViewLink, createdTime, modifiedTime, name, owners, fileExtension, mimeType, permissions(id, type, emailAddress))";

/// One `files.list` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    pub page_size: u32,
    pub page_token: Option<String>,
    pub fields: String,
    /// Drive search expression (`q`).
    pub query: Option<String>,
}

impl ListRequest {
    pub fn first_page(page_size: u32, only_documents: bool) -> Self {
        Self {
            page_size,
            page_token: None,
            fields: FILE_FIELDS.to_string(),
            query: only_documents.then(|| format!("mimeType='{}'", GOOGLE_DOCUMENT)),
        }
    }
}

/// A `files` resource as returned by the Drive API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub web_view_link: Option<String>,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub file_extension: Option<String>,
    #[serde(default)]
    pub owners: Vec<Owner>,
    #[serde(default)]
    pub permissions: Option<Vec<RawPermission>>,
}

impl From<DriveFile> for DocumentMetadata {
    fn from(file: DriveFile) -> Self {
        DocumentMetadata {
            id: file.id,
            title: file.name,
            url: file.web_view_link,
            mime_type: file.mime_type,
            created_time: file.created_time,
            modified_time: file.modified_time,
            owner: file.owners.into_iter().next(),
            raw_permissions: file.permissions,
        }
    }
}

/// One page of a `files.list` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePage {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Paginated file listing plus per-document content fetch.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn list_files(&self, req: &ListRequest) -> Result<FilePage>;
    async fn fetch_document(&self, id: &str) -> Result<DocsDocument>;
}

/// HTTP client for the Drive and Docs REST APIs.
pub struct DriveClient {
    client: reqwest::Client,
    drive_url: String,
    docs_url: String,
    token: String,
    max_retries: u32,
}

impl DriveClient {
    /// Build a client from `[source]` config.
    ///
    /// # Errors
    ///
    /// Returns an error if the token environment variable is not set.
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env)
            .map_err(|_| anyhow!("{} environment variable not set", config.token_env))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            drive_url: config.drive_url.trim_end_matches('/').to_string(),
            docs_url: config.docs_url.trim_end_matches('/').to_string(),
            token,
            max_retries: config.max_retries,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .get(url)
                .bearer_auth(&self.token)
                .query(query)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json::<T>().await?);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        tracing::warn!(%status, attempt, url, "retryable source error");
                        last_err = Some(anyhow!("source API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("source API error {}: {}", status, body_text);
                }
                Err(e) => {
                    tracing::warn!(attempt, url, error = %e, "source request failed");
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("source request failed after retries")))
    }
}

#[async_trait]
impl DocumentSource for DriveClient {
    async fn list_files(&self, req: &ListRequest) -> Result<FilePage> {
        let mut query = vec![
            ("pageSize", req.page_size.to_string()),
            ("fields", req.fields.clone()),
        ];
        if let Some(q) = &req.query {
            query.push(("q", q.clone()));
        }
        if let Some(token) = &req.page_token {
            query.push(("pageToken", token.clone()));
        }
        self.get_json(&format!("{}/files", self.drive_url), &query)
            .await
    }

    async fn fetch_document(&self, id: &str) -> Result<DocsDocument> {
        self.get_json(&format!("{}/documents/{}", self.docs_url, id), &[])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_page_request() {
        let req = ListRequest::first_page(100, true);
        assert_eq!(req.page_size, 100);
        assert_eq!(
            req.query.as_deref(),
            Some("mimeType='application/vnd.google-apps.document'")
        );
        assert!(req.page_token.is_none());
        assert!(ListRequest::first_page(100, false).query.is_none());
    }

    #[test]
    fn test_drive_file_into_metadata() {
        let page: FilePage = serde_json::from_value(serde_json::json!({
            "nextPageToken": "t2",
            "files": [{
                "id": "f1",
                "name": "Plan",
                "webViewLink": "https://docs.google.com/document/d/f1",
                "mimeType": "application/vnd.google-apps.document",
                "modifiedTime": "2024-03-01T10:00:00.000Z",
                "owners": [
                    {"displayName": "Ada", "emailAddress": "ada@x.com"},
                    {"displayName": "Bob"}
                ],
                "permissions": [{"id": "p1", "type": "user", "emailAddress": "ada@x.com"}]
            }]
        }))
        .unwrap();
        assert_eq!(page.next_page_token.as_deref(), Some("t2"));

        let meta: DocumentMetadata = page.files.into_iter().next().unwrap().into();
        assert_eq!(meta.title, "Plan");
        assert_eq!(meta.owner.unwrap().display_name.as_deref(), Some("Ada"));
        assert_eq!(meta.raw_permissions.unwrap().len(), 1);
        assert!(meta.modified_time.is_some());
        assert!(meta.created_time.is_none());
    }

    #[test]
    fn test_missing_owners_and_permissions() {
        let file: DriveFile =
            serde_json::from_value(serde_json::json!({"id": "f2", "mimeType": "image/png"})).unwrap();
        let meta: DocumentMetadata = file.into();
        assert!(meta.owner.is_none());
        assert!(meta.raw_permissions.is_none());
        assert!(meta.url.is_none());
    }
}
