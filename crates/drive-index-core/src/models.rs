//! Core data models used throughout drive-index.
//!
//! These types represent the crawled document metadata, the normalized
//! permission sets, and the records that flow through extraction, embedding,
//! caching, and the hybrid store.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source system tag written to every record's `app` property.
pub const SOURCE_APP: &str = "google";

/// Owner of a source document. Every field may be missing upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub photo_link: Option<String>,
}

/// A raw access-control entry as returned by the document source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPermission {
    #[serde(default)]
    pub id: Option<String>,
    /// `"user"`, `"group"`, `"domain"`, `"anyone"`, ...
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub email_address: Option<String>,
}

impl RawPermission {
    pub fn user(email: &str) -> Self {
        Self {
            id: None,
            kind: "user".to_string(),
            email_address: Some(email.to_string()),
        }
    }
}

/// Metadata for one source document, fixed for the duration of a crawl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub id: String,
    pub title: String,
    pub url: Option<String>,
    pub mime_type: String,
    pub created_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
    /// First listed owner, if the source returned any.
    pub owner: Option<Owner>,
    /// `None` when the source omitted the permissions field entirely.
    pub raw_permissions: Option<Vec<RawPermission>>,
}

/// The set of principals allowed to read a record.
///
/// Serialized as a sorted array of principal strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<String>);

impl PermissionSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn insert(&mut self, principal: impl Into<String>) -> bool {
        self.0.insert(principal.into())
    }

    pub fn contains(&self, principal: &str) -> bool {
        self.0.contains(principal)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Document kind stored in the `entity` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Entity {
    Docs,
    Sheets,
    Slides,
    Folder,
    /// Any file kind without a dedicated mapping.
    DriveFile,
}

impl Entity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Docs => "docs",
            Entity::Sheets => "sheets",
            Entity::Slides => "slides",
            Entity::Folder => "folder",
            Entity::DriveFile => "driveFile",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Entity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "docs" => Ok(Entity::Docs),
            "sheets" => Ok(Entity::Sheets),
            "slides" => Ok(Entity::Slides),
            "folder" => Ok(Entity::Folder),
            "driveFile" => Ok(Entity::DriveFile),
            other => bail!(
                "Unknown entity: '{}'. Use docs, sheets, slides, folder, or driveFile.",
                other
            ),
        }
    }
}

/// Identity of a record within one index generation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordKey {
    pub doc_id: String,
    pub chunk_index: i64,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.doc_id, self.chunk_index)
    }
}

/// Stored properties of an index record; everything except the vector.
///
/// A `RecordProperties` on its own is a record "shell": produced by the
/// content pipeline and waiting for the embedding stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordProperties {
    pub doc_id: String,
    /// `0` for title-only records.
    pub chunk_index: i64,
    pub title: String,
    /// Empty for title-only records.
    pub chunk: String,
    pub url: String,
    pub app: String,
    pub entity: Entity,
    pub mime_type: String,
    pub owner: Option<String>,
    pub owner_email: Option<String>,
    pub owner_photo: Option<String>,
    pub permissions: PermissionSet,
}

impl RecordProperties {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            doc_id: self.doc_id.clone(),
            chunk_index: self.chunk_index,
        }
    }
}

/// The atomic unit written to the hybrid store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub properties: RecordProperties,
    pub vector: Vec<f32>,
}

impl IndexRecord {
    pub fn key(&self) -> RecordKey {
        self.properties.key()
    }
}
