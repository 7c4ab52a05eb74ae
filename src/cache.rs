//! Snapshot cache.
//!
//! Each pipeline stage persists its complete output as one JSON file,
//! `<dir>/<stage>.json`:
//!
//! ```json
//! { "version": 1, "stage": "embedded", "createdAt": "...",
//!   "checksum": "<sha256 of payload>", "payload": ... }
//! ```
//!
//! The checksum covers the payload text exactly as it appears in the file,
//! so verification never depends on how numbers re-serialize.
//!
//! Saves write `<stage>.json.tmp`, fsync it, then rename it over the
//! target, so a reader sees either the previous snapshot or the new one.
//! A missing file is a cache miss. A file that exists but cannot be trusted
//! is [`PipelineError::CorruptCache`], never a miss.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};

use drive_index_core::models::{IndexRecord, RecordProperties};

use crate::error::{PipelineError, PipelineResult};

/// Envelope format version written by this build.
pub const CACHE_VERSION: u32 = 1;

/// A cached pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStage {
    /// Record shells, before embedding.
    Extracted,
    /// Embedded records plus shells still pending embedding.
    Embedded,
    /// Full cleaned text of every text document.
    FullText,
}

impl CacheStage {
    pub const ALL: [CacheStage; 3] = [CacheStage::Extracted, CacheStage::Embedded, CacheStage::FullText];

    pub fn key(&self) -> &'static str {
        match self {
            CacheStage::Extracted => "extracted",
            CacheStage::Embedded => "embedded",
            CacheStage::FullText => "full-text",
        }
    }
}

impl fmt::Display for CacheStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for CacheStage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        CacheStage::ALL
            .into_iter()
            .find(|stage| stage.key() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown cache stage: '{}'. Use extracted, embedded, or full-text.", s))
    }
}

/// Payload of the `embedded` stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedSnapshot {
    pub model: String,
    pub dims: usize,
    pub records: Vec<IndexRecord>,
    /// Shells whose embedding failed; retried on the next run.
    #[serde(default)]
    pub pending: Vec<RecordProperties>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    version: u32,
    stage: String,
    created_at: DateTime<Utc>,
    checksum: String,
    payload: Box<RawValue>,
}

/// One present snapshot, as listed by [`SnapshotCache::status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub stage: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub created_at: Option<DateTime<Utc>>,
    /// `None` when the snapshot is valid, otherwise why it is not.
    pub problem: Option<String>,
}

fn checksum(payload: &RawValue) -> String {
    format!("{:x}", Sha256::digest(payload.get().as_bytes()))
}

pub struct SnapshotCache {
    dir: PathBuf,
}

impl SnapshotCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, stage: CacheStage) -> PathBuf {
        self.dir.join(format!("{}.json", stage.key()))
    }

    fn tmp_path(&self, stage: CacheStage) -> PathBuf {
        self.dir.join(format!("{}.json.tmp", stage.key()))
    }

    /// Load a stage's payload. `Ok(None)` only when the file does not exist.
    pub fn load<T: DeserializeOwned>(&self, stage: CacheStage) -> PipelineResult<Option<T>> {
        let path = self.path(stage);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PipelineError::CacheIo { path, source }),
        };

        let envelope = verify(stage, &bytes).map_err(|reason| corrupt(stage, reason))?;
        let payload = serde_json::from_str(envelope.payload.get())
            .map_err(|e| corrupt(stage, format!("payload does not match stage schema: {}", e)))?;
        tracing::debug!(stage = stage.key(), created_at = %envelope.created_at, "cache hit");
        Ok(Some(payload))
    }

    /// Atomically replace a stage's snapshot.
    pub fn save<T: Serialize>(&self, stage: CacheStage, payload: &T) -> PipelineResult<()> {
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PipelineError::CacheIo { path, source }
        };

        fs::create_dir_all(&self.dir).map_err(io(&self.dir))?;

        let payload = serde_json::to_string(payload)
            .and_then(RawValue::from_string)
            .map_err(|e| PipelineError::backend(crate::error::Stage::Cache, e))?;
        let envelope = Envelope {
            version: CACHE_VERSION,
            stage: stage.key().to_string(),
            created_at: Utc::now(),
            checksum: checksum(&payload),
            payload,
        };
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| PipelineError::backend(crate::error::Stage::Cache, e))?;

        let tmp = self.tmp_path(stage);
        let target = self.path(stage);
        {
            let mut file = fs::File::create(&tmp).map_err(io(&tmp))?;
            file.write_all(&bytes).map_err(io(&tmp))?;
            file.sync_all().map_err(io(&tmp))?;
        }
        fs::rename(&tmp, &target).map_err(io(&target))?;

        tracing::debug!(stage = stage.key(), bytes = bytes.len(), "snapshot saved");
        Ok(())
    }

    /// Present snapshots, in stage order.
    pub fn status(&self) -> PipelineResult<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        for stage in CacheStage::ALL {
            let path = self.path(stage);
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(PipelineError::CacheIo { path, source }),
            };
            let (created_at, problem) = match verify(stage, &bytes) {
                Ok(envelope) => (Some(envelope.created_at), None),
                Err(reason) => (None, Some(reason)),
            };
            entries.push(CacheEntry {
                stage: stage.key().to_string(),
                path,
                bytes: bytes.len() as u64,
                created_at,
                problem,
            });
        }
        Ok(entries)
    }

    /// Remove one stage's snapshot, or all of them. Leftover temp files
    /// are removed too. Returns the paths deleted.
    pub fn clear(&self, stage: Option<CacheStage>) -> PipelineResult<Vec<PathBuf>> {
        let stages: Vec<CacheStage> = match stage {
            Some(s) => vec![s],
            None => CacheStage::ALL.to_vec(),
        };
        let mut removed = Vec::new();
        for stage in stages {
            for path in [self.path(stage), self.tmp_path(stage)] {
                match fs::remove_file(&path) {
                    Ok(()) => removed.push(path),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(source) => return Err(PipelineError::CacheIo { path, source }),
                }
            }
        }
        Ok(removed)
    }
}

fn corrupt(stage: CacheStage, reason: String) -> PipelineError {
    PipelineError::CorruptCache {
        snapshot: stage.key().to_string(),
        reason,
    }
}

fn verify(stage: CacheStage, bytes: &[u8]) -> Result<Envelope, String> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| format!("unreadable envelope: {}", e))?;
    if envelope.version != CACHE_VERSION {
        return Err(format!(
            "unsupported version {} (expected {})",
            envelope.version, CACHE_VERSION
        ));
    }
    if envelope.stage != stage.key() {
        return Err(format!("envelope is for stage '{}'", envelope.stage));
    }
    if checksum(&envelope.payload) != envelope.checksum {
        return Err("checksum mismatch".to_string());
    }
    Ok(envelope)
}
