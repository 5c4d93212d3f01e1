#![forbid(unsafe_code)]

//! Metadata persistence layer for TubeVault.
//!
//! The whole library is one JSON object keyed by media filename. Every write
//! replaces the full document, so writers are serialized behind a single async
//! mutex that is held across read, modify and persist.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{JobError, JobResult};

pub const METADATA_DIR: &str = "metadata";
pub const METADATA_FILE: &str = "metadata.json";

/// Descriptive fields recorded for a completed download.
///
/// Aliases accept documents written by earlier releases, which used
/// `youtuber`, `thumbnail` and `duration` as keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadataRecord {
    #[serde(alias = "youtuber", default)]
    pub uploader: String,
    #[serde(default)]
    pub title: String,
    #[serde(
        rename = "thumbnailURL",
        alias = "thumbnail",
        skip_serializing_if = "Option::is_none"
    )]
    pub thumbnail_url: Option<String>,
    #[serde(alias = "duration", skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
}

pub type MetadataDocument = BTreeMap<String, VideoMetadataRecord>;

/// Durable filename → record mapping.
#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    records: Mutex<MetadataDocument>,
}

impl MetadataStore {
    /// Location of the document under a storage root.
    pub fn document_path(storage_root: &Path) -> PathBuf {
        storage_root.join(METADATA_DIR).join(METADATA_FILE)
    }

    /// Reads the persisted document, creating an empty one when absent.
    /// A document that exists but does not parse is a hard error: corrupt data
    /// is never silently replaced.
    pub async fn load(path: &Path) -> JobResult<Self> {
        let records = load_document(path).await?;
        tracing::info!(
            path = %path.display(),
            records = records.len(),
            "loaded metadata"
        );
        Ok(Self {
            path: path.to_path_buf(),
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts or replaces the record for `filename` and rewrites the entire
    /// document. The in-memory map only changes once the write succeeded.
    pub async fn upsert(&self, filename: &str, record: VideoMetadataRecord) -> JobResult<()> {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        next.insert(filename.to_string(), record);
        write_document(&self.path, &next).await?;
        *records = next;
        tracing::info!(filename, "saved metadata");
        Ok(())
    }

    pub async fn get(&self, filename: &str) -> Option<VideoMetadataRecord> {
        self.records.lock().await.get(filename).cloned()
    }

    pub async fn snapshot(&self) -> MetadataDocument {
        self.records.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

async fn load_document(path: &Path) -> JobResult<MetadataDocument> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))
            .map_err(|err| JobError::persistence("metadata document is malformed", err)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let empty = MetadataDocument::new();
            write_document(path, &empty).await?;
            tracing::info!(path = %path.display(), "created new metadata file");
            Ok(empty)
        }
        Err(err) => Err(JobError::persistence(
            format!("reading {}", path.display()),
            err,
        )),
    }
}

async fn write_document(path: &Path, records: &MetadataDocument) -> JobResult<()> {
    write_json_atomic(path, records)
        .await
        .map_err(|err| JobError::persistence("writing metadata document", err))
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&tmp_path, payload)
        .await
        .with_context(|| format!("writing {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
