#![forbid(unsafe_code)]

//! Library listing: files present in the storage directory merged with
//! whatever the metadata store knows about them.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use walkdir::WalkDir;

use crate::{error_log::ERROR_LOG_FILE, metadata::MetadataDocument};

const PARTIAL_SUFFIXES: &[&str] = &[".part", ".ytdl", ".tmp"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryEntry {
    pub filename: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "thumbnailURL", skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
}

/// Reports whether a directory entry belongs to the service rather than the
/// library.
pub fn is_reserved_name(name: &str) -> bool {
    name.starts_with('.')
        || name.starts_with("metadata")
        || name == ERROR_LOG_FILE
        || PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// Names of the media files currently on disk, sorted.
pub fn list_backing_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("reading {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if is_reserved_name(name) {
            continue;
        }
        files.push((name.to_string(), entry.into_path()));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// Builds the listing. Files without a record still appear with only their
/// filesystem attributes; records without a file never appear. Files that
/// vanish between enumeration and stat are skipped and returned as warnings.
pub fn list_library(
    dir: &Path,
    records: &MetadataDocument,
) -> Result<(Vec<LibraryEntry>, Vec<anyhow::Error>)> {
    let mut entries = Vec::new();
    let mut skipped = Vec::new();
    for (filename, path) in list_backing_files(dir)? {
        match std::fs::metadata(&path) {
            Ok(meta) => {
                let created = meta
                    .created()
                    .or_else(|_| meta.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                let record = records.get(&filename);
                entries.push(LibraryEntry {
                    size_bytes: meta.len(),
                    created_at: created,
                    uploader: record.map(|record| record.uploader.clone()),
                    title: record.map(|record| record.title.clone()),
                    thumbnail_url: record.and_then(|record| record.thumbnail_url.clone()),
                    duration_seconds: record.and_then(|record| record.duration_seconds),
                    upload_date: record.and_then(|record| record.upload_date.clone()),
                    filename,
                });
            }
            Err(err) => {
                let context = format!("Failed to get stats for file: {filename}");
                skipped.push(anyhow::Error::new(err).context(context));
            }
        }
    }
    Ok((entries, skipped))
}
