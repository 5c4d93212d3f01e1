#![forbid(unsafe_code)]

//! External extraction tool (yt-dlp) and helpers for the metadata it returns.

use std::{
    ffi::OsString,
    future::Future,
    path::{Path, PathBuf},
    process::{Output, Stdio},
};

use anyhow::{Context, anyhow};
use chrono::NaiveDate;
use serde::Deserialize;
use tokio::process::Command;

use crate::{
    error::{JobError, JobResult},
    jobs::JobId,
};

/// Per-transfer options taken from configuration.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub format: String,
    pub container: String,
}

/// Black-box tool that resolves metadata and transfers media.
pub trait MediaExtractor: Send + Sync + 'static {
    fn fetch_info(&self, url: &str) -> impl Future<Output = JobResult<VideoInfo>> + Send;

    fn download(
        &self,
        url: &str,
        output: &Path,
        options: &DownloadOptions,
    ) -> impl Future<Output = JobResult<()>> + Send;
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn iter(&self) -> Box<dyn Iterator<Item = &T> + '_> {
        match self {
            OneOrMany::One(value) => Box::new(std::iter::once(value)),
            OneOrMany::Many(values) => Box::new(values.iter()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum CreatorInfo {
    Name(String),
    Object {
        name: Option<String>,
        title: Option<String>,
    },
}

impl CreatorInfo {
    fn name(&self) -> Option<&str> {
        match self {
            CreatorInfo::Name(value) => Some(value.as_str()),
            CreatorInfo::Object { name, title } => name.as_deref().or(title.as_deref()),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Thumbnail {
    pub url: Option<String>,
    pub height: Option<i64>,
    pub width: Option<i64>,
}

/// Subset of the `--dump-single-json` payload the service reads. Everything
/// is optional because extractors differ wildly in what they fill in.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct VideoInfo {
    pub title: Option<String>,
    pub fulltitle: Option<String>,
    pub channel: Option<OneOrMany<CreatorInfo>>,
    pub uploader: Option<OneOrMany<CreatorInfo>>,
    pub duration: Option<f64>,
    pub upload_date: Option<String>,
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
}

impl VideoInfo {
    pub fn display_title(&self) -> String {
        self.title
            .as_deref()
            .or(self.fulltitle.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("Untitled")
            .to_string()
    }

    /// Channel name, falling back to the uploader.
    pub fn uploader_name(&self) -> String {
        [&self.channel, &self.uploader]
            .into_iter()
            .flatten()
            .flat_map(|creators| creators.iter())
            .filter_map(CreatorInfo::name)
            .map(str::trim)
            .find(|name| !name.is_empty())
            .unwrap_or("Unknown")
            .to_string()
    }

    pub fn best_thumbnail(&self) -> Option<String> {
        best_thumbnail(&self.thumbnails).or_else(|| {
            self.thumbnail
                .clone()
                .filter(|url| !url.trim().is_empty())
        })
    }
}

/// Picks the tallest thumbnail; the first one wins when several share the
/// maximum height. Entries without a URL are ignored.
pub fn best_thumbnail(thumbnails: &[Thumbnail]) -> Option<String> {
    let mut best: Option<(&Thumbnail, i64)> = None;
    for thumb in thumbnails {
        if thumb.url.as_deref().is_none_or(|url| url.trim().is_empty()) {
            continue;
        }
        let height = thumb.height.unwrap_or(0);
        match best {
            Some((_, best_height)) if height <= best_height => {}
            _ => best = Some((thumb, height)),
        }
    }
    best.and_then(|(thumb, _)| thumb.url.clone())
}

/// Keeps ASCII letters, digits, spaces and hyphens; every whitespace
/// character becomes a plain space.
pub fn sanitize_component(value: &str) -> String {
    value
        .chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                Some(c)
            } else if c.is_whitespace() {
                Some(' ')
            } else {
                None
            }
        })
        .collect()
}

/// `<uploader>-<title>.<container>` with the stem sanitized. Falls back to
/// `video-<job id>` when nothing printable survives.
pub fn output_filename(uploader: &str, title: &str, job_id: JobId, container: &str) -> String {
    let stem = sanitize_component(&format!("{uploader}-{title}"));
    let stem = stem.trim().trim_matches('-').trim();
    let stem = if stem.is_empty() {
        format!("video-{job_id}")
    } else {
        stem.to_string()
    };
    format!("{stem}.{container}")
}

/// Converts yt-dlp's `YYYYMMDD` upload date format into ISO-8601.
pub fn upload_date_to_iso(value: &str) -> Option<String> {
    if value.len() != 8 || !value.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year = &value[0..4];
    let month = &value[4..6];
    let day = &value[6..8];
    let naive = NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?);
    let naive = naive?.and_hms_opt(0, 0, 0)?;
    Some(format!("{}Z", naive.format("%Y-%m-%dT%H:%M:%S")))
}

/// Process-backed yt-dlp adapter. The child is killed when its future is
/// dropped, so a timed-out transfer does not linger.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn metadata_args(url: &str) -> Vec<OsString> {
        [
            "--dump-single-json",
            "--skip-download",
            "--no-warnings",
            "--no-progress",
            "--no-check-certificates",
            "--prefer-free-formats",
            "--no-playlist",
        ]
        .into_iter()
        .map(OsString::from)
        .chain(std::iter::once(OsString::from(url)))
        .collect()
    }

    fn download_args(url: &str, output: &Path, options: &DownloadOptions) -> Vec<OsString> {
        vec![
            "--format".into(),
            options.format.clone().into(),
            "--merge-output-format".into(),
            options.container.clone().into(),
            "--no-progress".into(),
            "--no-warnings".into(),
            "--no-playlist".into(),
            "--output".into(),
            output.as_os_str().to_os_string(),
            url.into(),
        ]
    }

    async fn run(&self, args: Vec<OsString>) -> anyhow::Result<Output> {
        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("launching {}", self.program.display()))?;
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .unwrap_or("no error output");
        Err(anyhow!(
            "{} exited with {}: {}",
            self.program.display(),
            output.status,
            reason
        ))
    }
}

impl MediaExtractor for YtDlp {
    async fn fetch_info(&self, url: &str) -> JobResult<VideoInfo> {
        let output = self
            .run(Self::metadata_args(url))
            .await
            .map_err(|err| JobError::external("Metadata lookup failed", err))?;
        serde_json::from_slice(&output.stdout)
            .context("parsing metadata JSON")
            .map_err(|err| JobError::external("Metadata lookup failed", err))
    }

    async fn download(&self, url: &str, output: &Path, options: &DownloadOptions) -> JobResult<()> {
        self.run(Self::download_args(url, output, options))
            .await
            .map(|_| ())
            .map_err(|err| JobError::external("Video download failed", err))
    }
}
