#![forbid(unsafe_code)]

//! Download orchestration: metadata first, media in the background.
//!
//! `submit` answers as soon as the extractor has described the video. The
//! transfer itself runs on its own task, gated by a semaphore so no more than
//! `max_concurrent` transfers are active; queued jobs stay `Pending` until a
//! slot frees.

use std::{path::PathBuf, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::sync::Semaphore;

use crate::{
    config::RuntimeConfig,
    error::{JobError, JobResult},
    error_log::ErrorLog,
    extractor::{DownloadOptions, MediaExtractor, VideoInfo, output_filename, upload_date_to_iso},
    hub::NotificationHub,
    jobs::{Job, JobId, JobTracker},
    metadata::{MetadataStore, VideoMetadataRecord},
};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub storage_root: PathBuf,
    pub max_concurrent: usize,
    /// Zero disables the limit.
    pub transfer_timeout: Duration,
    pub progress_interval: Duration,
    pub progress_step: u8,
    pub options: DownloadOptions,
}

impl OrchestratorSettings {
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            storage_root: config.storage_root.clone(),
            max_concurrent: config.max_concurrent,
            transfer_timeout: config.transfer_timeout,
            progress_interval: config.progress_interval,
            progress_step: config.progress_step,
            options: DownloadOptions {
                format: config.format.clone(),
                container: config.container.clone(),
            },
        }
    }
}

/// What the caller can render before the media arrives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDescriptor {
    pub filename: String,
    pub uploader: String,
    pub title: String,
    #[serde(rename = "thumbnailURL", skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
    /// Relative to the media route.
    pub path: String,
}

impl VideoDescriptor {
    fn from_info(info: &VideoInfo, job_id: JobId, container: &str) -> Self {
        let uploader = info.uploader_name();
        let title = info.display_title();
        let filename = output_filename(&uploader, &title, job_id, container);
        let upload_date = info
            .upload_date
            .as_deref()
            .map(|raw| upload_date_to_iso(raw).unwrap_or_else(|| raw.to_string()));
        Self {
            path: filename.clone(),
            filename,
            uploader,
            title,
            thumbnail_url: info.best_thumbnail(),
            duration_seconds: info.duration,
            upload_date,
        }
    }

    fn record(&self) -> VideoMetadataRecord {
        VideoMetadataRecord {
            uploader: self.uploader.clone(),
            title: self.title.clone(),
            thumbnail_url: self.thumbnail_url.clone(),
            duration_seconds: self.duration_seconds,
            upload_date: self.upload_date.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub job_id: JobId,
    pub video: VideoDescriptor,
}

pub struct DownloadOrchestrator<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for DownloadOrchestrator<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<E> {
    extractor: E,
    tracker: JobTracker,
    hub: Arc<NotificationHub>,
    store: Arc<MetadataStore>,
    errors: Arc<ErrorLog>,
    slots: Arc<Semaphore>,
    settings: OrchestratorSettings,
}

impl<E: MediaExtractor> DownloadOrchestrator<E> {
    pub fn new(
        extractor: E,
        hub: Arc<NotificationHub>,
        store: Arc<MetadataStore>,
        errors: Arc<ErrorLog>,
        settings: OrchestratorSettings,
    ) -> Self {
        let tracker = JobTracker::new(
            hub.clone(),
            settings.progress_interval,
            settings.progress_step,
        );
        Self {
            inner: Arc::new(Inner {
                extractor,
                tracker,
                hub,
                store,
                errors,
                slots: Arc::new(Semaphore::new(
                    settings.max_concurrent.clamp(1, Semaphore::MAX_PERMITS),
                )),
                settings,
            }),
        }
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.inner.hub
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.inner.store
    }

    pub fn errors(&self) -> &Arc<ErrorLog> {
        &self.inner.errors
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        self.inner.tracker.get(id)
    }

    pub fn active_jobs(&self) -> usize {
        self.inner.tracker.active_count()
    }

    pub fn free_slots(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Validates the request, resolves metadata and schedules the transfer.
    /// Any failure here is returned to the caller and no job is tracked.
    pub async fn submit(
        &self,
        source_url: &str,
        job_id: Option<JobId>,
    ) -> JobResult<JobDescriptor> {
        let url = source_url.trim();
        if url.is_empty() {
            return Err(JobError::invalid("URL is required"));
        }
        let id = job_id.unwrap_or_else(JobId::from_clock);
        if self.inner.tracker.get(id).is_some() {
            return Err(JobError::invalid(format!("job {id} is already in progress")));
        }

        tracing::info!(job = %id, url, "starting download");
        let info = match self.inner.extractor.fetch_info(url).await {
            Ok(info) => info,
            Err(err) => {
                self.inner.errors.record("Metadata lookup failed", &err).await;
                return Err(err);
            }
        };

        let video = VideoDescriptor::from_info(&info, id, &self.inner.settings.options.container);
        tracing::info!(
            job = %id,
            title = %video.title,
            filename = %video.filename,
            "resolved metadata"
        );
        self.inner.tracker.register(id, url)?;

        let this = self.clone();
        let url = url.to_string();
        let target = video.clone();
        tokio::spawn(async move { this.transfer(id, url, target).await });

        Ok(JobDescriptor { job_id: id, video })
    }

    async fn transfer(self, id: JobId, url: String, video: VideoDescriptor) {
        let inner = &self.inner;
        let permit = match inner.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                inner.tracker.fail(id, "download queue closed").await;
                return;
            }
        };
        inner.tracker.start(id);

        let output = inner.settings.storage_root.join(&video.filename);
        tracing::info!(job = %id, output = %output.display(), "downloading");
        let download = inner
            .extractor
            .download(&url, &output, &inner.settings.options);
        let timeout = inner.settings.transfer_timeout;
        let result = if timeout.is_zero() {
            download.await
        } else {
            tokio::time::timeout(timeout, download)
                .await
                .unwrap_or(Err(JobError::Timeout(timeout)))
        };
        drop(permit);

        match result {
            Ok(()) => {
                if let Err(err) = inner.store.upsert(&video.filename, video.record()).await {
                    inner.errors.record("Metadata save failed", &err).await;
                }
                inner.tracker.complete(id, video.filename).await;
            }
            Err(err) => {
                inner.errors.record("Video download failed", &err).await;
                inner.tracker.fail(id, err.to_string()).await;
            }
        }
    }

    /// Stops progress tickers and refuses further transfer slots.
    pub async fn shutdown(&self) {
        self.inner.slots.close();
        self.inner.tracker.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{JobEvent, tests::RecordingSink};
    use crate::jobs::JobStatus;
    use anyhow::anyhow;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{TempDir, tempdir};

    #[derive(Clone)]
    struct FakeTool {
        info: VideoInfo,
        fail_lookup: bool,
        fail_download: Option<String>,
        gate: Arc<Semaphore>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl FakeTool {
        fn new() -> Self {
            let info = serde_json::from_str(
                r#"{"title":"Demo Clip","channel":"Acme","duration":125,"upload_date":"20240102",
                    "thumbnails":[{"url":"https://i/sd.jpg","height":480},{"url":"https://i/hd.jpg","height":1080}]}"#,
            )
            .unwrap();
            Self {
                info,
                fail_lookup: false,
                fail_download: None,
                gate: Arc::new(Semaphore::new(0)),
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn release(&self, transfers: usize) {
            self.gate.add_permits(transfers);
        }
    }

    impl MediaExtractor for FakeTool {
        async fn fetch_info(&self, _url: &str) -> JobResult<VideoInfo> {
            if self.fail_lookup {
                return Err(JobError::external(
                    "Metadata lookup failed",
                    anyhow!("ERROR: Unsupported URL"),
                ));
            }
            Ok(self.info.clone())
        }

        async fn download(
            &self,
            _url: &str,
            output: &Path,
            _options: &DownloadOptions,
        ) -> JobResult<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            if let Some(message) = &self.fail_download {
                return Err(JobError::external("Video download failed", anyhow!(message.clone())));
            }
            std::fs::write(output, b"media")
                .map_err(|err| JobError::external("Video download failed", err))
        }
    }

    struct Harness {
        _dir: TempDir,
        root: PathBuf,
        sink: Arc<RecordingSink>,
        orchestrator: DownloadOrchestrator<FakeTool>,
    }

    async fn harness(tool: FakeTool, max_concurrent: usize, timeout: Duration) -> Harness {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let hub = Arc::new(NotificationHub::new());
        let sink = Arc::new(RecordingSink::default());
        hub.register(sink.clone());
        let store = Arc::new(
            MetadataStore::load(&MetadataStore::document_path(&root))
                .await
                .unwrap(),
        );
        let errors = Arc::new(ErrorLog::new(&root));
        let settings = OrchestratorSettings {
            storage_root: root.clone(),
            max_concurrent,
            transfer_timeout: timeout,
            progress_interval: Duration::from_millis(500),
            progress_step: 5,
            options: DownloadOptions {
                format: "best".into(),
                container: "mp4".into(),
            },
        };
        Harness {
            _dir: dir,
            root,
            sink,
            orchestrator: DownloadOrchestrator::new(tool, hub, store, errors, settings),
        }
    }

    async fn wait_until_concluded(orchestrator: &DownloadOrchestrator<FakeTool>, id: JobId) {
        for _ in 0..10_000 {
            if orchestrator.job(id).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never concluded");
    }

    fn events_for(sink: &RecordingSink, id: JobId) -> Vec<JobEvent> {
        sink.events()
            .into_iter()
            .filter(|event| event.job_id() == id)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn successful_submission_streams_progress_then_completion() {
        let tool = FakeTool::new();
        let h = harness(tool.clone(), 2, Duration::from_secs(300)).await;
        let id = JobId(1001);

        let descriptor = h
            .orchestrator
            .submit("https://example.test/v1", Some(id))
            .await
            .unwrap();
        assert_eq!(descriptor.video.title, "Demo Clip");
        assert_eq!(descriptor.video.uploader, "Acme");
        assert_eq!(descriptor.video.filename, "Acme-Demo Clip.mp4");
        assert_eq!(descriptor.video.thumbnail_url.as_deref(), Some("https://i/hd.jpg"));
        assert_eq!(descriptor.video.duration_seconds, Some(125.0));
        let stem = descriptor.video.filename.strip_suffix(".mp4").unwrap();
        assert!(stem.chars().all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '-'));

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(h.orchestrator.job(id).unwrap().status, JobStatus::Running);
        tool.release(1);
        wait_until_concluded(&h.orchestrator, id).await;

        let events = events_for(&h.sink, id);
        let percents: Vec<u8> = events
            .iter()
            .filter_map(|event| match event {
                JobEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(&percents[..3], &[5, 10, 15]);
        assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(percents.iter().filter(|percent| **percent == 100).count(), 1);
        assert_eq!(
            &events[events.len() - 2..],
            &[
                JobEvent::Progress { job_id: id, percent: 100 },
                JobEvent::Completion { job_id: id, success: true, error_message: None },
            ]
        );

        let record = h.orchestrator.store().get("Acme-Demo Clip.mp4").await.unwrap();
        assert_eq!(record.title, "Demo Clip");
        assert_eq!(record.upload_date.as_deref(), Some("2024-01-02T00:00:00Z"));
        assert!(h.root.join("Acme-Demo Clip.mp4").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_lookup_registers_nothing() {
        let mut tool = FakeTool::new();
        tool.fail_lookup = true;
        let h = harness(tool, 2, Duration::from_secs(300)).await;

        let err = h
            .orchestrator
            .submit("https://example.test/v1", Some(JobId(9)))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::ExternalTool { .. }));
        assert_eq!(h.orchestrator.active_jobs(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.sink.events().is_empty());
        let log = std::fs::read_to_string(h.orchestrator.errors().path()).unwrap();
        assert!(log.contains("Metadata lookup failed"));
    }

    #[tokio::test]
    async fn blank_url_is_invalid() {
        let h = harness(FakeTool::new(), 2, Duration::from_secs(300)).await;
        for url in ["", "   "] {
            let err = h.orchestrator.submit(url, Some(JobId(1))).await.unwrap_err();
            assert!(matches!(err, JobError::InvalidRequest(_)));
        }
        assert_eq!(h.orchestrator.active_jobs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_transfer_reports_error_without_100() {
        let mut tool = FakeTool::new();
        tool.fail_download = Some("HTTP Error 403: Forbidden".into());
        let h = harness(tool.clone(), 2, Duration::from_secs(300)).await;
        let id = JobId(77);

        h.orchestrator.submit("https://example.test/v1", Some(id)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        tool.release(1);
        wait_until_concluded(&h.orchestrator, id).await;

        let events = events_for(&h.sink, id);
        assert!(!events.contains(&JobEvent::Progress { job_id: id, percent: 100 }));
        match events.last() {
            Some(JobEvent::Completion { success, error_message, .. }) => {
                assert!(!success);
                assert!(error_message.as_deref().unwrap().contains("HTTP Error 403"));
            }
            other => panic!("unexpected last event {other:?}"),
        }
        assert!(h.orchestrator.store().is_empty().await);
        let log = std::fs::read_to_string(h.orchestrator.errors().path()).unwrap();
        assert!(log.contains("Video download failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn transfers_respect_concurrency_limit() {
        let tool = FakeTool::new();
        let h = harness(tool.clone(), 2, Duration::from_secs(300)).await;
        let ids: Vec<JobId> = (1..=4).map(JobId).collect();
        for id in &ids {
            h.orchestrator
                .submit("https://example.test/v1", Some(*id))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let running = ids
            .iter()
            .filter(|id| h.orchestrator.job(**id).unwrap().status == JobStatus::Running)
            .count();
        assert_eq!(running, 2);
        assert_eq!(h.orchestrator.free_slots(), 0);

        tool.release(4);
        for id in &ids {
            wait_until_concluded(&h.orchestrator, *id).await;
        }
        assert_eq!(tool.peak.load(Ordering::SeqCst), 2);
        assert_eq!(h.orchestrator.free_slots(), 2);
    }

    #[tokio::test]
    async fn oversized_concurrency_limit_is_clamped() {
        let h = harness(FakeTool::new(), usize::MAX, Duration::from_secs(300)).await;
        assert_eq!(h.orchestrator.free_slots(), Semaphore::MAX_PERMITS);

        let h = harness(FakeTool::new(), 0, Duration::from_secs(300)).await;
        assert_eq!(h.orchestrator.free_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_transfer_times_out() {
        let tool = FakeTool::new();
        let h = harness(tool, 1, Duration::from_secs(2)).await;
        let id = JobId(5);
        h.orchestrator.submit("https://example.test/v1", Some(id)).await.unwrap();
        wait_until_concluded(&h.orchestrator, id).await;

        match events_for(&h.sink, id).last() {
            Some(JobEvent::Completion { success: false, error_message, .. }) => {
                assert!(error_message.as_deref().unwrap().contains("timed out"));
            }
            other => panic!("unexpected last event {other:?}"),
        }
        assert_eq!(h.orchestrator.free_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_id_cannot_be_reused() {
        let tool = FakeTool::new();
        let h = harness(tool.clone(), 2, Duration::from_secs(300)).await;
        h.orchestrator.submit("https://example.test/v1", Some(JobId(3))).await.unwrap();
        let err = h
            .orchestrator
            .submit("https://example.test/v2", Some(JobId(3)))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidRequest(_)));
        tool.release(1);
        wait_until_concluded(&h.orchestrator, JobId(3)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_client_id_is_generated() {
        let tool = FakeTool::new();
        let h = harness(tool.clone(), 2, Duration::from_secs(300)).await;
        let first = h.orchestrator.submit("https://example.test/v1", None).await.unwrap();
        let second = h.orchestrator.submit("https://example.test/v2", None).await.unwrap();
        assert_ne!(first.job_id, second.job_id);
        assert!(h.orchestrator.job(first.job_id).is_some());
        assert!(h.orchestrator.job(second.job_id).is_some());
        tool.release(2);
        wait_until_concluded(&h.orchestrator, first.job_id).await;
        wait_until_concluded(&h.orchestrator, second.job_id).await;
    }
}
